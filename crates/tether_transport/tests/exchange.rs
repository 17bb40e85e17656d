//! Drives two connections against each other through a loopback envelope
//! and sink, exercising the end-to-end delivery scenarios.

#![expect(missing_docs, reason = "testing")]

use {
    bytes::Bytes,
    octs::{Buf, Read, Write},
    tether_transport::{
        Connection, ConnectionConfig, DatagramSink, DisconnectReason, Envelope, NoPadding, Opened,
        RecvMessage, SHUTDOWN_TICK_COUNT, StreamId, TransportHandler,
        packet::{AckField, AckId, AckIdTag, FragStart, MessageHeader, SuperOpcode, TripTime},
    },
};

/// Overhead the loopback envelope appends: 4 timestamp bytes + 7 filler.
const ENVELOPE_OVERHEAD: usize = 11;
const FILLER: u8 = 0xEE;

/// Loopback envelope: no encryption, but a real overhead and an embedded
/// send timestamp, like the production envelope's reconstructed IV.
struct LoopEnvelope {
    now_ms: u32,
}

impl Envelope for LoopEnvelope {
    fn overhead(&self) -> usize {
        ENVELOPE_OVERHEAD
    }

    fn seal(&mut self, datagram: &mut Vec<u8>) -> bool {
        datagram.extend_from_slice(&self.now_ms.to_le_bytes());
        datagram.extend_from_slice(&[FILLER; 7]);
        true
    }

    fn open(&mut self, datagram: &mut [u8]) -> Option<Opened> {
        let len = datagram.len().checked_sub(ENVELOPE_OVERHEAD)?;
        if datagram[len + 4..] != [FILLER; 7] {
            return None;
        }
        let send_time_ms = u32::from_le_bytes(datagram[len..len + 4].try_into().ok()?);
        Some(Opened { len, send_time_ms })
    }

    fn generate_key(&mut self, label: &str, out: &mut [u8]) -> bool {
        // both peers share the session key, so derivation only needs to be
        // deterministic per label
        let seed = label
            .bytes()
            .fold(0x9e37_79b9u32, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(u32::from(b))
            });
        for (i, byte) in out.iter_mut().enumerate() {
            let word = seed.wrapping_add(i as u32 / 4).wrapping_mul(0x85eb_ca6b);
            *byte = (word >> ((i % 4) * 8)) as u8;
        }
        true
    }
}

#[derive(Default)]
struct VecSink(Vec<Vec<u8>>);

impl DatagramSink for VecSink {
    fn post_datagrams(&mut self, datagrams: &mut Vec<Vec<u8>>) {
        self.0.append(datagrams);
    }
}

#[derive(Default)]
struct Recorder {
    msgs: Vec<RecvMessage>,
    huge: Vec<(StreamId, Vec<u8>)>,
    probes: Vec<usize>,
    disconnects: Vec<DisconnectReason>,
}

impl TransportHandler for Recorder {
    fn on_messages(&mut self, msgs: &mut Vec<RecvMessage>) {
        self.msgs.append(msgs);
    }

    fn on_partial_huge(&mut self, stream: StreamId, piece: &[u8]) {
        self.huge.push((stream, piece.to_vec()));
    }

    fn on_mtu_probe(&mut self, payload_len: usize) {
        self.probes.push(payload_len);
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        self.disconnects.push(reason);
    }
}

struct Peer {
    conn: Connection,
    env: LoopEnvelope,
    sink: VecSink,
    rec: Recorder,
}

/// MTU sized so one datagram carries 1200 plaintext payload bytes.
const MTU: usize = 1200 + 20 + 8 + ENVELOPE_OVERHEAD;
const MAX_PAYLOAD: usize = 1200;

impl Peer {
    fn new(initiator: bool) -> Self {
        let mut env = LoopEnvelope { now_ms: 0 };
        let config = ConnectionConfig {
            initiator,
            ipv6: false,
            mtu: MTU,
        };
        let conn = Connection::new(&config, &mut env, NoPadding, 0).unwrap();
        Self {
            conn,
            env,
            sink: VecSink::default(),
            rec: Recorder::default(),
        }
    }

    fn tick(&mut self, now_ms: u32) {
        self.env.now_ms = now_ms;
        self.conn
            .tick(now_ms, &mut self.env, &mut self.sink, &mut self.rec);
    }

    fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sink.0)
    }

    fn deliver(&mut self, datagrams: Vec<Vec<u8>>, now_ms: u32) {
        self.env.now_ms = now_ms;
        for mut datagram in datagrams {
            self.conn
                .on_datagram(
                    &mut datagram,
                    now_ms,
                    &mut self.env,
                    &mut self.sink,
                    &mut self.rec,
                )
                .unwrap();
        }
    }

    fn payloads(&self) -> Vec<&[u8]> {
        self.rec.msgs.iter().map(|msg| msg.payload.as_ref()).collect()
    }
}

/// The initial ACK-IDs the initiator assigns, per stream; mirrors the
/// connection's own derivation so tests can predict wire contents.
fn initiator_ids() -> [AckId; 4] {
    let mut env = LoopEnvelope { now_ms: 0 };
    let mut material = [0u8; 16];
    assert!(env.generate_key("ws2_32.dll", &mut material));
    let mut ids = [AckId(0); 4];
    for (i, id) in ids.iter_mut().enumerate() {
        *id = AckId(u32::from_le_bytes(material[i * 4..i * 4 + 4].try_into().unwrap()));
    }
    ids
}

/// Decodes the ACK fields out of a sealed ACK datagram.
fn decode_ack(datagram: &[u8]) -> Vec<AckField> {
    let mut env = LoopEnvelope { now_ms: 0 };
    let mut buf = datagram.to_vec();
    let opened = env.open(&mut buf).expect("sealed by the loopback envelope");
    let mut rdr = Bytes::copy_from_slice(&buf[..opened.len]);

    while rdr.has_remaining() {
        let header = rdr.read::<MessageHeader>().unwrap();
        if header.with_ack_id {
            let _ = rdr.read::<AckIdTag>().unwrap();
        }
        let mut body = rdr.read_next(header.len).unwrap();
        if !header.reliable && header.sop == SuperOpcode::Ack {
            let _ = body.read::<TripTime>().unwrap();
            let mut fields = Vec::new();
            while body.has_remaining() {
                fields.push(body.read::<AckField>().unwrap());
            }
            return fields;
        }
    }
    panic!("no ACK message in datagram");
}

const ROLLUP_MASK: u32 = (1 << 21) - 1;

#[test]
fn basic_reliable_ordering() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let stream = StreamId::new(1).unwrap();
    let expected_first = initiator_ids()[1];

    for payload in [&[0x41u8][..], &[0x42], &[0x43]] {
        a.conn
            .write_reliable(stream, Bytes::copy_from_slice(payload))
            .unwrap();
    }
    a.tick(1000);

    let datagrams = a.take_datagrams();
    assert_eq!(1, datagrams.len(), "three small writes share one datagram");
    b.deliver(datagrams, 1040);
    assert_eq!(vec![&[0x41][..], &[0x42], &[0x43]], b.payloads());

    b.tick(1060);
    let acks = b.take_datagrams();
    assert_eq!(1, acks.len());
    let fields = decode_ack(&acks[0]);
    assert_eq!(
        vec![AckField::Rollup {
            stream,
            partial: expected_first.0.wrapping_add(3) & ROLLUP_MASK,
        }],
        fields
    );

    // the ack releases everything: no retransmissions ever fire, even
    // well past the loss timeout
    a.deliver(acks, 1100);
    a.tick(6000);
    assert!(a.take_datagrams().is_empty());
}

#[test]
fn out_of_order_recovery() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let stream = StreamId::new(1).unwrap();
    let first = initiator_ids()[1];

    // three writes flushed as three datagrams
    let mut datagrams = Vec::new();
    for (i, payload) in [&[0x41u8][..], &[0x42], &[0x43]].iter().enumerate() {
        a.conn
            .write_reliable(stream, Bytes::copy_from_slice(payload))
            .unwrap();
        a.tick(1000 + i as u32);
        let mut out = a.take_datagrams();
        assert_eq!(1, out.len());
        datagrams.append(&mut out);
    }

    // the datagram carrying the first id is lost
    let lost = datagrams.remove(0);
    b.deliver(datagrams, 1100);
    assert!(b.payloads().is_empty(), "ordered stream holds the tail back");

    b.tick(1120);
    let acks = b.take_datagrams();
    let fields = decode_ack(&acks[0]);
    assert_eq!(
        vec![
            AckField::Rollup {
                stream,
                partial: first.0 & ROLLUP_MASK,
            },
            AckField::Range {
                start_offset: 1,
                end_offset: 1,
            },
        ],
        fields
    );

    // the ack lands after the nack timeout: the head retransmits with the
    // full 3-byte tag
    a.deliver(acks, 2000);
    a.tick(2010);
    let retrans = a.take_datagrams();
    assert_eq!(1, retrans.len());
    {
        let mut env = LoopEnvelope { now_ms: 0 };
        let mut buf = retrans[0].clone();
        let opened = env.open(&mut buf).unwrap();
        let mut rdr = Bytes::copy_from_slice(&buf[..opened.len]);
        let header = rdr.read::<MessageHeader>().unwrap();
        assert!(header.reliable && header.with_ack_id);
        let tag = rdr.read::<AckIdTag>().unwrap();
        assert_eq!(20, tag.bits, "retransmissions always carry the full tag");
        assert_eq!(first, tag.reconstruct(first));
    }
    drop(lost);

    b.deliver(retrans, 2050);
    assert_eq!(vec![&[0x41][..], &[0x42], &[0x43]], b.payloads());

    b.tick(2060);
    let fields = decode_ack(&b.take_datagrams()[0]);
    assert_eq!(
        vec![AckField::Rollup {
            stream,
            partial: first.0.wrapping_add(3) & ROLLUP_MASK,
        }],
        fields
    );
}

#[test]
fn fragmentation_reassembles_once() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let stream = StreamId::new(2).unwrap();

    let msg = (0..4096u32).map(|i| i as u8).collect::<Vec<_>>();
    a.conn
        .write_reliable(stream, Bytes::copy_from_slice(&msg))
        .unwrap();
    a.tick(1000);

    let datagrams = a.take_datagrams();
    assert!(
        datagrams.len() >= 4,
        "4096 bytes into {MAX_PAYLOAD}-byte datagrams: got {}",
        datagrams.len()
    );
    for datagram in &datagrams {
        assert!(datagram.len() <= MTU - 28);
    }

    b.deliver(datagrams, 1050);
    assert_eq!(1, b.rec.msgs.len(), "one delivery for the whole message");
    assert_eq!(msg.as_slice(), b.rec.msgs[0].payload.as_ref());
    assert_eq!(stream, b.rec.msgs[0].stream);
}

#[test]
fn unordered_stream_delivers_immediately_exactly_once() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let first = initiator_ids()[0];

    let mut datagrams = Vec::new();
    for (i, payload) in [&[0xAAu8][..], &[0xBB], &[0xCC]].iter().enumerate() {
        a.conn
            .write_reliable(StreamId::UNORDERED, Bytes::copy_from_slice(payload))
            .unwrap();
        a.tick(1000 + i as u32);
        datagrams.append(&mut a.take_datagrams());
    }
    let [d1, d2, d3] = <[Vec<u8>; 3]>::try_from(datagrams).unwrap();

    // the last write arrives first and is delivered on the spot
    b.deliver(vec![d3], 1100);
    assert_eq!(vec![&[0xCC][..]], b.payloads());

    b.deliver(vec![d1], 1110);
    assert_eq!(vec![&[0xCC][..], &[0xAA]], b.payloads());

    b.deliver(vec![d2], 1120);
    assert_eq!(
        vec![&[0xCC][..], &[0xAA], &[0xBB]],
        b.payloads(),
        "nothing is delivered twice"
    );

    // all three ids acknowledged in one rollup
    b.tick(1140);
    let fields = decode_ack(&b.take_datagrams()[0]);
    assert_eq!(
        vec![AckField::Rollup {
            stream: StreamId::UNORDERED,
            partial: first.0.wrapping_add(3) & ROLLUP_MASK,
        }],
        fields
    );
}

#[test]
fn duplicate_is_suppressed_and_reacked() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let stream = StreamId::new(1).unwrap();

    a.conn
        .write_reliable(stream, Bytes::from_static(&[0x41]))
        .unwrap();
    a.tick(1000);
    let datagrams = a.take_datagrams();

    b.deliver(datagrams.clone(), 1040);
    b.tick(1060);
    let _first_ack = b.take_datagrams();
    assert_eq!(1, b.rec.msgs.len());

    // a stale copy arrives after delivery
    b.deliver(datagrams, 1500);
    assert_eq!(1, b.rec.msgs.len(), "not delivered twice");

    // but the rollup is re-armed so the sender can stop retransmitting
    b.tick(1520);
    let reack = b.take_datagrams();
    assert_eq!(1, reack.len());
    assert!(matches!(
        decode_ack(&reack[0]).as_slice(),
        [AckField::Rollup { .. }]
    ));
}

#[test]
fn nack_recovers_middle_loss() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);
    let stream = StreamId::new(1).unwrap();

    let mut datagrams = Vec::new();
    for i in 0..8u8 {
        a.conn
            .write_reliable(stream, Bytes::copy_from_slice(&[0x60 + i]))
            .unwrap();
        a.tick(1000 + u32::from(i));
        datagrams.append(&mut a.take_datagrams());
    }
    assert_eq!(8, datagrams.len());

    // ids +2, +3, +4 go missing
    let delivered = datagrams
        .into_iter()
        .enumerate()
        .filter(|&(i, _)| !(2..=4).contains(&i))
        .map(|(_, d)| d)
        .collect::<Vec<_>>();
    b.deliver(delivered, 1100);
    assert_eq!(
        vec![&[0x60][..], &[0x61]],
        b.payloads(),
        "delivery stops at the gap"
    );

    b.tick(1120);
    let acks = b.take_datagrams();
    let first = initiator_ids()[1];
    assert_eq!(
        vec![
            AckField::Rollup {
                stream,
                partial: first.0.wrapping_add(2) & ROLLUP_MASK,
            },
            AckField::Range {
                start_offset: 3,
                end_offset: 2,
            },
        ],
        decode_ack(&acks[0])
    );

    // the ack confirms the middle went missing; retransmissions recover it
    a.deliver(acks, 2000);
    a.tick(2010);
    let retrans = a.take_datagrams();
    assert!(!retrans.is_empty());
    b.deliver(retrans, 2050);
    assert_eq!(
        vec![
            &[0x60][..],
            &[0x61],
            &[0x62],
            &[0x63],
            &[0x64],
            &[0x65],
            &[0x66],
            &[0x67]
        ],
        b.payloads(),
        "everything arrives, in order, exactly once"
    );
}

#[test]
fn huge_message_streams_through() {
    let mut b = Peer::new(false);
    let stream = StreamId::new(1).unwrap();
    let first = initiator_ids()[1];

    // hand-build the initiator's fragments of a huge message
    let mut plaintext = octs::BytesMut::new();
    let mut start = Vec::new();
    start.write(&FragStart::HUGE).unwrap();
    start.extend_from_slice(b"ABCD");
    plaintext
        .write(&MessageHeader {
            len: start.len(),
            reliable: true,
            with_ack_id: true,
            sop: SuperOpcode::Frag,
        })
        .unwrap();
    plaintext.write(&AckIdTag::full(stream, first)).unwrap();
    plaintext.write_from(start.as_slice()).unwrap();

    plaintext
        .write(&MessageHeader {
            len: 4,
            reliable: true,
            with_ack_id: false,
            sop: SuperOpcode::Frag,
        })
        .unwrap();
    plaintext.write_from(b"EFGH".as_slice()).unwrap();

    // the zero-length continuation completes the transfer
    plaintext
        .write(&MessageHeader {
            len: 0,
            reliable: true,
            with_ack_id: false,
            sop: SuperOpcode::Frag,
        })
        .unwrap();

    let mut env = LoopEnvelope { now_ms: 500 };
    let mut datagram = plaintext.to_vec();
    assert!(env.seal(&mut datagram));

    b.deliver(vec![datagram], 550);
    assert_eq!(
        vec![
            (stream, b"ABCD".to_vec()),
            (stream, b"EFGH".to_vec()),
            (stream, Vec::new()),
        ],
        b.rec.huge
    );
    assert!(b.rec.msgs.is_empty());
}

#[test]
fn mtu_probe_reaches_peer() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);

    a.env.now_ms = 1000;
    a.conn
        .post_mtu_probe(600, &mut a.env, &mut a.sink)
        .unwrap();
    let probes = a.take_datagrams();
    assert_eq!(1, probes.len());
    assert_eq!(600 - 28, probes[0].len(), "probe fills the candidate MTU");

    b.deliver(probes, 1050);
    assert_eq!(vec![600 - 28 - ENVELOPE_OVERHEAD - 2], b.rec.probes);
}

#[test]
fn graceful_disconnect_notifies_both_sides() {
    let mut a = Peer::new(true);
    let mut b = Peer::new(false);

    a.env.now_ms = 1000;
    a.conn
        .disconnect(DisconnectReason::UserClosed, &mut a.env, &mut a.sink);
    assert!(a.conn.is_disconnected());

    // writes after disconnect vanish silently
    a.conn
        .write_reliable(StreamId::new(1).unwrap(), Bytes::from_static(b"late"))
        .unwrap();

    b.deliver(a.take_datagrams(), 1010);
    assert!(b.conn.is_disconnected(), "peer enters the same state");

    for i in 0..SHUTDOWN_TICK_COUNT {
        let now = 1100 + i * 20;
        a.tick(now);
        b.tick(now);
    }
    assert_eq!(vec![DisconnectReason::UserClosed], a.rec.disconnects);
    assert_eq!(vec![DisconnectReason::UserClosed], b.rec.disconnects);

    // dead connections go quiet
    a.tick(2000);
    assert!(a.take_datagrams().is_empty());
    assert!(b.payloads().is_empty());
}

#[test]
fn silence_times_out() {
    let mut a = Peer::new(true);

    a.tick(10_000);
    assert!(!a.conn.is_disconnected());

    a.tick(15_500);
    assert!(a.conn.is_disconnected());

    for i in 0..SHUTDOWN_TICK_COUNT {
        a.tick(15_600 + i * 20);
    }
    assert_eq!(vec![DisconnectReason::Timeout], a.rec.disconnects);
}
