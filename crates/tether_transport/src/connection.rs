//! See [`Connection`].

use {
    crate::{
        DisconnectReason, MAXIMUM_MTU, MINIMUM_MTU, SHUTDOWN_TICK_COUNT, TIMEOUT_DISCONNECT_MS,
        ack,
        io::{DatagramSink, Envelope, NoPadding, Padder, TransportHandler},
        max_payload_bytes,
        packet::{AckId, InternalOpcode, MessageHeader, SuperOpcode},
        recv::{DELIVERY_BATCH, RecvError, RecvEvent, RecvState},
        send::{MAX_RELIABLE_LEN, SendState},
        sent::{QueuedMessage, SendQueue},
        stream::StreamId,
        IPV4_HEADER_BYTES, IPV6_HEADER_BYTES, UDP_HEADER_BYTES,
    },
    bytes::Bytes,
    octs::Write,
    parking_lot::Mutex,
    tracing::{debug, trace, warn},
};

/// KDF label for the initiator-to-responder initial ACK-IDs.
const LABEL_SEND_INITIATOR: &str = "ws2_32.dll";

/// KDF label for the responder-to-initiator initial ACK-IDs.
const LABEL_SEND_RESPONDER: &str = "winsock.ocx";

/// KDF label keying the padding PRF.
const LABEL_PAD: &str = "kernel32.dll";

/// Static configuration of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Whether this side initiated the key exchange; decides which KDF
    /// label derives which direction's initial ACK-IDs.
    pub initiator: bool,
    /// Whether datagrams travel over IPv6, which costs more header bytes
    /// per datagram.
    pub ipv6: bool,
    /// Path MTU to size clusters for; start at [`MINIMUM_MTU`] and raise
    /// it after probing.
    pub mtu: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initiator: true,
            ipv6: false,
            mtu: MINIMUM_MTU,
        }
    }
}

/// Failed to derive initial transport keys from the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("key derivation failed")]
pub struct KeyDerivationFailed;

/// Rejected an application write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Zero-length messages cannot be expressed on the wire.
    #[error("message is empty")]
    Empty,
    /// The message exceeds what this mode can carry.
    #[error("message too large: {len} / {max} bytes")]
    TooBig {
        /// Rejected length.
        len: usize,
        /// Largest length this mode accepts.
        max: usize,
    },
}

/// Rejected an MTU probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("probe MTU {mtu} outside {MINIMUM_MTU}..={MAXIMUM_MTU}")]
pub struct ProbeError {
    /// The rejected candidate MTU.
    pub mtu: usize,
}

/// One authenticated transport connection to a remote peer.
///
/// Created by the handshake layer once session keys exist. All methods
/// take `&self`; internal state is partitioned across three mutexes (the
/// send-queue, cluster, and ACK locks) so I/O threads and writers can run
/// in parallel. The padding PRF sits behind its own small guard because it
/// is a collaborator, not transport state. No lock is ever held across an
/// envelope, sink, or handler call.
///
/// The host must call [`Connection::tick`] every 10–50 ms; ticks drive ACK
/// emission, retransmission, cluster flushing, the flow-control epoch, and
/// the disconnect countdown.
#[derive(Debug)]
pub struct Connection<P: Padder = NoPadding> {
    max_payload: usize,
    udpip_bytes: usize,
    app_queue: Mutex<[SendQueue; StreamId::COUNT]>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    padder: Mutex<P>,
}

impl<P: Padder> Connection<P> {
    /// Creates a connection whose keys were just established.
    ///
    /// Initial ACK-IDs are derived from the session key rather than
    /// starting at zero, so the first reliable IDs are not known plaintext
    /// inside the encrypted channel.
    ///
    /// # Errors
    ///
    /// Errors if the envelope's key derivation fails.
    pub fn new(
        config: &ConnectionConfig,
        envelope: &mut impl Envelope,
        mut padder: P,
        now_ms: u32,
    ) -> Result<Self, KeyDerivationFailed> {
        let udpip_bytes = UDP_HEADER_BYTES
            + if config.ipv6 {
                IPV6_HEADER_BYTES
            } else {
                IPV4_HEADER_BYTES
            };
        let max_payload = max_payload_bytes(config.mtu, config.ipv6, envelope.overhead());

        let (send_label, recv_label) = if config.initiator {
            (LABEL_SEND_INITIATOR, LABEL_SEND_RESPONDER)
        } else {
            (LABEL_SEND_RESPONDER, LABEL_SEND_INITIATOR)
        };
        let next_send = derive_ids(envelope, send_label)?;
        let next_recv = derive_ids(envelope, recv_label)?;

        let mut pad_key = [0u8; 32];
        if !envelope.generate_key(LABEL_PAD, &mut pad_key) {
            return Err(KeyDerivationFailed);
        }
        padder.rekey(&pad_key);

        Ok(Self {
            max_payload,
            udpip_bytes,
            app_queue: Mutex::new(Default::default()),
            send: Mutex::new(SendState::new(max_payload, next_send, next_send)),
            recv: Mutex::new(RecvState::new(next_recv, now_ms)),
            padder: Mutex::new(padder),
        })
    }

    /// Plaintext payload capacity of one datagram.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether this connection is disconnecting or dead.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.send.lock().shutdown.reason.is_some()
    }

    /// Queues a reliable message on `stream`.
    ///
    /// The message transmits within the flow-control budget on the next
    /// tick (or sooner, piggybacked on receive activity). After a
    /// disconnect, writes are silently dropped.
    ///
    /// # Errors
    ///
    /// Errors if the payload is empty or larger than
    /// [`MAX_RELIABLE_LEN`].
    pub fn write_reliable(&self, stream: StreamId, payload: Bytes) -> Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::Empty);
        }
        if payload.len() > MAX_RELIABLE_LEN {
            return Err(SendError::TooBig {
                len: payload.len(),
                max: MAX_RELIABLE_LEN,
            });
        }
        if self.is_disconnected() {
            return Ok(());
        }

        trace!(%stream, len = payload.len(), "Queued reliable write");
        self.app_queue.lock()[stream.index()]
            .push_back(QueuedMessage::new(SuperOpcode::Data, payload));
        Ok(())
    }

    /// Writes an unreliable message into the current cluster.
    ///
    /// It leaves the host on the next flush and is never retransmitted.
    ///
    /// # Errors
    ///
    /// Errors if the payload is empty or cannot fit one datagram.
    pub fn write_unreliable(&self, payload: &[u8]) -> Result<(), SendError> {
        let max = self.max_payload - crate::packet::MAX_HEADER_BYTES;
        if payload.is_empty() {
            return Err(SendError::Empty);
        }
        if payload.len() > max {
            return Err(SendError::TooBig {
                len: payload.len(),
                max,
            });
        }
        if self.is_disconnected() {
            return Ok(());
        }

        self.send
            .lock()
            .append_unreliable(SuperOpcode::Data, payload);
        Ok(())
    }

    /// Feeds one received datagram through the envelope and the receive
    /// pipeline, delivering messages to `handler` and piggybacking any
    /// transmission work the datagram unlocked.
    ///
    /// # Errors
    ///
    /// Errors are diagnostics only: the offending datagram (or its tail)
    /// is dropped and the connection stays up, because a peer must not be
    /// able to kill the connection with malformed bytes. Messages parsed
    /// before the problem are still delivered.
    pub fn on_datagram(
        &self,
        datagram: &mut [u8],
        recv_time_ms: u32,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
        handler: &mut impl TransportHandler,
    ) -> Result<(), RecvError> {
        if self.is_disconnected() {
            return Ok(());
        }

        let Some(opened) = envelope.open(datagram) else {
            return Err(RecvError::Envelope);
        };
        let plaintext = Bytes::copy_from_slice(&datagram[..opened.len]);

        let mut events = Vec::new();
        let result = {
            let mut recv = self.recv.lock();
            recv.last_recv_ms = recv_time_ms;
            recv.note_trip(opened.send_time_ms, recv_time_ms);
            recv.parse_datagram(plaintext, &mut events)
        };

        self.dispatch_events(events, recv_time_ms, handler);

        // piggyback: the datagram may have freed budget or acknowledged a
        // stream; send what became ready without waiting for the tick
        self.transmit_queued(recv_time_ms);
        let ready = { !self.send.lock().outbound.is_empty() };
        if ready {
            self.flush_outbound(false, envelope, sink);
        }

        result
    }

    /// Runs one timer tick: ACK emission, retransmission, the flow
    /// epoch, queued transmission, flushing, and the disconnect countdown.
    pub fn tick(
        &self,
        now_ms: u32,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
        handler: &mut impl TransportHandler,
    ) {
        if self.tick_disconnect(envelope, sink, handler) {
            return;
        }

        // a silent peer eventually counts as gone
        let last_recv = self.recv.lock().last_recv_ms;
        if now_ms.wrapping_sub(last_recv) >= TIMEOUT_DISCONNECT_MS {
            debug!("No datagrams for {TIMEOUT_DISCONNECT_MS} ms, disconnecting");
            self.disconnect(DisconnectReason::Timeout, envelope, sink);
            return;
        }

        // acknowledge recent reliable traffic
        let body = {
            let mut recv = self.recv.lock();
            ack::encode_ack_body(&mut recv, self.max_payload)
        };
        if let Some(body) = body {
            ack::append_ack_message(&mut self.send.lock(), &body);
        }

        // retransmit inferred losses and close the flow epoch
        {
            let mut send = self.send.lock();
            let losses = send.retransmit_lost(now_ms);
            send.flow.on_loss(losses);
            send.flow.on_tick();
        }

        self.transmit_queued(now_ms);
        self.flush_outbound(true, envelope, sink);
    }

    /// Begins a graceful disconnect: emits a disconnect notice now and
    /// re-emits it each tick until the countdown expires, after which the
    /// handler's completion callback fires.
    ///
    /// Queued and in-flight messages are dropped when the countdown ends.
    pub fn disconnect(
        &self,
        reason: DisconnectReason,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
    ) {
        if !self.begin_disconnect(reason) {
            return;
        }
        debug!(?reason, "Disconnecting");
        self.write_disconnect_notice(reason);
        self.flush_outbound(true, envelope, sink);
    }

    /// Probes the path with a datagram sized to `mtu`, bypassing the
    /// cluster. The peer reports the probe's size to its upper layer,
    /// which may then raise the negotiated MTU.
    ///
    /// # Errors
    ///
    /// Errors if `mtu` is outside the probeable range.
    pub fn post_mtu_probe(
        &self,
        mtu: usize,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
    ) -> Result<(), ProbeError> {
        if !(MINIMUM_MTU..=MAXIMUM_MTU).contains(&mtu) {
            return Err(ProbeError { mtu });
        }

        let payload_bytes = mtu - self.udpip_bytes - envelope.overhead();
        let data_bytes = payload_bytes - crate::packet::MAX_HEADER_BYTES;
        let mut datagram = Vec::with_capacity(payload_bytes + envelope.overhead());
        datagram
            .write(&MessageHeader {
                len: data_bytes,
                reliable: false,
                with_ack_id: false,
                sop: SuperOpcode::Internal,
            })
            .expect("probe sizes exceed the one-byte header form");
        datagram.push(InternalOpcode::MtuProbe.into_raw());

        // the probe body is keystream, indistinguishable from data
        let start = datagram.len();
        datagram.resize(start + data_bytes - 1, 0);
        self.padder.lock().fill(&mut datagram[start..]);

        trace!(mtu, "Posting MTU probe");
        if !envelope.seal(&mut datagram) {
            warn!("Envelope refused to seal MTU probe");
            return Ok(());
        }
        self.send.lock().flow.on_datagram_sent(mtu);
        let mut batch = vec![datagram];
        sink.post_datagrams(&mut batch);
        Ok(())
    }

    /// Flushes the open cluster and every queued datagram through the
    /// envelope to the sink.
    pub fn flush(&self, envelope: &mut impl Envelope, sink: &mut impl DatagramSink) {
        self.flush_outbound(true, envelope, sink);
    }

    /// Steals application writes into the staging queues and transmits
    /// within the epoch budget.
    fn transmit_queued(&self, now_ms: u32) {
        let mut app = self.app_queue.lock();
        let mut send = self.send.lock();
        for s in 0..StreamId::COUNT {
            send.staging[s].steal(&mut app[s]);
        }
        drop(app);
        send.write_queued_reliable(now_ms);
    }

    /// Seals and posts queued datagrams; `include_cluster` also closes the
    /// open cluster first.
    fn flush_outbound(
        &self,
        include_cluster: bool,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
    ) {
        let mut sealed = {
            let mut send = self.send.lock();
            if include_cluster && !send.cluster.is_empty() {
                let cluster = send.cluster.take();
                send.outbound.push(cluster);
            }
            if send.outbound.is_empty() {
                return;
            }

            let mut padder = self.padder.lock();
            let datagrams = send.outbound.take();
            let mut sealed = Vec::with_capacity(datagrams.len());
            for mut datagram in datagrams {
                self.pad_datagram(&mut padder, &mut datagram);
                let wire = datagram.len() + self.udpip_bytes + envelope.overhead();
                if envelope.seal(&mut datagram) {
                    send.flow.on_datagram_sent(wire);
                    sealed.push(datagram);
                } else {
                    warn!("Envelope refused to seal datagram, dropped");
                }
            }
            sealed
        };

        if !sealed.is_empty() {
            sink.post_datagrams(&mut sealed);
        }
    }

    /// Appends a random-length pad message, when the padder asks for one.
    fn pad_datagram(&self, padder: &mut P, datagram: &mut Vec<u8>) {
        let pad = padder
            .pad_len(datagram.len(), self.max_payload)
            .min(self.max_payload - datagram.len());
        if pad < 2 {
            return;
        }

        // 1 header byte covers payloads up to 8 bytes, else 2
        let payload_len = if pad - 1 <= 8 { pad - 1 } else { pad - 2 };
        datagram
            .write(&MessageHeader {
                len: payload_len,
                reliable: false,
                with_ack_id: false,
                sop: SuperOpcode::Internal,
            })
            .expect("pad length is in range");
        datagram.push(InternalOpcode::Pad.into_raw());
        let start = datagram.len();
        datagram.resize(start + payload_len - 1, 0);
        padder.fill(&mut datagram[start..]);
    }

    /// Arms the disconnect countdown; returns `false` if already armed.
    fn begin_disconnect(&self, reason: DisconnectReason) -> bool {
        let mut send = self.send.lock();
        if send.shutdown.reason.is_some() {
            return false;
        }
        send.shutdown.reason = Some(reason);
        send.shutdown.countdown = SHUTDOWN_TICK_COUNT;
        true
    }

    fn write_disconnect_notice(&self, reason: DisconnectReason) {
        let notice = [InternalOpcode::Disconnect.into_raw(), reason.into_raw()];
        self.send
            .lock()
            .append_unreliable(SuperOpcode::Internal, &notice);
    }

    /// Drives the disconnect countdown; returns `true` if the connection
    /// is disconnecting and the rest of the tick should be skipped.
    fn tick_disconnect(
        &self,
        envelope: &mut impl Envelope,
        sink: &mut impl DatagramSink,
        handler: &mut impl TransportHandler,
    ) -> bool {
        let (reason, fired) = {
            let mut send = self.send.lock();
            let Some(reason) = send.shutdown.reason else {
                return false;
            };
            if send.shutdown.complete {
                return true;
            }
            send.shutdown.countdown -= 1;
            let fired = send.shutdown.countdown == 0;
            if fired {
                send.shutdown.complete = true;
            }
            (reason, fired)
        };

        if fired {
            // everything queued or in flight dies with the connection
            self.send.lock().clear();
            for queue in self.app_queue.lock().iter_mut() {
                queue.clear();
            }
            {
                let mut recv = self.recv.lock();
                for s in 0..StreamId::COUNT {
                    recv.wait[s].clear();
                    recv.frags[s].reset();
                }
            }
            debug!(?reason, "Disconnect complete");
            handler.on_disconnect(reason);
        } else {
            // datagrams are lossy; repeat the notice
            self.write_disconnect_notice(reason);
            self.flush_outbound(true, envelope, sink);
        }
        true
    }

    /// Dispatches parsed events to the handler and the send side, with no
    /// lock held.
    fn dispatch_events(
        &self,
        events: Vec<RecvEvent>,
        recv_time_ms: u32,
        handler: &mut impl TransportHandler,
    ) {
        let mut batch = Vec::with_capacity(DELIVERY_BATCH);
        for event in events {
            if !matches!(event, RecvEvent::Message(_)) && !batch.is_empty() {
                handler.on_messages(&mut batch);
                batch.clear();
            }
            match event {
                RecvEvent::Message(msg) => {
                    batch.push(msg);
                    if batch.len() >= DELIVERY_BATCH {
                        handler.on_messages(&mut batch);
                        batch.clear();
                    }
                }
                RecvEvent::HugePiece { stream, piece } => {
                    handler.on_partial_huge(stream, &piece);
                }
                RecvEvent::HugeEnd { stream } => handler.on_partial_huge(stream, &[]),
                RecvEvent::AckBody(body) => {
                    ack::apply_ack_body(&mut self.send.lock(), body, recv_time_ms);
                }
                RecvEvent::MtuProbe { payload_len } => handler.on_mtu_probe(payload_len),
                RecvEvent::Internal { opcode, payload } => {
                    handler.on_internal(opcode, &payload);
                }
                RecvEvent::Disconnect { reason } => {
                    debug!(?reason, "Peer disconnected");
                    self.begin_disconnect(reason);
                }
            }
        }
        if !batch.is_empty() {
            handler.on_messages(&mut batch);
        }
    }
}

fn derive_ids(
    envelope: &mut impl Envelope,
    label: &str,
) -> Result<[AckId; StreamId::COUNT], KeyDerivationFailed> {
    let mut material = [0u8; 16];
    if !envelope.generate_key(label, &mut material) {
        return Err(KeyDerivationFailed);
    }
    let mut ids = [AckId(0); StreamId::COUNT];
    for (i, id) in ids.iter_mut().enumerate() {
        let chunk: [u8; 4] = material[i * 4..i * 4 + 4]
            .try_into()
            .expect("chunks of 16 bytes divide into four words");
        *id = AckId(u32::from_le_bytes(chunk));
    }
    Ok(ids)
}
