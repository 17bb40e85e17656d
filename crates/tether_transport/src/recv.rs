//! The receive pipeline: peeling messages out of an opened datagram.
//!
//! Parsing happens under the ACK lock and produces a list of
//! [`RecvEvent`]s; the connection dispatches them to the handler after the
//! lock is released, so no callback ever runs inside a lock. ACK bodies are
//! also deferred this way, because applying them needs the cluster lock.

use {
    crate::{
        DisconnectReason, TIMEOUT_DISCONNECT_MS,
        frag::{FragEvent, Reassembler},
        io::RecvMessage,
        packet::{AckId, AckIdTag, InternalOpcode, MessageHeader, SuperOpcode},
        stream::StreamId,
        wait::{InsertOutcome, WaitQueue},
    },
    bytes::{Buf, Bytes},
    octs::Read,
    tracing::{trace, warn},
};

/// Messages per delivery batch handed to the application callback.
pub const DELIVERY_BATCH: usize = 32;

/// Something the parse phase wants done once the ACK lock is released.
#[derive(Debug)]
pub enum RecvEvent {
    /// Deliver an application message.
    Message(RecvMessage),
    /// Stream a piece of a huge message.
    HugePiece {
        /// Stream the huge message travels on.
        stream: StreamId,
        /// The piece; never empty.
        piece: Bytes,
    },
    /// The huge message on `stream` completed.
    HugeEnd {
        /// Stream the huge message travelled on.
        stream: StreamId,
    },
    /// Apply a selective-ACK body against the sent lists.
    AckBody(Bytes),
    /// The peer probed the path MTU.
    MtuProbe {
        /// Total probe payload length.
        payload_len: usize,
    },
    /// An internal message this layer does not define.
    Internal {
        /// Raw opcode byte.
        opcode: u8,
        /// Payload after the opcode.
        payload: Bytes,
    },
    /// The peer announced a disconnect.
    Disconnect {
        /// The announced reason.
        reason: DisconnectReason,
    },
}

/// A datagram could not be fully parsed; everything before the problem was
/// still processed, and the connection stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// The envelope rejected the datagram: bad MAC, replay, or garbage.
    #[error("envelope rejected datagram")]
    Envelope,
    /// Ran out of bytes inside a message header.
    #[error("truncated message header")]
    TruncatedHeader,
    /// Ran out of bytes inside an ACK-ID tag.
    #[error("truncated ACK-ID tag")]
    TruncatedAckId,
    /// The header promised more payload than the datagram holds.
    #[error("truncated message payload")]
    TruncatedPayload,
}

/// Receive-side state of one connection: everything the ACK lock guards.
#[derive(Debug)]
pub struct RecvState {
    pub wait: [WaitQueue; StreamId::COUNT],
    pub next_expected: [AckId; StreamId::COUNT],
    pub got_reliable: [bool; StreamId::COUNT],
    pub frags: [Reassembler; StreamId::COUNT],
    trip_sum: u64,
    trip_count: u32,
    pub last_recv_ms: u32,
}

impl RecvState {
    pub fn new(next_expected: [AckId; StreamId::COUNT], now_ms: u32) -> Self {
        Self {
            wait: Default::default(),
            next_expected,
            got_reliable: [false; StreamId::COUNT],
            frags: Default::default(),
            trip_sum: 0,
            trip_count: 0,
            last_recv_ms: now_ms,
        }
    }

    /// Accumulates one datagram's transit time for the next ACK's trip
    /// field.
    pub fn note_trip(&mut self, send_time_ms: u32, recv_time_ms: u32) {
        let mut transit = recv_time_ms.wrapping_sub(send_time_ms);
        // clocks may disagree; clamp a transit from the future into sanity
        if (transit as i32) < 1 {
            transit = 1;
        }
        if transit < TIMEOUT_DISCONNECT_MS {
            self.trip_sum += u64::from(transit);
            self.trip_count += 1;
        }
    }

    /// Average accumulated transit time, resetting the accumulator.
    pub fn take_trip_avg(&mut self) -> u32 {
        let avg = if self.trip_count > 0 {
            (self.trip_sum / u64::from(self.trip_count)) as u32
        } else {
            0
        };
        self.trip_sum = 0;
        self.trip_count = 0;
        avg
    }

    /// Whether any stream owes the peer an ACK.
    pub fn any_ack_due(&self) -> bool {
        self.got_reliable.iter().any(|got| *got)
    }

    /// Peels every message out of one opened datagram.
    ///
    /// On error, parsing stops but everything already peeled stays in
    /// `events`; the caller logs and keeps the connection up, since a peer
    /// cannot be allowed to kill us with malformed bytes.
    pub fn parse_datagram(
        &mut self,
        mut rdr: Bytes,
        events: &mut Vec<RecvEvent>,
    ) -> Result<(), RecvError> {
        // ACK-ID decoder state: a reliable message without a tag continues
        // the previous message's stream at the next ID
        let mut stream = StreamId::UNORDERED;
        let mut id = AckId(0);

        while rdr.has_remaining() {
            let header = rdr
                .read::<MessageHeader>()
                .map_err(|_| RecvError::TruncatedHeader)?;

            if header.with_ack_id {
                let tag = rdr
                    .read::<AckIdTag>()
                    .map_err(|_| RecvError::TruncatedAckId)?;
                stream = tag.stream;
                id = tag.reconstruct(self.next_expected[stream.index()]);
            } else if header.reliable {
                id = id.next();
            }

            if rdr.remaining() < header.len {
                return Err(RecvError::TruncatedPayload);
            }
            let payload = rdr
                .read_next(header.len)
                .map_err(|_| RecvError::TruncatedPayload)?;

            if header.reliable {
                self.on_reliable(stream, id, header.sop, payload, events);
            } else {
                match header.sop {
                    SuperOpcode::Data if payload.is_empty() => {
                        warn!("Zero-length unreliable message ignored");
                    }
                    SuperOpcode::Data => events.push(RecvEvent::Message(RecvMessage {
                        stream,
                        payload,
                    })),
                    SuperOpcode::Ack => events.push(RecvEvent::AckBody(payload)),
                    SuperOpcode::Internal => dispatch_internal(payload, events),
                    SuperOpcode::Frag => warn!("Unreliable fragment ignored"),
                }
            }
        }
        Ok(())
    }

    fn on_reliable(
        &mut self,
        stream: StreamId,
        id: AckId,
        sop: SuperOpcode,
        payload: Bytes,
        events: &mut Vec<RecvEvent>,
    ) {
        let s = stream.index();
        let diff = self.next_expected[s].dist_to(id);

        if diff == 0 {
            trace!(%stream, id = id.0, "In-order reliable");
            self.dispatch_reliable(stream, sop, payload, events);
            self.run_ready(stream, id.next(), events);
        } else if diff > 0 {
            self.store_out_of_order(stream, id, sop, payload, events);
        } else {
            // duplicate of something already delivered; re-arm the rollup
            // so a stale retransmission gets suppressed
            trace!(%stream, id = id.0, "Duplicate reliable ignored");
            self.got_reliable[s] = true;
        }
    }

    /// Processes one in-order reliable message.
    fn dispatch_reliable(
        &mut self,
        stream: StreamId,
        sop: SuperOpcode,
        payload: Bytes,
        events: &mut Vec<RecvEvent>,
    ) {
        match sop {
            SuperOpcode::Frag => {
                let s = stream.index();
                match self.frags[s].on_fragment(payload) {
                    Ok(FragEvent::Absorbed | FragEvent::Aborted) => {}
                    Ok(FragEvent::Message(msg)) => {
                        events.push(RecvEvent::Message(RecvMessage {
                            stream,
                            payload: msg,
                        }));
                    }
                    Ok(FragEvent::HugePiece(piece)) => {
                        events.push(RecvEvent::HugePiece { stream, piece });
                    }
                    Ok(FragEvent::HugeEnd) => events.push(RecvEvent::HugeEnd { stream }),
                    Err(err) => warn!(%stream, "Fragment dropped: {err}"),
                }
            }
            SuperOpcode::Data => {
                if payload.is_empty() {
                    // placeholders from the unordered stream land here when
                    // the wait queue drains; their data was delivered on
                    // arrival
                } else {
                    events.push(RecvEvent::Message(RecvMessage { stream, payload }));
                }
            }
            SuperOpcode::Internal => dispatch_internal(payload, events),
            SuperOpcode::Ack => warn!("Reliable ACK super-opcode ignored"),
        }
    }

    /// Advances the next-expected ID to `upto` and drains every queued
    /// message the advance made contiguous.
    fn run_ready(&mut self, stream: StreamId, upto: AckId, events: &mut Vec<RecvEvent>) {
        let s = stream.index();
        let mut expected = upto;
        while let Some(node) = self.wait[s].pop_ready(expected) {
            trace!(%stream, id = node.id.0, "Running queued reliable");
            self.dispatch_reliable(stream, node.sop, node.payload, events);
            expected = expected.next();
        }
        self.next_expected[s] = expected;
        self.got_reliable[s] = true;
    }

    fn store_out_of_order(
        &mut self,
        stream: StreamId,
        id: AckId,
        sop: SuperOpcode,
        payload: Bytes,
        events: &mut Vec<RecvEvent>,
    ) {
        if payload.is_empty() && sop != SuperOpcode::Frag {
            warn!("Zero-length reliable message ignored");
            return;
        }

        // the unordered stream delivers immediately and queues an empty
        // placeholder so the rollup still advances in order; fragments are
        // inherently ordered and wait in full
        let deliver_now = stream.is_unordered() && sop != SuperOpcode::Frag;
        let stored = if deliver_now {
            Bytes::new()
        } else {
            payload.clone()
        };

        let s = stream.index();
        match self.wait[s].insert(id, sop, stored) {
            InsertOutcome::Queued => {
                trace!(%stream, id = id.0, "Queued out-of-order reliable");
                if deliver_now {
                    match sop {
                        SuperOpcode::Data => events.push(RecvEvent::Message(RecvMessage {
                            stream,
                            payload,
                        })),
                        SuperOpcode::Internal => dispatch_internal(payload, events),
                        _ => {}
                    }
                }
                self.got_reliable[s] = true;
            }
            InsertOutcome::Duplicate => {
                trace!(%stream, id = id.0, "Duplicate queued reliable ignored");
            }
            InsertOutcome::Dropped => {
                warn!(%stream, id = id.0, "Out-of-order queue full, arrival dropped");
            }
        }
    }
}

fn dispatch_internal(mut payload: Bytes, events: &mut Vec<RecvEvent>) {
    let Ok(opcode) = payload.read::<u8>() else {
        warn!("Empty internal message ignored");
        return;
    };
    match InternalOpcode::from_raw(opcode) {
        Some(InternalOpcode::MtuProbe) => events.push(RecvEvent::MtuProbe {
            payload_len: payload.len() + 1,
        }),
        Some(InternalOpcode::Disconnect) => {
            if let Ok(reason) = payload.read::<u8>() {
                events.push(RecvEvent::Disconnect {
                    reason: DisconnectReason::from_raw(reason),
                });
            } else {
                warn!("Disconnect notice without a reason ignored");
            }
        }
        Some(InternalOpcode::Pad) => {}
        None => events.push(RecvEvent::Internal { opcode, payload }),
    }
}
