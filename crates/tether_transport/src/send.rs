//! The transmission pipeline: draining staged reliable messages into the
//! cluster within the epoch's byte budget, and retransmitting what the
//! peer has not acknowledged.
//!
//! Bandwidth is divided each pass: the non-bulk streams get even shares, a
//! second pass lets backlogged streams compete for what the first pass
//! left, and the bulk stream absorbs the residue. A message that overflows
//! the cluster is fragmented when enough headroom remains to make a
//! fragment worthwhile; otherwise the cluster is flushed and the message
//! starts fresh.
//!
//! First transmissions compress their ACK-ID tag against the remote's
//! last-known expected ID, but a retransmission can assume nothing and
//! always carries the full 3-byte tag; every first transmission caps its
//! size to leave that margin.

use {
    crate::{
        DisconnectReason,
        cluster::{OutboundQueue, SendCluster},
        flow::FlowControl,
        packet::{
            AckId, AckIdTag, FRAG_START_BYTES, FragStart, MAX_ACK_ID_BYTES, MAX_HEADER_BYTES,
            MAX_MESSAGE_LEN, MessageHeader, SuperOpcode,
        },
        sent::{SendQueue, SentKind, SentList, SentNode},
        stream::StreamId,
    },
    bytes::Bytes,
    octs::{EncodeLen, Write},
    tracing::{trace, warn},
};

/// Minimum cluster headroom worth starting a fragment in; flushing first
/// beats scattering slivers across datagrams.
pub const FRAG_THRESHOLD: usize = 32;

/// Largest reliable message accepted for transmission; the huge sentinel
/// sits just above it.
pub const MAX_RELIABLE_LEN: usize = 65_534;

/// A stream refuses to advance once its next ID is this far ahead of the
/// remote's confirmed expectation, so IDs can never be reused ambiguously
/// under extreme one-way loss.
pub const MAX_ID_SPAN: u32 = 1 << 20;

/// Progress of a graceful disconnect, driven by the tick.
#[derive(Debug, Default)]
pub struct Shutdown {
    /// Why the connection is going down; `None` while connected.
    pub reason: Option<DisconnectReason>,
    /// Ticks of disconnect-notice re-sends left before completion.
    pub countdown: u32,
    /// Whether the completion callback has fired.
    pub complete: bool,
}

/// Everything the cluster lock guards.
#[derive(Debug)]
pub struct SendState {
    pub cluster: SendCluster,
    pub outbound: OutboundQueue,
    pub flow: FlowControl,
    pub sent: [SentList; StreamId::COUNT],
    pub staging: [SendQueue; StreamId::COUNT],
    pub next_send_id: [AckId; StreamId::COUNT],
    pub remote_expected: [AckId; StreamId::COUNT],
    pub shutdown: Shutdown,
}

/// Why [`SendState::write_stream_node`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    /// The front message is fully transmitted and may be popped.
    Complete,
    /// Budget or the ID-span guard stopped the stream; progress is saved
    /// and the message resumes next tick.
    Stalled,
}

impl SendState {
    pub fn new(
        max_payload: usize,
        next_send_id: [AckId; StreamId::COUNT],
        remote_expected: [AckId; StreamId::COUNT],
    ) -> Self {
        Self {
            cluster: SendCluster::new(max_payload),
            outbound: OutboundQueue::default(),
            flow: FlowControl::default(),
            sent: Default::default(),
            staging: Default::default(),
            next_send_id,
            remote_expected,
            shutdown: Shutdown::default(),
        }
    }

    /// Appends one unreliable message to the cluster, flushing first if it
    /// cannot fit alongside what is already there.
    pub fn append_unreliable(&mut self, sop: SuperOpcode, payload: &[u8]) -> bool {
        let len = payload.len();
        let max_payload = self.cluster.max_payload();
        if len == 0 || len > MAX_MESSAGE_LEN || MAX_HEADER_BYTES + len > max_payload {
            warn!(len, "Unreliable write rejected");
            return false;
        }

        let header = MessageHeader {
            len,
            reliable: false,
            with_ack_id: false,
            sop,
        };
        let need = header.encode_len() + len;
        if !self.cluster.fits(need) {
            self.outbound.push(self.cluster.take());
        }

        let buf = self.cluster.buf_mut();
        buf.write(&header)
            .expect("length was validated and vec writes grow");
        buf.write_from(payload)
            .expect("vec writes grow");
        debug_assert!(self.cluster.bytes() <= max_payload);
        true
    }

    /// Writes one reliable piece (whole message or fragment) into the
    /// cluster. The caller has already made room.
    fn append_reliable_piece(
        &mut self,
        stream: StreamId,
        id: AckId,
        wire_sop: SuperOpcode,
        tag: Option<AckIdTag>,
        frag_start: Option<FragStart>,
        data: &Bytes,
    ) {
        let len = data.len() + frag_start.map_or(0, |_| FRAG_START_BYTES);
        let header = MessageHeader {
            len,
            reliable: true,
            with_ack_id: tag.is_some(),
            sop: wire_sop,
        };

        let buf = self.cluster.buf_mut();
        buf.write(&header)
            .expect("length was validated and vec writes grow");
        if let Some(tag) = tag {
            buf.write(&tag).expect("vec writes grow");
        }
        if let Some(frag_start) = frag_start {
            buf.write(&frag_start).expect("vec writes grow");
        }
        buf.write_from(data.clone()).expect("vec writes grow");

        self.cluster.note_reliable(stream, id.next());
        debug_assert!(self.cluster.bytes() <= self.cluster.max_payload());
    }

    /// Retransmits the sent-list node at `ix` with the full ACK-ID tag.
    ///
    /// The caller counts the node's loss-representative flag first; the
    /// retransmission clears it so one lost datagram is never counted
    /// twice, and marks the node ineligible for RTT sampling.
    pub fn retransmit(&mut self, stream: StreamId, ix: usize, now_ms: u32) {
        let s = stream.index();
        let (id, wire_sop, frag_start, data) = {
            let node = self.sent[s].get(ix);
            match node.kind {
                SentKind::Whole { sop } => (node.id, sop, None, node.payload.clone()),
                SentKind::Fragment { master, start } => (
                    node.id,
                    SuperOpcode::Frag,
                    start.then(|| FragStart {
                        total_len: self.sent[s].master(master).total_len as u16,
                    }),
                    node.payload.clone(),
                ),
            }
        };

        let len = data.len() + frag_start.map_or(0, |_| FRAG_START_BYTES);
        let need = MessageHeader::len_for(len) + MAX_ACK_ID_BYTES + len;
        if !self.cluster.fits(need) {
            self.outbound.push(self.cluster.take());
        }
        // first transmission reserved this margin
        debug_assert!(need <= self.cluster.max_payload());

        self.append_reliable_piece(
            stream,
            id,
            wire_sop,
            Some(AckIdTag::full(stream, id)),
            frag_start,
            &data,
        );

        let node = self.sent[s].get_mut(ix);
        node.ts_lastsend = now_ms;
        node.retransmitted = true;
        node.loss_rep = false;
        trace!(%stream, id = id.0, "Retransmitted");
    }

    /// Retransmits everything whose timeout has expired, returning the
    /// number of loss representatives that fired.
    pub fn retransmit_lost(&mut self, now_ms: u32) -> u32 {
        let timeout = self.flow.rtt().loss_timeout();
        let mut losses = 0;

        for stream in StreamId::all() {
            let s = stream.index();
            let mut cur = self.sent[s].head_ix();
            while let Some(ix) = cur {
                cur = self.sent[s].next_of(ix);

                let node = self.sent[s].get(ix);
                let mia = now_ms.wrapping_sub(node.ts_lastsend) as i32;
                let backoff =
                    self.flow
                        .rtt()
                        .backoff(node.retransmitted, node.ts_firstsend, node.ts_lastsend);
                if mia >= (timeout + backoff) as i32 {
                    losses += u32::from(node.loss_rep);
                    self.retransmit(stream, ix, now_ms);
                } else if (now_ms.wrapping_sub(node.ts_firstsend) as i32) < timeout as i32 {
                    // the list ascends by first-send time; nothing further
                    // can be due yet
                    break;
                }
            }
        }
        losses
    }

    /// Drains staged messages into the cluster within this epoch's byte
    /// budget.
    pub fn write_queued_reliable(&mut self, now_ms: u32) {
        if self.staging.iter().all(SendQueue::is_empty) {
            return;
        }
        let bandwidth = self.flow.remaining_bytes();
        if bandwidth <= 0 {
            return;
        }

        // plan how many bytes each stream may spend
        let mut remaining = bandwidth;
        let mut planned = [0usize; StreamId::COUNT];
        let bulk = StreamId::BULK.index();

        for s in 0..StreamId::COUNT - 1 {
            if remaining <= 0 {
                break;
            }
            if self.staging[s].is_empty() {
                continue;
            }
            // the head may carry a stale grant from the previous tick
            if let Some(front) = self.staging[s].front_mut() {
                front.send_bytes = 0;
            }
            let share = remaining / (StreamId::COUNT - 1 - s) as i32;
            planned[s] = dequeue_bandwidth(&mut self.staging[s], 0, share, &mut remaining);
        }
        for s in 0..StreamId::COUNT - 1 {
            if remaining <= 0 {
                break;
            }
            planned[s] =
                dequeue_bandwidth(&mut self.staging[s], planned[s], remaining, &mut remaining);
        }
        if remaining > 0 && !self.staging[bulk].is_empty() {
            if let Some(front) = self.staging[bulk].front_mut() {
                front.send_bytes = 0;
            }
            planned[bulk] = dequeue_bandwidth(&mut self.staging[bulk], 0, remaining, &mut remaining);
        }

        // the plan is a best guess; headers and already-queued datagrams
        // eat into the real budget as we write
        let mut remaining = bandwidth - self.outbound.bytes() as i32;
        for stream in StreamId::all() {
            let s = stream.index();
            let mut to_write = planned[s];
            while to_write > 0 {
                match self.write_stream_node(stream, now_ms, &mut remaining) {
                    NodeOutcome::Complete => {
                        self.staging[s].pop_front();
                        to_write -= 1;
                    }
                    NodeOutcome::Stalled => break,
                }
            }
        }
    }

    /// Transmits as much of the front staged message as its grant and the
    /// budget allow, fragmenting where needed.
    fn write_stream_node(&mut self, stream: StreamId, now_ms: u32, remaining: &mut i32) -> NodeOutcome {
        let s = stream.index();
        let max_payload = self.cluster.max_payload();
        let mut ack_id = self.next_send_id[s];
        let remote = self.remote_expected[s];

        if ack_id.0.wrapping_sub(remote.0) >= MAX_ID_SPAN {
            warn!(%stream, "Next ACK-ID too far ahead of receiver, stream paused");
            return NodeOutcome::Stalled;
        }

        let (payload, sop, mut sent_bytes, granted, mut master) = {
            let node = self
                .staging[s]
                .front_mut()
                .expect("planner granted bytes to a message on this stream");
            (
                node.payload.clone(),
                node.sop,
                node.sent_bytes,
                node.send_bytes,
                node.master,
            )
        };
        let total_len = payload.len();
        let mut fragmented = sent_bytes > 0;
        let mut bytes_to_send = granted.min(total_len - sent_bytes);
        if bytes_to_send == 0 {
            return NodeOutcome::Stalled;
        }

        let outcome = loop {
            let mut tag = if self.cluster.tag_elided(stream, ack_id) {
                None
            } else {
                Some(AckIdTag::compress(stream, ack_id, remote))
            };
            let mut tag_len = tag.as_ref().map_or(0, AckIdTag::encode_len);
            let mut headroom = self.cluster.headroom();

            // too little room to bother fragmenting into: flush and retry
            // with an empty cluster, budget permitting
            if MAX_HEADER_BYTES + tag_len + bytes_to_send > headroom
                && headroom < FRAG_THRESHOLD
                && !self.cluster.is_empty()
            {
                *remaining -= self.cluster.bytes() as i32;
                if *remaining <= FRAG_THRESHOLD as i32 {
                    break NodeOutcome::Stalled;
                }
                self.outbound.push(self.cluster.take());
                tag = Some(AckIdTag::compress(stream, ack_id, remote));
                tag_len = tag.as_ref().map_or(0, AckIdTag::encode_len);
                headroom = max_payload;
            }

            // a retransmission always needs the full tag, so reserve the
            // difference now; this cap is what makes `retransmit` safe
            let capacity = headroom.min(max_payload - (MAX_ACK_ID_BYTES - tag_len));
            if !fragmented && MAX_HEADER_BYTES + tag_len + bytes_to_send > capacity {
                fragmented = true;
            }
            let frag_overhead = if fragmented && sent_bytes == 0 {
                FRAG_START_BYTES
            } else {
                0
            };

            let overhead = MAX_HEADER_BYTES + tag_len + frag_overhead;
            debug_assert!(overhead < capacity);
            let write_bytes = (overhead + bytes_to_send).min(capacity);
            let data_bytes = write_bytes - overhead;

            let piece = payload.slice(sent_bytes..sent_bytes + data_bytes);
            let kind = if fragmented {
                let m = *master.get_or_insert_with(|| self.sent[s].new_master(total_len));
                SentKind::Fragment {
                    master: m,
                    start: sent_bytes == 0,
                }
            } else {
                SentKind::Whole { sop }
            };

            // exactly one message per cluster represents its loss
            let loss_rep = if self.cluster.loss_rep_present {
                false
            } else {
                self.cluster.loss_rep_present = true;
                true
            };
            self.sent[s].push_back(SentNode::new(ack_id, kind, piece.clone(), now_ms, loss_rep));

            let wire_sop = if fragmented { SuperOpcode::Frag } else { sop };
            let frag_start = (frag_overhead > 0).then(|| FragStart {
                total_len: total_len as u16,
            });
            self.append_reliable_piece(stream, ack_id, wire_sop, tag, frag_start, &piece);
            trace!(%stream, id = ack_id.0, bytes = data_bytes, "Wrote reliable piece");

            ack_id = ack_id.next();
            sent_bytes += data_bytes;
            bytes_to_send -= data_bytes;
            if bytes_to_send == 0 {
                break if sent_bytes == total_len {
                    NodeOutcome::Complete
                } else {
                    NodeOutcome::Stalled
                };
            }
        };

        if let Some(m) = master {
            if sent_bytes == total_len {
                self.sent[s].mark_all_sent(m);
            }
        }

        let node = self
            .staging[s]
            .front_mut()
            .expect("the message is still at the front");
        node.sent_bytes = sent_bytes;
        node.send_bytes = 0;
        node.master = master;
        self.next_send_id[s] = ack_id;

        outcome
    }

    /// Drops queued and in-flight send state on disconnect; the shutdown
    /// record itself is untouched.
    pub fn clear(&mut self) {
        let _ = self.cluster.take();
        let _ = self.outbound.take();
        for s in 0..StreamId::COUNT {
            self.sent[s].clear();
            self.staging[s].clear();
        }
    }
}

/// Grants `available` budget bytes to messages starting at `start`,
/// returning the index after the last granted message. `remaining` is
/// charged for what was granted.
fn dequeue_bandwidth(
    queue: &mut SendQueue,
    start: usize,
    available: i32,
    remaining: &mut i32,
) -> usize {
    let mut buffer_remaining = available;
    let mut idx = start;
    while buffer_remaining > 0 {
        let Some(node) = queue.get_mut(idx) else {
            break;
        };
        let send_remaining = node.payload.len() - node.sent_bytes;

        // grant the whole tail when it nearly fits, or when so little
        // budget remains that a fragment would not be worthwhile
        let grant = if send_remaining as i32 <= buffer_remaining + FRAG_THRESHOLD as i32
            || buffer_remaining <= FRAG_THRESHOLD as i32
        {
            send_remaining
        } else {
            buffer_remaining as usize
        };
        node.send_bytes = grant;

        // one byte of average header per message is estimate enough
        buffer_remaining -= grant as i32 + 1;
        idx += 1;
    }
    *remaining -= available - buffer_remaining;
    idx
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::sent::QueuedMessage,
    };

    const MAX_PAYLOAD: usize = 128;

    fn state() -> SendState {
        SendState::new(MAX_PAYLOAD, [AckId(500); 4], [AckId(500); 4])
    }

    fn stage(st: &mut SendState, stream: StreamId, payload: &[u8]) {
        st.staging[stream.index()].push_back(QueuedMessage::new(
            SuperOpcode::Data,
            Bytes::copy_from_slice(payload),
        ));
    }

    fn sent_ids(st: &SendState, stream: StreamId) -> Vec<u32> {
        let s = stream.index();
        let mut out = Vec::new();
        let mut cur = st.sent[s].head_ix();
        while let Some(ix) = cur {
            out.push(st.sent[s].get(ix).id.0);
            cur = st.sent[s].next_of(ix);
        }
        out
    }

    #[test]
    fn small_writes_cluster_together() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        stage(&mut st, stream, b"A");
        stage(&mut st, stream, b"B");
        stage(&mut st, stream, b"C");

        st.write_queued_reliable(1000);

        assert_eq!(vec![500, 501, 502], sent_ids(&st, stream));
        assert!(st.staging[1].is_empty());
        // everything packed into the one open cluster
        assert!(st.outbound.is_empty());
        assert!(!st.cluster.is_empty());
        assert_eq!(AckId(503), st.next_send_id[1]);
        // only the first message in the cluster represents loss
        let reps = sent_ids(&st, stream)
            .iter()
            .enumerate()
            .filter(|&(i, _)| {
                let mut cur = st.sent[1].head_ix();
                for _ in 0..i {
                    cur = st.sent[1].next_of(cur.unwrap());
                }
                st.sent[1].get(cur.unwrap()).loss_rep
            })
            .count();
        assert_eq!(1, reps);
    }

    #[test]
    fn oversized_message_fragments() {
        let mut st = state();
        let stream = StreamId::new(2).unwrap();
        let msg = vec![0xab; MAX_PAYLOAD * 3];
        stage(&mut st, stream, &msg);

        st.write_queued_reliable(1000);

        // several fragments, advancing one id each
        let ids = sent_ids(&st, stream);
        assert!(ids.len() >= 3, "got {ids:?}");
        assert_eq!(AckId(500 + ids.len() as u32), st.next_send_id[2]);
        assert!(st.staging[2].is_empty());
        assert!(!st.outbound.is_empty());

        // the pieces cover the message exactly, and each fits a
        // retransmission with the full tag
        let mut covered = 0;
        let mut cur = st.sent[2].head_ix();
        while let Some(ix) = cur {
            let node = st.sent[2].get(ix);
            covered += node.payload.len();
            let frag_start = match node.kind {
                SentKind::Fragment { start: true, .. } => FRAG_START_BYTES,
                SentKind::Fragment { .. } => 0,
                SentKind::Whole { .. } => panic!("every piece is a fragment"),
            };
            assert!(
                node.payload.len() + MAX_HEADER_BYTES + MAX_ACK_ID_BYTES + frag_start
                    <= MAX_PAYLOAD
            );
            cur = st.sent[2].next_of(ix);
        }
        assert_eq!(msg.len(), covered);
    }

    #[test]
    fn exact_fit_message_is_not_fragmented() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        // largest whole message: leave room for worst-case header and the
        // retransmission tag margin
        let len = MAX_PAYLOAD - MAX_HEADER_BYTES - MAX_ACK_ID_BYTES;
        stage(&mut st, stream, &vec![0x42; len]);

        st.write_queued_reliable(1000);

        let ids = sent_ids(&st, stream);
        assert_eq!(1, ids.len());
        let head = st.sent[1].head_ix().unwrap();
        assert!(matches!(st.sent[1].get(head).kind, SentKind::Whole { .. }));
    }

    #[test]
    fn id_span_guard_pauses_stream() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        st.next_send_id[1] = AckId(500 + MAX_ID_SPAN);
        stage(&mut st, stream, b"A");

        st.write_queued_reliable(1000);

        assert!(sent_ids(&st, stream).is_empty());
        assert_eq!(1, st.staging[1].len(), "message retained for later");
    }

    #[test]
    fn bulk_stream_gets_residue() {
        let mut st = state();
        stage(&mut st, StreamId::new(1).unwrap(), b"ordered");
        stage(&mut st, StreamId::BULK, b"bulk");

        st.write_queued_reliable(1000);

        assert!(st.staging[1].is_empty());
        assert!(st.staging[3].is_empty());
        assert_eq!(vec![500], sent_ids(&st, StreamId::BULK));
    }

    #[test]
    fn retransmission_uses_full_tag_and_sheds_loss_mark() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        stage(&mut st, stream, b"A");
        st.write_queued_reliable(1000);
        let ix = st.sent[1].head_ix().unwrap();
        assert!(st.sent[1].get(ix).loss_rep);

        // make the open cluster part of history
        st.outbound.push(st.cluster.take());

        st.retransmit(stream, ix, 2000);
        let node = st.sent[1].get(ix);
        assert!(node.retransmitted);
        assert!(!node.loss_rep);
        assert_eq!(1000, node.ts_firstsend);
        assert_eq!(2000, node.ts_lastsend);

        // the retransmission is alone in the fresh cluster: header byte,
        // 3-byte tag, payload
        assert_eq!(1 + MAX_ACK_ID_BYTES + 1, st.cluster.bytes());
    }

    #[test]
    fn timeout_retransmits_and_counts_one_loss() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        stage(&mut st, stream, b"A");
        stage(&mut st, stream, b"B");
        st.write_queued_reliable(1000);
        st.outbound.push(st.cluster.take());

        // before the timeout nothing fires
        assert_eq!(0, st.retransmit_lost(1000 + st.flow.rtt().loss_timeout() - 1));
        // after it, both messages retransmit but only the representative
        // counts
        let losses = st.retransmit_lost(1000 + st.flow.rtt().loss_timeout());
        assert_eq!(1, losses);

        // a second sweep immediately after fires nothing: backoff
        assert_eq!(0, st.retransmit_lost(1001 + st.flow.rtt().loss_timeout()));
    }

    #[test]
    fn budget_limits_transmission() {
        let mut st = state();
        let stream = StreamId::new(1).unwrap();
        // drain the epoch almost dry
        let budget = st.flow.remaining_bytes();
        st.flow.on_datagram_sent((budget - 8) as usize);
        stage(&mut st, stream, &vec![0x55; 4000]);

        st.write_queued_reliable(1000);
        let first_pass = sent_ids(&st, stream).len();

        // next epoch continues where we stopped
        st.flow.on_tick();
        st.write_queued_reliable(1020);
        assert!(sent_ids(&st, stream).len() > first_pass);
    }
}
