//! Selective-acknowledgment emission and application.
//!
//! The receiver side walks each stream's wait queue: one rollup field for
//! the next expected ID, then one range field per contiguous run beyond
//! it. The sender side applies those fields against its sent lists,
//! releasing covered nodes. Everything a rollup leaves behind *below* the
//! rolled-up ID was seen past by the receiver, so it retransmits on the
//! shorter negative-ACK timeout.

use {
    crate::{
        packet::{AckField, AckId, MAX_HEADER_BYTES, ROLLUP_ID_BITS, SuperOpcode, TripTime},
        recv::RecvState,
        send::SendState,
        stream::StreamId,
        wait::OUT_OF_ORDER_LOOPS,
    },
    bytes::{Buf, Bytes},
    octs::{EncodeLen, Read, Write},
    tracing::{trace, warn},
};

/// Builds the body of one ACK message from the streams that owe one.
///
/// Streams are visited in priority order; if the body would overflow one
/// datagram's payload, later fields wait for the next tick (their
/// got-reliable flags stay armed). Returns `None` when no stream owes an
/// ACK.
pub fn encode_ack_body(recv: &mut RecvState, max_payload: usize) -> Option<Vec<u8>> {
    if !recv.any_ack_due() {
        return None;
    }

    let mut body = Vec::new();
    body.write(&TripTime::new(recv.take_trip_avg()))
        .expect("vec writes grow");
    let budget = max_payload - MAX_HEADER_BYTES;

    let mut runs = Vec::new();
    for stream in StreamId::all() {
        let s = stream.index();
        if !recv.got_reliable[s] {
            continue;
        }
        if budget - body.len() < 3 {
            warn!("ACK truncated for space, remainder next tick");
            break;
        }

        let rollup = recv.next_expected[s];
        body.write(&AckField::Rollup {
            stream,
            partial: rollup.0 & ((1 << ROLLUP_ID_BITS) - 1),
        })
        .expect("rollup fields always encode");
        trace!(%stream, id = rollup.0, "Acknowledging rollup");

        runs.clear();
        let mut complete = recv.wait[s].collect_runs(OUT_OF_ORDER_LOOPS, &mut runs);
        let mut last = rollup;
        for &(start, end) in &runs {
            let field = AckField::Range {
                start_offset: start.0.wrapping_sub(last.0),
                end_offset: end.0.wrapping_sub(start.0),
            };
            if budget - body.len() < field.encode_len() {
                warn!("ACK truncated for space, remainder next tick");
                complete = false;
                break;
            }
            body.write(&field).expect("offsets fit the range encoding");
            trace!(%stream, start = start.0, end = end.0, "Acknowledging range");
            last = end;
        }

        if complete {
            recv.got_reliable[s] = false;
        }
    }

    Some(body)
}

/// Appends an encoded ACK body to the cluster as an unreliable message.
pub fn append_ack_message(send: &mut SendState, body: &[u8]) {
    if !send.append_unreliable(SuperOpcode::Ack, body) {
        warn!("ACK message could not be written");
    }
}

/// Applies one received ACK body against the sent lists.
///
/// Walks the fields in order. Each rollup closes out the previous stream
/// with a negative-ACK sweep, then releases everything the new rollup
/// covers; ranges release runs beyond it. The final stream's sweep runs
/// when the body ends.
pub fn apply_ack_body(send: &mut SendState, mut body: Bytes, recv_ms: u32) {
    let Ok(trip) = body.read::<TripTime>() else {
        warn!("Truncated ACK trip time ignored");
        return;
    };
    send.flow.on_remote_trip(trip.0);

    // context from the last rollup: stream and the last emitted ID,
    // which range offsets accumulate onto
    let mut ctx: Option<(StreamId, AckId)> = None;

    while body.has_remaining() {
        let Ok(field) = body.read::<AckField>() else {
            warn!("Truncated ACK field ignored");
            break;
        };
        match field {
            AckField::Rollup { stream, partial } => {
                if let Some((prev_stream, last)) = ctx.take() {
                    nack_sweep(send, prev_stream, last, recv_ms);
                }

                let s = stream.index();
                let Some(head) = send.sent[s].head_ix() else {
                    // nothing outstanding; ranges for this stream are
                    // no-ops too
                    continue;
                };
                let rollup = AckId::reconstruct(ROLLUP_ID_BITS, send.sent[s].get(head).id, partial);
                send.remote_expected[s] = rollup;
                trace!(%stream, id = rollup.0, "Rollup acknowledged");

                release_below(send, stream, rollup, recv_ms);
                ctx = Some((stream, rollup));
            }
            AckField::Range {
                start_offset,
                end_offset,
            } => {
                let Some((stream, last)) = ctx.as_mut() else {
                    continue;
                };
                let start = AckId(last.0.wrapping_add(start_offset));
                let end = AckId(start.0.wrapping_add(end_offset));
                trace!(stream = %*stream, start = start.0, end = end.0, "Range acknowledged");

                release_range(send, *stream, start, end, recv_ms);
                *last = end;
            }
        }
    }

    if let Some((stream, last)) = ctx {
        nack_sweep(send, stream, last, recv_ms);
    }
}

/// Releases every sent node below `rollup`.
fn release_below(send: &mut SendState, stream: StreamId, rollup: AckId, recv_ms: u32) {
    let s = stream.index();
    while let Some(head) = send.sent[s].head_ix() {
        if !(send.sent[s].get(head).id < rollup) {
            break;
        }
        release_acked(send, stream, head, recv_ms);
    }
}

/// Releases every sent node with ID in `start..=end`.
fn release_range(send: &mut SendState, stream: StreamId, start: AckId, end: AckId, recv_ms: u32) {
    let s = stream.index();
    let mut cur = send.sent[s].head_ix();
    while let Some(ix) = cur {
        let id = send.sent[s].get(ix).id;
        cur = send.sent[s].next_of(ix);
        if id < start {
            continue;
        }
        if end < id {
            break;
        }
        release_acked(send, stream, ix, recv_ms);
    }
}

/// Removes one acknowledged node, feeding the RTT estimator when the node
/// is a clean first-transmission sample.
fn release_acked(send: &mut SendState, stream: StreamId, ix: usize, recv_ms: u32) {
    let s = stream.index();
    let node = send.sent[s].remove(ix);
    if !node.retransmitted {
        send.flow
            .on_rtt_sample(recv_ms.wrapping_sub(node.ts_firstsend));
    }
}

/// Retransmits unacknowledged nodes the receiver has demonstrably seen
/// past, on the shorter confirmed-loss timeout.
fn nack_sweep(send: &mut SendState, stream: StreamId, last_ack_id: AckId, recv_ms: u32) {
    let s = stream.index();
    let timeout = send.flow.rtt().nack_timeout();
    let mut losses = 0;
    let mut swept = false;

    let mut cur = send.sent[s].head_ix();
    while let Some(ix) = cur {
        cur = send.sent[s].next_of(ix);
        let node = send.sent[s].get(ix);
        if !(node.id < last_ack_id) {
            break;
        }

        let mia = recv_ms.wrapping_sub(node.ts_lastsend) as i32;
        let backoff = send
            .flow
            .rtt()
            .backoff(node.retransmitted, node.ts_firstsend, node.ts_lastsend);
        if mia >= (timeout + backoff) as i32 {
            losses += u32::from(node.loss_rep);
            swept = true;
            send.retransmit(stream, ix, recv_ms);
        }
    }

    // the cluster's representative may itself have been acknowledged; a
    // confirmed drop still counts once, never once per contained message
    if swept && losses == 0 {
        losses = 1;
    }
    if losses > 0 {
        send.flow.on_loss(losses);
    }
}
