//! The cluster buffer: one in-progress outbound datagram being filled with
//! transport messages, and the queue of completed datagrams behind it.
//!
//! Outbound messages accumulate in the cluster until it cannot hold the
//! next one, at which point the buffer moves to the outbound queue and a
//! fresh cluster starts. The flush path drains the outbound queue through
//! the envelope to the datagram sink in one batch.
//!
//! The cluster caches the stream and following ACK-ID of the last reliable
//! message written into it: a subsequent reliable message on the same
//! stream with exactly that ID may omit its ACK-ID tag entirely, which is
//! the single largest space optimisation on the wire.

use crate::{packet::AckId, stream::StreamId};

/// The in-progress outbound datagram.
#[derive(Debug)]
pub struct SendCluster {
    buf: Vec<u8>,
    max_payload: usize,
    /// Stream of the last reliable message written, if any.
    pub stream: Option<StreamId>,
    /// The ACK-ID that would follow the last-written reliable message; a
    /// following reliable write with this ID needs no tag.
    pub next_id: AckId,
    /// Whether a message in this cluster already carries the
    /// loss-representative mark.
    pub loss_rep_present: bool,
}

impl SendCluster {
    /// Creates an empty cluster bounded by `max_payload` plaintext bytes.
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_payload),
            max_payload,
            stream: None,
            next_id: AckId(0),
            loss_rep_present: false,
        }
    }

    /// Bytes currently accumulated.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written since the last take.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Payload bytes still writable before the cluster must be flushed.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.max_payload - self.buf.len()
    }

    /// Plaintext capacity of one datagram.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether `n` more bytes fit without flushing first.
    #[must_use]
    pub fn fits(&self, n: usize) -> bool {
        self.buf.len() + n <= self.max_payload
    }

    /// The raw accumulation buffer, for codec writes.
    ///
    /// Callers check [`SendCluster::fits`] with the exact encoded size
    /// first; the buffer never exceeds the payload capacity.
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Extends the buffer by `n` bytes and returns the new window, or
    /// `None` if the cluster must be flushed first.
    pub fn grow(&mut self, n: usize) -> Option<&mut [u8]> {
        let start = self.buf.len();
        if start + n > self.max_payload {
            return None;
        }
        self.buf.resize(start + n, 0);
        Some(&mut self.buf[start..])
    }

    /// Takes the accumulated datagram, leaving the cluster empty with its
    /// caches reset.
    pub fn take(&mut self) -> Vec<u8> {
        self.stream = None;
        self.loss_rep_present = false;
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.max_payload))
    }

    /// Records that a reliable message for `stream` was just written whose
    /// successor ID is `next_id`.
    pub fn note_reliable(&mut self, stream: StreamId, next_id: AckId) {
        self.stream = Some(stream);
        self.next_id = next_id;
    }

    /// Whether a reliable write of `id` on `stream` may omit its ACK-ID
    /// tag.
    #[must_use]
    pub fn tag_elided(&self, stream: StreamId, id: AckId) -> bool {
        self.stream == Some(stream) && self.next_id == id
    }
}

/// Completed datagrams waiting for the next flush.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    datagrams: Vec<Vec<u8>>,
    bytes: usize,
}

impl OutboundQueue {
    /// Number of queued datagrams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    /// Whether no datagrams are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Total payload bytes queued; the transmitter subtracts this from the
    /// epoch budget before planning more work.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Queues a completed datagram.
    pub fn push(&mut self, datagram: Vec<u8>) {
        self.bytes += datagram.len();
        self.datagrams.push(datagram);
    }

    /// Takes every queued datagram for sealing and posting.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        std::mem::take(&mut self.datagrams)
    }
}
