//! Per-stream queue of reliable messages that arrived ahead of their turn.
//!
//! Nodes are kept in ascending ACK-ID order in a singly linked list backed
//! by an arena of indices, so list surgery cannot create dangling
//! references. Each node additionally carries an `eos` (end-of-sequence)
//! index: for any node `n` that heads a maximal contiguous run of IDs,
//! `n.eos` names the last node of that run. Insertion and ACK-range
//! emission both walk run heads only, so they cost O(runs) rather than
//! O(queued messages).

use {
    crate::packet::{AckId, SuperOpcode},
    bytes::Bytes,
};

/// Hard cap on queued out-of-order arrivals per stream; beyond this the
/// arrival is dropped and the sender retransmits later.
pub const OUT_OF_ORDER_LIMIT: usize = 128;

/// Cap on run-head hops per insertion or ACK walk, bounding the cost of a
/// pathologically gappy queue.
pub const OUT_OF_ORDER_LOOPS: usize = 32;

/// A queued out-of-order arrival.
#[derive(Debug)]
pub struct WaitNode {
    /// ACK-ID of the arrival.
    pub id: AckId,
    /// Super-opcode the arrival carried.
    pub sop: SuperOpcode,
    /// Payload; empty for unordered-stream placeholders whose data was
    /// already delivered.
    pub payload: Bytes,
    eos: usize,
    next: Option<usize>,
}

/// What [`WaitQueue::insert`] did with an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The arrival was queued.
    Queued,
    /// An arrival with this ID is already queued or was already delivered.
    Duplicate,
    /// The queue is at capacity, or the insertion point was too many runs
    /// deep; the arrival was dropped.
    Dropped,
}

/// The receive-wait queue of one stream.
#[derive(Debug, Default)]
pub struct WaitQueue {
    nodes: Vec<Option<WaitNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    len: usize,
}

impl WaitQueue {
    /// Number of queued arrivals.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no arrivals are queued.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, ix: usize) -> &WaitNode {
        self.nodes[ix]
            .as_ref()
            .expect("arena index points at an occupied slot")
    }

    fn node_mut(&mut self, ix: usize) -> &mut WaitNode {
        self.nodes[ix]
            .as_mut()
            .expect("arena index points at an occupied slot")
    }

    fn alloc(&mut self, node: WaitNode) -> usize {
        if let Some(ix) = self.free.pop() {
            self.nodes[ix] = Some(node);
            ix
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, ix: usize) -> WaitNode {
        let node = self.nodes[ix]
            .take()
            .expect("arena index points at an occupied slot");
        self.free.push(ix);
        node
    }

    /// Queues an out-of-order arrival, maintaining ascending ID order and
    /// the `eos` skip indices.
    pub fn insert(&mut self, id: AckId, sop: SuperOpcode, payload: Bytes) -> InsertOutcome {
        if self.len >= OUT_OF_ORDER_LIMIT {
            return InsertOutcome::Dropped;
        }

        // walk run heads to the insertion point
        let mut next = self.head;
        let mut prev: Option<usize> = None;
        let mut prev_seq: Option<usize> = None;
        let mut hops = 0;
        while let Some(nix) = next {
            if id < self.node(nix).id {
                break;
            }

            let eos = self.node(nix).eos;
            if id <= self.node(eos).id {
                return InsertOutcome::Duplicate;
            }

            prev_seq = Some(nix);
            prev = Some(eos);
            next = self.node(eos).next;

            hops += 1;
            if hops >= OUT_OF_ORDER_LOOPS {
                return InsertOutcome::Dropped;
            }
        }

        let new_ix = self.alloc(WaitNode {
            id,
            sop,
            payload,
            eos: 0,
            next,
        });

        match prev {
            Some(p) => self.node_mut(p).next = Some(new_ix),
            None => self.head = Some(new_ix),
        }

        // splice the skip indices: the new node may extend the previous
        // run, start a new one, or bridge the previous and next runs
        let extends_prev = prev.is_some_and(|p| self.node(p).id.next() == id);
        let joins_next = next.is_some_and(|n| id.next() == self.node(n).id);
        let eos = if joins_next {
            self.node(next.expect("joins_next implies a next node")).eos
        } else {
            new_ix
        };
        self.node_mut(new_ix).eos = eos;
        if extends_prev {
            let run_head = prev_seq.expect("extends_prev implies a previous run");
            self.node_mut(run_head).eos = eos;
        }

        self.len += 1;
        InsertOutcome::Queued
    }

    /// Pops the head node if its ID equals `expected`.
    ///
    /// The caller drains a ready run by calling this repeatedly with an
    /// advancing expected ID; runs are maximal, so the drain never stops
    /// partway through one.
    pub fn pop_ready(&mut self, expected: AckId) -> Option<WaitNode> {
        let head = self.head?;
        if self.node(head).id != expected {
            return None;
        }
        let node = self.release(head);
        self.head = node.next;
        self.len -= 1;
        Some(node)
    }

    /// Collects the (first, last) ID of each contiguous run, up to
    /// [`OUT_OF_ORDER_LOOPS`] runs or `max_runs`, whichever is smaller.
    ///
    /// Returns `true` if every run was collected; `false` means the caller
    /// should keep its ACK flag armed and emit the rest next tick.
    pub fn collect_runs(&self, max_runs: usize, out: &mut Vec<(AckId, AckId)>) -> bool {
        let mut node = self.head;
        let mut hops = 0;
        while let Some(nix) = node {
            if hops >= max_runs.min(OUT_OF_ORDER_LOOPS) {
                return false;
            }
            let eos = self.node(nix).eos;
            out.push((self.node(nix).id, self.node(eos).id));
            node = self.node(eos).next;
            hops += 1;
        }
        true
    }

    /// Drops every queued node, releasing their payloads.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.len = 0;
    }
}
