//! Send-side bookkeeping: the per-stream FIFO of messages awaiting first
//! transmission, and the per-stream list of transmitted reliable messages
//! awaiting acknowledgment.
//!
//! The sent list is doubly linked in ascending ACK-ID order inside an index
//! arena. IDs are assigned monotonically, so insertion is always at the
//! tail; acknowledgment unlinks in O(1) through the node's own links.
//!
//! A fragmented message has one *master* entry shared by its fragments.
//! The master tracks how many fragments are still unacknowledged and
//! whether the final fragment has been transmitted; it is released when
//! both conditions close. Fragment payloads are cheap sub-slices of the
//! master's buffer, so the bytes themselves are freed by refcount when the
//! last holder drops.

use {
    crate::packet::{AckId, SuperOpcode},
    bytes::Bytes,
    std::collections::VecDeque,
};

/// An application message waiting for (more of) its first transmission.
#[derive(Debug)]
pub struct QueuedMessage {
    /// Super-opcode to transmit with; [`SuperOpcode::Data`] for application
    /// payloads, [`SuperOpcode::Internal`] for reliable internal messages.
    pub sop: SuperOpcode,
    /// Full message payload.
    pub payload: Bytes,
    /// Bytes already transmitted in earlier passes, when the message is
    /// being fragmented across ticks.
    pub sent_bytes: usize,
    /// Bytes the bandwidth planner granted this message for the current
    /// pass.
    pub send_bytes: usize,
    /// Fragment master in the stream's sent list, once the message has
    /// started fragmenting; later fragments must share it.
    pub master: Option<usize>,
}

impl QueuedMessage {
    /// Creates a queued message with no transmission progress.
    #[must_use]
    pub const fn new(sop: SuperOpcode, payload: Bytes) -> Self {
        Self {
            sop,
            payload,
            sent_bytes: 0,
            send_bytes: 0,
            master: None,
        }
    }
}

/// FIFO of messages awaiting first transmission on one stream.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<QueuedMessage>,
}

impl SendQueue {
    /// Appends a message to the back.
    pub fn push_back(&mut self, msg: QueuedMessage) {
        self.queue.push_back(msg);
    }

    /// Moves every message from `other` to the back of this queue,
    /// preserving order.
    pub fn steal(&mut self, other: &mut Self) {
        self.queue.append(&mut other.queue);
    }

    /// The message at the front, which may carry transmission progress.
    pub fn front_mut(&mut self) -> Option<&mut QueuedMessage> {
        self.queue.front_mut()
    }

    /// Removes the front message once fully transmitted.
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.queue.pop_front()
    }

    /// The message at `index` from the front.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut QueuedMessage> {
        self.queue.get_mut(index)
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every queued message.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Shared bookkeeping for one fragmented message.
#[derive(Debug)]
pub struct FragMaster {
    /// Total message length, for the fragment start header.
    pub total_len: usize,
    /// Fragments transmitted but not yet acknowledged.
    pub unacked: u32,
    /// Whether the final fragment has been transmitted.
    pub all_sent: bool,
}

/// What a sent-list node is a transmission of.
#[derive(Debug)]
pub enum SentKind {
    /// An entire message.
    Whole {
        /// Super-opcode it was transmitted with.
        sop: SuperOpcode,
    },
    /// One fragment of a message.
    Fragment {
        /// Index of the master entry in the owning [`SentList`].
        master: usize,
        /// Whether this is the first fragment, which carries the start
        /// header on the wire.
        start: bool,
    },
}

/// A transmitted reliable message (or fragment) awaiting acknowledgment.
#[derive(Debug)]
pub struct SentNode {
    /// ACK-ID this transmission consumed.
    pub id: AckId,
    /// Whole message or fragment.
    pub kind: SentKind,
    /// The exact payload bytes this node retransmits (excluding headers).
    pub payload: Bytes,
    /// Timestamp of first transmission, in host milliseconds.
    pub ts_firstsend: u32,
    /// Timestamp of the latest transmission.
    pub ts_lastsend: u32,
    /// Whether this node is its cluster's loss representative: the one node
    /// whose retransmission counts toward the tick's loss total.
    pub loss_rep: bool,
    /// Whether this node has ever been retransmitted; retransmitted nodes
    /// are excluded from RTT sampling.
    pub retransmitted: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl SentNode {
    /// Creates an unlinked node for a transmission happening now.
    #[must_use]
    pub const fn new(id: AckId, kind: SentKind, payload: Bytes, now_ms: u32, loss_rep: bool) -> Self {
        Self {
            id,
            kind,
            payload,
            ts_firstsend: now_ms,
            ts_lastsend: now_ms,
            loss_rep,
            retransmitted: false,
            prev: None,
            next: None,
        }
    }
}

/// The sent list of one stream, plus the fragment masters its nodes share.
#[derive(Debug, Default)]
pub struct SentList {
    nodes: Vec<Option<SentNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    masters: Vec<Option<FragMaster>>,
    masters_free: Vec<usize>,
    len: usize,
}

impl SentList {
    /// Number of unacknowledged transmissions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing awaits acknowledgment.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the oldest unacknowledged node.
    #[must_use]
    pub const fn head_ix(&self) -> Option<usize> {
        self.head
    }

    /// The node at `ix`.
    #[must_use]
    pub fn get(&self, ix: usize) -> &SentNode {
        self.nodes[ix]
            .as_ref()
            .expect("arena index points at an occupied slot")
    }

    /// The node at `ix`, mutably.
    pub fn get_mut(&mut self, ix: usize) -> &mut SentNode {
        self.nodes[ix]
            .as_mut()
            .expect("arena index points at an occupied slot")
    }

    /// Index of the node after `ix`.
    #[must_use]
    pub fn next_of(&self, ix: usize) -> Option<usize> {
        self.get(ix).next
    }

    /// Registers a new fragment master.
    pub fn new_master(&mut self, total_len: usize) -> usize {
        let master = FragMaster {
            total_len,
            unacked: 0,
            all_sent: false,
        };
        if let Some(ix) = self.masters_free.pop() {
            self.masters[ix] = Some(master);
            ix
        } else {
            self.masters.push(Some(master));
            self.masters.len() - 1
        }
    }

    /// The master entry at `ix`.
    #[must_use]
    pub fn master(&self, ix: usize) -> &FragMaster {
        self.masters[ix]
            .as_ref()
            .expect("master index points at an occupied slot")
    }

    /// The master entry at `ix`, mutably.
    pub fn master_mut(&mut self, ix: usize) -> &mut FragMaster {
        self.masters[ix]
            .as_mut()
            .expect("master index points at an occupied slot")
    }

    /// Marks a master's final fragment as transmitted.
    pub fn mark_all_sent(&mut self, master: usize) {
        self.master_mut(master).all_sent = true;
    }

    /// Appends a node; IDs are assigned monotonically, so the tail is
    /// always the right place.
    pub fn push_back(&mut self, mut node: SentNode) -> usize {
        debug_assert!(
            self.tail.is_none_or(|t| self.get(t).id < node.id),
            "sent-list IDs must ascend"
        );

        if let SentKind::Fragment { master, .. } = node.kind {
            self.master_mut(master).unacked += 1;
        }

        node.prev = self.tail;
        node.next = None;
        let ix = if let Some(ix) = self.free.pop() {
            self.nodes[ix] = Some(node);
            ix
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        };

        match self.tail {
            Some(t) => self.get_mut(t).next = Some(ix),
            None => self.head = Some(ix),
        }
        self.tail = Some(ix);
        self.len += 1;
        ix
    }

    /// Unlinks and returns the node at `ix`, updating its fragment master.
    ///
    /// A master whose fragments are all acknowledged and whose final
    /// fragment has been transmitted is released here.
    pub fn remove(&mut self, ix: usize) -> SentNode {
        let node = self.nodes[ix]
            .take()
            .expect("arena index points at an occupied slot");
        self.free.push(ix);
        self.len -= 1;

        match node.prev {
            Some(p) => self.get_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.get_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }

        if let SentKind::Fragment { master, .. } = node.kind {
            let entry = self.master_mut(master);
            entry.unacked -= 1;
            if entry.unacked == 0 && entry.all_sent {
                self.masters[master] = None;
                self.masters_free.push(master);
            }
        }

        node
    }

    /// Whether the master at `ix` is still live.
    #[must_use]
    pub fn master_is_live(&self, ix: usize) -> bool {
        self.masters.get(ix).is_some_and(Option::is_some)
    }

    /// Drops every node and master.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.masters.clear();
        self.masters_free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32) -> SentNode {
        SentNode {
            id: AckId(id),
            kind: SentKind::Whole {
                sop: SuperOpcode::Data,
            },
            payload: Bytes::from_static(b"x"),
            ts_firstsend: 0,
            ts_lastsend: 0,
            loss_rep: false,
            retransmitted: false,
            prev: None,
            next: None,
        }
    }

    fn ids(list: &SentList) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.head_ix();
        while let Some(ix) = cur {
            out.push(list.get(ix).id.0);
            cur = list.next_of(ix);
        }
        out
    }

    #[test]
    fn append_and_walk() {
        let mut list = SentList::default();
        for id in [5, 6, 7] {
            list.push_back(node(id));
        }
        assert_eq!(vec![5, 6, 7], ids(&list));
        assert_eq!(3, list.len());
    }

    #[test]
    fn remove_middle_relinks() {
        let mut list = SentList::default();
        let _five = list.push_back(node(5));
        let six = list.push_back(node(6));
        let _seven = list.push_back(node(7));

        let removed = list.remove(six);
        assert_eq!(AckId(6), removed.id);
        assert_eq!(vec![5, 7], ids(&list));
    }

    #[test]
    fn remove_head_and_tail() {
        let mut list = SentList::default();
        let five = list.push_back(node(5));
        let six = list.push_back(node(6));

        list.remove(five);
        assert_eq!(vec![6], ids(&list));
        list.remove(six);
        assert!(list.is_empty());
        assert!(list.head_ix().is_none());

        // slots are reused
        list.push_back(node(8));
        assert_eq!(vec![8], ids(&list));
    }

    fn frag(list: &mut SentList, master: usize, id: u32, start: bool) -> usize {
        let mut n = node(id);
        n.kind = SentKind::Fragment { master, start };
        list.push_back(n)
    }

    #[test]
    fn master_survives_early_acks() {
        let mut list = SentList::default();
        let master = list.new_master(4096);

        let first = frag(&mut list, master, 5, true);
        let second = frag(&mut list, master, 6, false);
        assert_eq!(2, list.master(master).unacked);

        // acks for the early fragments arrive before the final fragment has
        // even been transmitted: the master must survive
        list.remove(first);
        list.remove(second);
        assert!(list.master_is_live(master));
        assert_eq!(0, list.master(master).unacked);

        let tail = frag(&mut list, master, 7, false);
        list.mark_all_sent(master);
        assert!(list.master_is_live(master));

        list.remove(tail);
        assert!(!list.master_is_live(master));
    }

    #[test]
    fn master_released_on_last_ack() {
        let mut list = SentList::default();
        let master = list.new_master(2400);

        let first = frag(&mut list, master, 5, true);
        let second = frag(&mut list, master, 6, false);
        list.mark_all_sent(master);

        list.remove(second);
        assert!(list.master_is_live(master));
        list.remove(first);
        assert!(!list.master_is_live(master));
    }
}
