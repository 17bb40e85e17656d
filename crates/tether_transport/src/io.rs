//! The seams between the transport core and its collaborators.
//!
//! The transport owns no sockets, keys, or timers. Datagram encryption, the
//! UDP sink, and the application callbacks all live behind the traits here;
//! the host wires them together and drives [`Connection::tick`] from its
//! own timer.
//!
//! [`Connection::tick`]: crate::Connection::tick

use {crate::DisconnectReason, crate::stream::StreamId, bytes::Bytes};

/// A successfully opened datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// Plaintext length at the front of the buffer.
    pub len: usize,
    /// Transmission timestamp the sender embedded in the envelope, in the
    /// shared millisecond clock; drives transit-time statistics.
    pub send_time_ms: u32,
}

/// The authenticated-encryption envelope around every datagram.
///
/// Sealing appends a MAC and truncated IV; opening validates them, rejects
/// replays, and recovers the embedded send timestamp. The envelope also
/// exposes its key-derivation function, which the transport uses to derive
/// initial ACK-IDs (so the first reliable IDs are not known plaintext) and
/// to key the padding PRF.
pub trait Envelope {
    /// Bytes of overhead [`Envelope::seal`] appends to a plaintext.
    fn overhead(&self) -> usize;

    /// Seals `datagram` in place, appending [`Envelope::overhead`] bytes.
    ///
    /// Returns `false` if sealing failed; the datagram is then dropped.
    fn seal(&mut self, datagram: &mut Vec<u8>) -> bool;

    /// Opens a received datagram in place.
    ///
    /// On success the plaintext occupies the front `len` bytes of the
    /// buffer. Returns `None` for invalid or replayed datagrams.
    fn open(&mut self, datagram: &mut [u8]) -> Option<Opened>;

    /// Derives key material from the session key under a fixed label.
    ///
    /// Returns `false` if derivation failed.
    fn generate_key(&mut self, label: &str, out: &mut [u8]) -> bool;
}

/// Where sealed datagrams go.
pub trait DatagramSink {
    /// Posts a batch of sealed datagrams toward the peer.
    fn post_datagrams(&mut self, datagrams: &mut Vec<Vec<u8>>);
}

/// One received application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMessage {
    /// Stream the message arrived on; unreliable messages report the
    /// unordered stream.
    pub stream: StreamId,
    /// Message payload.
    pub payload: Bytes,
}

/// Callbacks from the transport into the layer above.
///
/// No connection lock is held while any of these run; it is safe to write
/// messages back into the connection from inside a callback.
pub trait TransportHandler {
    /// A batch of received messages, in delivery order.
    ///
    /// The batch buffer is reused; drain what you need from it.
    fn on_messages(&mut self, msgs: &mut Vec<RecvMessage>);

    /// One piece of a huge message on `stream`, delivered as it arrives.
    ///
    /// An empty `piece` marks the end of the huge message.
    fn on_partial_huge(&mut self, stream: StreamId, piece: &[u8]) {
        let _ = (stream, piece);
    }

    /// The peer probed the path with a datagram of this payload size.
    fn on_mtu_probe(&mut self, payload_len: usize) {
        let _ = payload_len;
    }

    /// An internal message with an opcode this layer does not define;
    /// reserved for higher-layer protocol extensions.
    fn on_internal(&mut self, opcode: u8, payload: &[u8]) {
        let _ = (opcode, payload);
    }

    /// The disconnect countdown completed; the connection is dead and may
    /// be dropped.
    fn on_disconnect(&mut self, reason: DisconnectReason);
}

/// Generator for random-length datagram padding and probe bodies.
///
/// Padding datagrams to exponentially distributed lengths blunts traffic
/// analysis of the encrypted stream. The generator is keyed from the
/// session so pad lengths are not predictable.
pub trait Padder {
    /// Keys the generator; called once at connection setup.
    fn rekey(&mut self, material: &[u8; 32]);

    /// How many pad bytes to append to a datagram of `data_bytes`, given
    /// the payload capacity. May return 0.
    fn pad_len(&mut self, data_bytes: usize, max_payload: usize) -> usize;

    /// Fills `out` with keystream bytes.
    fn fill(&mut self, out: &mut [u8]);
}

/// The default [`Padder`]: no padding, zeroed probe bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPadding;

impl Padder for NoPadding {
    fn rekey(&mut self, _material: &[u8; 32]) {}

    fn pad_len(&mut self, _data_bytes: usize, _max_payload: usize) -> usize {
        0
    }

    fn fill(&mut self, out: &mut [u8]) {
        out.fill(0);
    }
}
