#![doc = include_str!("../README.md")]

mod ack;
pub mod cluster;
pub mod connection;
pub mod flow;
pub mod frag;
pub mod io;
pub mod packet;
mod recv;
pub mod rtt;
mod send;
pub mod sent;
pub mod stream;
pub mod wait;

pub use {
    connection::{Connection, ConnectionConfig, KeyDerivationFailed, ProbeError, SendError},
    io::{DatagramSink, Envelope, NoPadding, Opened, Padder, RecvMessage, TransportHandler},
    recv::RecvError,
    send::{FRAG_THRESHOLD, MAX_RELIABLE_LEN},
    stream::StreamId,
};

/// Smallest MTU any conforming path must support; the initial payload size
/// is derived from this until probing discovers a larger one.
pub const MINIMUM_MTU: usize = 576;

/// Largest MTU the probe logic will attempt.
pub const MAXIMUM_MTU: usize = 1500;

/// Bytes of IPv4 header overhead per datagram.
pub const IPV4_HEADER_BYTES: usize = 20;

/// Bytes of IPv6 header overhead per datagram.
pub const IPV6_HEADER_BYTES: usize = 40;

/// Bytes of UDP header overhead per datagram.
pub const UDP_HEADER_BYTES: usize = 8;

/// A connection with no received datagrams for this long transitions to
/// disconnected with [`DisconnectReason::Timeout`].
pub const TIMEOUT_DISCONNECT_MS: u32 = 15_000;

/// How many ticks a disconnect notice is re-sent for before the connection
/// reports completion; datagrams are lossy, so one notice is not enough.
pub const SHUTDOWN_TICK_COUNT: u32 = 5;

/// Why a connection was torn down.
///
/// Reasons are opaque to the transport: they travel as a single byte inside
/// the disconnect notice and are surfaced verbatim to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The remote key did not match ours.
    WrongKey,
    /// The server had no free connection slots.
    ServerFull,
    /// The remote flagged us as flooding.
    FloodDetected,
    /// Datagram tampering was detected.
    Tampering,
    /// Internal error on the remote side.
    ServerError,
    /// No datagrams received for [`TIMEOUT_DISCONNECT_MS`].
    Timeout,
    /// The local application closed the connection.
    UserClosed,
    /// A reason byte this layer does not define.
    Other(u8),
}

impl DisconnectReason {
    /// Converts a wire reason byte into a reason.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::WrongKey,
            2 => Self::ServerFull,
            3 => Self::FloodDetected,
            4 => Self::Tampering,
            5 => Self::ServerError,
            6 => Self::Timeout,
            7 => Self::UserClosed,
            raw => Self::Other(raw),
        }
    }

    /// Converts this reason into its wire byte.
    #[must_use]
    pub const fn into_raw(self) -> u8 {
        match self {
            Self::WrongKey => 1,
            Self::ServerFull => 2,
            Self::FloodDetected => 3,
            Self::Tampering => 4,
            Self::ServerError => 5,
            Self::Timeout => 6,
            Self::UserClosed => 7,
            Self::Other(raw) => raw,
        }
    }
}

/// Computes the number of plaintext payload bytes available in one datagram
/// for a given path MTU.
///
/// The envelope's seal overhead and the IP/UDP headers both eat into the
/// MTU; what remains is what the cluster buffer may fill.
#[must_use]
pub const fn max_payload_bytes(mtu: usize, ipv6: bool, envelope_overhead: usize) -> usize {
    let ip = if ipv6 {
        IPV6_HEADER_BYTES
    } else {
        IPV4_HEADER_BYTES
    };
    mtu - ip - UDP_HEADER_BYTES - envelope_overhead
}
