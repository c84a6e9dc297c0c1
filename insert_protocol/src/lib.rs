//! The binary protocol spoken between the router and storage peers.
//!
//! A connection starts with a [handshake](handshake) negotiating the
//! [`ProtocolMode`] and the compression of each direction. After that the
//! client sends length-prefixed [frames](frame) and the peer answers every
//! data frame with a one byte [`Ack`] before it processes it.
//!
//! In [`ProtocolMode::Rpc`] every data frame is preceded by a frame naming
//! the [`RpcCall`]. Legacy peers never send or expect that name and only
//! understand row writes.

use std::{fmt::Display, io, time::Duration};

use thiserror::Error;

mod conn;
pub mod frame;
pub mod handshake;
mod row;
mod rpc;
pub mod server;

pub use conn::*;
pub use row::*;
pub use rpc::*;

/// Port a storage peer listens on for inserts when none is configured.
pub const DEFAULT_INSERT_PORT: u16 = 8400;

/// The largest data frame a storage peer accepts.
pub const MAX_INSERT_PACKET_SIZE: u64 = 100 * 1024 * 1024;

/// The largest block the router ever builds for a single send.
///
/// Kept well below [`MAX_INSERT_PACKET_SIZE`] so a block still fits after the
/// row encoding overhead of a peer running a different version.
pub const MAX_INSERT_PACKET_SIZE_FOR_ROUTER: usize = 30 * 1024 * 1024;

/// The longest RPC name a peer accepts.
pub const MAX_RPC_NAME_SIZE: u64 = 128;

/// Deadline for every individual read or write of the handshake.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Which framing a connection uses after its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMode {
    /// Data frames only. Every frame is a row write.
    Legacy,
    /// Every data frame is preceded by a frame carrying the RPC name.
    Rpc,
}

impl ProtocolMode {
    /// The hello a client sends to request this mode.
    pub fn client_hello(&self) -> &'static [u8] {
        match self {
            Self::Legacy => handshake::LEGACY_CLIENT_HELLO,
            Self::Rpc => handshake::RPC_CLIENT_HELLO,
        }
    }
}

impl Display for ProtocolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Rpc => f.write_str("rpc"),
        }
    }
}

/// Errors produced by the insert protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// The TCP connection could not be established.
    #[error("cannot dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred during one step of the handshake.
    #[error("handshake failed while exchanging {step}: {source}")]
    Handshake {
        step: handshake::Step,
        #[source]
        source: io::Error,
    },

    /// The peer answered a handshake step with unexpected bytes.
    #[error("handshake failed while exchanging {step}: unexpected bytes {got:?}")]
    HandshakeMismatch {
        step: handshake::Step,
        got: Vec<u8>,
    },

    /// An I/O error on an established connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A frame length prefix exceeds what the receiver accepts.
    #[error("frame of {size} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { size: u64, max: u64 },

    /// The peer acknowledged a block with an undefined status byte.
    #[error("unexpected ack byte {0}; want 1 or 2")]
    UnexpectedAck(u8),

    /// The RPC name frame does not name a known call.
    #[error("unknown rpc name {0:?}")]
    UnknownRpc(String),

    /// A row block could not be decoded.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// The call needs the RPC envelope but the connection is legacy.
    #[error("{0} is not supported on a legacy connection")]
    UnsupportedOnLegacy(RpcCall),
}

impl Error {
    /// True when the error shows that the peer refused the client hello.
    ///
    /// A peer that does not know the requested hello either replies with
    /// something other than the success token or closes the connection.
    pub fn is_hello_rejected(&self) -> bool {
        match self {
            Self::HandshakeMismatch { step, .. } => *step == handshake::Step::HelloAck,
            Self::Handshake { step, source } => {
                *step == handshake::Step::HelloAck
                    && matches!(
                        source.kind(),
                        io::ErrorKind::UnexpectedEof
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                    )
            }
            _ => false,
        }
    }
}

/// A specialized `Result` for protocol errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
