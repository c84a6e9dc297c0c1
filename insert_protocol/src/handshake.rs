//! Connection setup between a router (client) and a storage peer (server).
//!
//! The exchange, with every read and write bounded by
//! [`HANDSHAKE_STEP_TIMEOUT`]:
//!
//! ```text
//! client                         server
//!   hello (14 bytes)        ->
//!                           <-   "ok"
//!   compression flag (1)    ->
//!                           <-   "ok"
//!                           <-   compression flag (1)
//!   "ok"                    ->
//! ```
//!
//! A compression flag of `1` means the sender compresses everything it
//! writes after the handshake; `0` means it does not.

use std::{
    fmt::Display,
    io::{Read, Write},
    net::TcpStream,
};

use crate::{Error, HANDSHAKE_STEP_TIMEOUT, ProtocolMode, Result};

/// Hello of clients that send bare data frames.
pub const LEGACY_CLIENT_HELLO: &[u8] = b"inserthello.02";

/// Hello of clients that prefix each data frame with an RPC name frame.
pub const RPC_CLIENT_HELLO: &[u8] = b"inserthello.03";

const HELLO_LEN: usize = 14;

/// The token acknowledging a handshake step.
pub const SUCCESS: &[u8] = b"ok";

/// A single step of the handshake, named by the message being exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Hello,
    HelloAck,
    ClientCompression,
    ClientCompressionAck,
    ServerCompression,
    ServerCompressionAck,
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hello => "hello",
            Self::HelloAck => "hello ack",
            Self::ClientCompression => "client compression flag",
            Self::ClientCompressionAck => "client compression flag ack",
            Self::ServerCompression => "server compression flag",
            Self::ServerCompressionAck => "server compression flag ack",
        };
        f.write_str(s)
    }
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub mode: ProtocolMode,
    /// Whether this side compresses what it writes.
    pub local_compression: bool,
    /// Whether the peer compresses what it writes.
    pub remote_compression: bool,
}

/// Run the client side of the handshake on a freshly dialed `stream`.
pub fn client(stream: &mut TcpStream, compress: bool, mode: ProtocolMode) -> Result<Negotiated> {
    write_step(stream, Step::Hello, mode.client_hello())?;
    expect_success(stream, Step::HelloAck)?;

    write_step(stream, Step::ClientCompression, &[compress as u8])?;
    expect_success(stream, Step::ClientCompressionAck)?;

    let remote_compression = read_flag(stream, Step::ServerCompression)?;
    write_step(stream, Step::ServerCompressionAck, SUCCESS)?;

    Ok(Negotiated {
        mode,
        local_compression: compress,
        remote_compression,
    })
}

/// Run the server side of the handshake on an accepted `stream`.
///
/// A server running with `legacy_only` treats the RPC hello as unknown and
/// closes the connection without replying, exactly like a peer that predates
/// the RPC envelope.
pub fn server(stream: &mut TcpStream, compress: bool, legacy_only: bool) -> Result<Negotiated> {
    let hello = read_step::<HELLO_LEN>(stream, Step::Hello)?;
    let mode = match &hello[..] {
        LEGACY_CLIENT_HELLO => ProtocolMode::Legacy,
        RPC_CLIENT_HELLO if !legacy_only => ProtocolMode::Rpc,
        _ => {
            return Err(Error::HandshakeMismatch {
                step: Step::Hello,
                got: hello.to_vec(),
            });
        }
    };
    write_step(stream, Step::HelloAck, SUCCESS)?;

    let remote_compression = read_flag(stream, Step::ClientCompression)?;
    write_step(stream, Step::ClientCompressionAck, SUCCESS)?;

    write_step(stream, Step::ServerCompression, &[compress as u8])?;
    expect_success(stream, Step::ServerCompressionAck)?;

    Ok(Negotiated {
        mode,
        local_compression: compress,
        remote_compression,
    })
}

fn write_step(stream: &mut TcpStream, step: Step, data: &[u8]) -> Result<()> {
    let map = |source| Error::Handshake { step, source };
    stream
        .set_write_timeout(Some(HANDSHAKE_STEP_TIMEOUT))
        .map_err(map)?;
    stream.write_all(data).map_err(map)?;
    stream.flush().map_err(map)
}

fn read_step<const N: usize>(stream: &mut TcpStream, step: Step) -> Result<[u8; N]> {
    let map = |source| Error::Handshake { step, source };
    stream
        .set_read_timeout(Some(HANDSHAKE_STEP_TIMEOUT))
        .map_err(map)?;
    let mut buf = [0; N];
    stream.read_exact(&mut buf).map_err(map)?;
    Ok(buf)
}

fn expect_success(stream: &mut TcpStream, step: Step) -> Result<()> {
    let got = read_step::<2>(stream, step)?;
    if got[..] != *SUCCESS {
        return Err(Error::HandshakeMismatch {
            step,
            got: got.to_vec(),
        });
    }
    Ok(())
}

fn read_flag(stream: &mut TcpStream, step: Step) -> Result<bool> {
    match read_step::<1>(stream, step)? {
        [0] => Ok(false),
        [1] => Ok(true),
        got => Err(Error::HandshakeMismatch {
            step,
            got: got.to_vec(),
        }),
    }
}
