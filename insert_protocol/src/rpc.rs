use std::{
    fmt::Display,
    io::{Read, Write},
    time::Duration,
};

use crate::{
    BufferedConn, Error, MAX_INSERT_PACKET_SIZE, MAX_RPC_NAME_SIZE, ProtocolMode, Result,
    frame::{read_frame, read_frame_opt, write_frame},
};

/// A remote procedure a client can invoke on a storage peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCall {
    /// Store a block of encoded rows.
    WriteRows,
    /// Store a block of series metadata.
    WriteMetadata,
}

impl RpcCall {
    /// The versioned name sent in the RPC name frame.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WriteRows => "writeRows_v1",
            Self::WriteMetadata => "writeMetadata_v1",
        }
    }

    /// Resolve an RPC name frame.
    pub fn from_name(name: &[u8]) -> Result<Self> {
        match name {
            b"writeRows_v1" => Ok(Self::WriteRows),
            b"writeMetadata_v1" => Ok(Self::WriteMetadata),
            _ => Err(Error::UnknownRpc(String::from_utf8_lossy(name).into_owned())),
        }
    }
}

impl Display for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The status byte a peer writes after fully reading a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The block was accepted.
    Accepted,
    /// The block was received but the peer is read-only and did not store it.
    ReadOnly,
}

impl Ack {
    /// The wire encoding of this ack.
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Accepted => 1,
            Self::ReadOnly => 2,
        }
    }

    /// Decode an ack byte; anything but `1` or `2` is a protocol violation.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Self::Accepted),
            2 => Ok(Self::ReadOnly),
            v => Err(Error::UnexpectedAck(v)),
        }
    }
}

/// The slowest link throughput a send deadline has to allow for.
const SEND_BYTES_PER_SEC: usize = 300_000;
const MIN_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// The write deadline and the ack read deadline for a block of `len` bytes.
pub fn send_timeout(len: usize) -> Duration {
    MIN_SEND_TIMEOUT.max(Duration::from_secs((len / SEND_BYTES_PER_SEC) as u64))
}

/// Send `payload` as a `call` and wait for the peer's ack.
///
/// The block only counts as delivered once the ack byte has been read. An
/// empty payload is not sent at all.
pub fn send_block(conn: &mut BufferedConn, call: RpcCall, payload: &[u8]) -> Result<Ack> {
    if payload.is_empty() {
        return Ok(Ack::Accepted);
    }
    send_frames(conn, call, payload)
}

/// Send a rows block without rows and return the peer's ack.
///
/// Peers acknowledge it like any other block without storing anything, so
/// it tells whether a read-only peer accepts writes again.
pub fn send_empty_block(conn: &mut BufferedConn) -> Result<Ack> {
    send_frames(conn, RpcCall::WriteRows, &[])
}

fn send_frames(conn: &mut BufferedConn, call: RpcCall, payload: &[u8]) -> Result<Ack> {
    let timeout = send_timeout(payload.len());
    conn.set_write_timeout(Some(timeout))?;
    match conn.mode() {
        ProtocolMode::Rpc => write_frame(conn, call.name().as_bytes())?,
        ProtocolMode::Legacy if call != RpcCall::WriteRows => {
            return Err(Error::UnsupportedOnLegacy(call));
        }
        ProtocolMode::Legacy => {}
    }
    write_frame(conn, payload)?;
    conn.flush()?;

    conn.set_read_timeout(Some(timeout))?;
    let mut ack = [0; 1];
    conn.read_exact(&mut ack)?;
    Ack::from_byte(ack[0])
}

/// Read the next block sent with [`send_block`] into `buf`.
///
/// Returns `Ok(None)` when the client closed the connection between blocks.
/// The caller must write an ack for every block returned.
pub fn read_block(conn: &mut BufferedConn, buf: &mut Vec<u8>) -> Result<Option<RpcCall>> {
    let call = match conn.mode() {
        ProtocolMode::Rpc => {
            if !read_frame_opt(conn, MAX_RPC_NAME_SIZE, buf)? {
                return Ok(None);
            }
            let call = RpcCall::from_name(buf)?;
            read_frame(conn, MAX_INSERT_PACKET_SIZE, buf)?;
            call
        }
        ProtocolMode::Legacy => {
            if !read_frame_opt(conn, MAX_INSERT_PACKET_SIZE, buf)? {
                return Ok(None);
            }
            RpcCall::WriteRows
        }
    };
    Ok(Some(call))
}

/// Write `ack` for the block last returned by [`read_block`].
pub fn write_ack(conn: &mut BufferedConn, ack: Ack, timeout: Duration) -> Result<()> {
    conn.set_write_timeout(Some(timeout))?;
    conn.write_all(&[ack.as_byte()])?;
    conn.flush()?;
    Ok(())
}
