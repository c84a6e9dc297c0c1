use std::{
    io::{self, BufReader, BufWriter, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use snap::{read::FrameDecoder, write::FrameEncoder};

use crate::{
    Error, ProtocolMode, Result,
    handshake::{self, Negotiated},
};

const BUF_SIZE: usize = 64 * 1024;

enum Reader {
    Plain(BufReader<TcpStream>),
    Snappy(Box<FrameDecoder<BufReader<TcpStream>>>),
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Snappy(r) => r.read(buf),
        }
    }
}

enum Writer {
    Plain(BufWriter<TcpStream>),
    Snappy(Box<FrameEncoder<TcpStream>>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Snappy(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Snappy(w) => w.flush(),
        }
    }
}

/// A handshaken connection with buffered, optionally snappy compressed,
/// reads and writes.
///
/// Each direction is compressed independently, as negotiated by its writer.
/// Writes are buffered until [`Write::flush`].
pub struct BufferedConn {
    stream: TcpStream,
    peer: SocketAddr,
    negotiated: Negotiated,
    reader: Reader,
    writer: Writer,
}

impl std::fmt::Debug for BufferedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedConn")
            .field("peer", &self.peer)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl BufferedConn {
    /// Dial `addr` within `dial_timeout` and run the client handshake.
    pub fn connect(
        addr: &str,
        dial_timeout: Duration,
        compress: bool,
        mode: ProtocolMode,
    ) -> Result<Self> {
        let mut stream = dial(addr, dial_timeout)?;
        let negotiated = handshake::client(&mut stream, compress, mode)?;
        Self::new(stream, negotiated)
    }

    /// Run the server handshake on an accepted `stream`.
    pub fn accept(mut stream: TcpStream, compress: bool, legacy_only: bool) -> Result<Self> {
        let negotiated = handshake::server(&mut stream, compress, legacy_only)?;
        Self::new(stream, negotiated)
    }

    fn new(stream: TcpStream, negotiated: Negotiated) -> Result<Self> {
        let peer = stream.peer_addr()?;
        // Handshake deadlines do not carry over to the data phase.
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        let r = BufReader::with_capacity(BUF_SIZE, stream.try_clone()?);
        let reader = if negotiated.remote_compression {
            Reader::Snappy(Box::new(FrameDecoder::new(r)))
        } else {
            Reader::Plain(r)
        };

        let w = stream.try_clone()?;
        let writer = if negotiated.local_compression {
            Writer::Snappy(Box::new(FrameEncoder::new(w)))
        } else {
            Writer::Plain(BufWriter::with_capacity(BUF_SIZE, w))
        };

        Ok(Self {
            stream,
            peer,
            negotiated,
            reader,
            writer,
        })
    }

    /// The framing negotiated for this connection.
    pub fn mode(&self) -> ProtocolMode {
        self.negotiated.mode
    }

    /// Whether this side compresses its writes.
    pub fn is_compressed(&self) -> bool {
        self.negotiated.local_compression
    }

    /// The remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bound every following socket read by `timeout`; `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Bound every following socket write by `timeout`; `None` blocks forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// Shut down both directions of the socket.
    ///
    /// Buffered but unflushed writes are discarded.
    pub fn close(self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // The peer may have gone first.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            r => r,
        }
    }
}

impl Read for BufferedConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for BufferedConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let map = |source| Error::Dial {
        addr: addr.to_string(),
        source,
    };

    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs().map_err(map)? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(map)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(map(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
    })))
}
