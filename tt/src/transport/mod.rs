//! Line-oriented transport to the table controller
//!
//! The transport is split into an owned read half, consumed by the token
//! stream's read loop, and a write half shared by the command layer. Lines
//! are terminated with `\n`; a trailing `\r` is dropped on read.

mod serial;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::config::PortConfig;
use crate::error::TransportError;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Prefix selecting a TCP connection instead of a local device
pub const TCP_SCHEME: &str = "tcp://";

/// Where the controller is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortTarget {
    /// Local serial device, e.g. `/dev/ttyUSB0`
    Device(PathBuf),
    /// `host:port` of a serial-over-network bridge or simulator
    Tcp(String),
}

impl PortTarget {
    pub fn parse(target: &str) -> Self {
        match target.strip_prefix(TCP_SCHEME) {
            Some(addr) => PortTarget::Tcp(addr.to_string()),
            None => PortTarget::Device(PathBuf::from(target)),
        }
    }
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortTarget::Device(path) => write!(f, "{}", path.display()),
            PortTarget::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

/// Read half: yields one line per call, blocking until it arrives
pub struct TransportReader {
    inner: BufReader<BoxedRead>,
    buf: Vec<u8>,
}

impl TransportReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: BufReader::new(Box::new(reader)),
            buf: Vec::new(),
        }
    }

    /// Read the next line without its terminator
    ///
    /// Returns `None` once the other side has closed the channel. Bytes that
    /// are not valid UTF-8 are replaced rather than failing the read.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.buf.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(TransportError::Read)?;
        if n == 0 {
            debug!("TransportReader::read_line: end of stream");
            return Ok(None);
        }

        let mut line = self.buf.as_slice();
        if let Some(stripped) = line.strip_suffix(b"\n") {
            line = stripped;
        }
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        let line = String::from_utf8_lossy(line).into_owned();
        trace!(%line, "TransportReader::read_line: received");
        Ok(Some(line))
    }
}

/// Write half: sends whole lines with a bounded write time
pub struct TransportWriter {
    inner: BoxedWrite,
    write_timeout: Duration,
    closed: bool,
}

impl TransportWriter {
    pub fn new<W>(writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(writer),
            write_timeout,
            closed: false,
        }
    }

    /// Send `line` followed by a newline and flush it
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        let limit = self.write_timeout;
        let inner = &mut self.inner;
        let write = async {
            inner.write_all(framed.as_bytes()).await?;
            inner.flush().await
        };

        match tokio::time::timeout(limit, write).await {
            Ok(Ok(())) => {
                trace!(%line, "TransportWriter::write_line: sent");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Write(e)),
            Err(_) => Err(TransportError::WriteTimeout(limit)),
        }
    }

    /// Shut the write direction down; later writes fail with `Closed`
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("TransportWriter::close: shutting down");
        self.inner.shutdown().await.map_err(TransportError::Write)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Split any duplex byte stream into a transport pair
pub fn split<S>(stream: S, write_timeout: Duration) -> (TransportReader, TransportWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (TransportReader::new(read), TransportWriter::new(write, write_timeout))
}

/// Open the port described by `config`
pub async fn open(config: &PortConfig) -> Result<(TransportReader, TransportWriter), TransportError> {
    let target = PortTarget::parse(&config.target);
    let write_timeout = config.write_timeout();
    debug!(%target, baud_rate = config.baud_rate, ?write_timeout, "transport::open: called");

    match &target {
        PortTarget::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await.map_err(|source| TransportError::Open {
                target: target.to_string(),
                source,
            })?;
            stream.set_nodelay(true).map_err(|source| TransportError::Open {
                target: target.to_string(),
                source,
            })?;
            let (read, write) = stream.into_split();
            info!(%target, "Connected to table");
            Ok((TransportReader::new(read), TransportWriter::new(write, write_timeout)))
        }
        PortTarget::Device(path) => {
            let (read, write) = serial::open(path, config.baud_rate)?;
            info!(%target, baud_rate = config.baud_rate, "Opened serial port");
            Ok((TransportReader::new(read), TransportWriter::new(write, write_timeout)))
        }
    }
}
