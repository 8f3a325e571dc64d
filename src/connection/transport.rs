//! One byte stream to a Redis node.
//!
//! Wraps a `tokio::net::TcpStream` (optionally inside a rustls session)
//! with a receive buffer and a resumable RESP [`Decoder`]. A `Transport`
//! has no ordering logic of its own; [`Connection`](super::Connection)
//! decides who may write and read it.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{ClientConfig, NodeDescriptor};
use crate::error::{Result, RsedisError};
use crate::resp::command::Command;
use crate::resp::parser::{Decoder, DEFAULT_MAX_BULK_LEN};
use crate::resp::types::Reply;
use crate::resp::writer::encode_command;

/// Default initial read buffer capacity (64 KB).
const DEFAULT_BUF_CAPACITY: usize = 64 * 1024;

/// Minimum free space before reading from the socket.
const MIN_READ_SPACE: usize = 4096;

/// Anything we can speak RESP over.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Per-stream settings taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub tls: bool,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub max_buffer_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl TransportOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            tls: config.tls,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_buffer_size: config.max_buffer_size,
        }
    }
}

/// An open, authenticated stream to one node.
pub struct Transport {
    stream: Box<dyn AsyncStream>,
    /// Data read from the socket but not yet consumed by the decoder.
    buf: BytesMut,
    decoder: Decoder,
    max_buf_size: usize,
    read_timeout: Option<Duration>,
    addr: String,
}

impl Transport {
    /// Open a stream to `node` and run the AUTH / SELECT handshake.
    pub async fn connect(node: &NodeDescriptor, opts: &TransportOptions) -> Result<Self> {
        let addr = node.addr();
        let tcp = match opts.connect_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, TcpStream::connect((node.host.as_str(), node.port)))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(RsedisError::Timeout(format!(
                            "connection to {addr} timed out after {timeout:?}"
                        )))
                    }
                }
            }
            None => TcpStream::connect((node.host.as_str(), node.port)).await?,
        };
        tcp.set_nodelay(true).ok(); // Disable Nagle for low latency

        let stream: Box<dyn AsyncStream> = if opts.tls {
            wrap_tls(tcp, &node.host).await?
        } else {
            Box::new(tcp)
        };

        let mut transport = Self {
            stream,
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            decoder: Decoder::with_max_bulk_len(opts.max_buffer_size.min(DEFAULT_MAX_BULK_LEN)),
            max_buf_size: opts.max_buffer_size,
            read_timeout: opts.read_timeout,
            addr,
        };
        transport.init(node).await?;
        debug!(addr = %transport.addr, db = node.db, "connected");
        Ok(transport)
    }

    /// `host:port` this stream is connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send raw bytes to the server.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read and decode one complete reply.
    ///
    /// Bytes of a reply that arrive across several reads are consumed as
    /// they are recognised; the decoder resumes where it stopped.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        loop {
            if let Some(reply) = self.decoder.decode(&mut self.buf)? {
                return Ok(reply);
            }

            // A bulk body was already checked against the limit when its
            // header was read; it may need its trailing CRLF on top.
            let limit = match self.decoder.pending_bulk_len() {
                Some(len) => len + 2,
                None => self.max_buf_size,
            };
            if self.buf.len() >= limit {
                return Err(RsedisError::Protocol(format!(
                    "RESP message too large: buffer would exceed {} bytes",
                    self.max_buf_size
                )));
            }
            if self.buf.capacity() - self.buf.len() < MIN_READ_SPACE {
                self.buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            let n = match self.read_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buf)).await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(RsedisError::Timeout(format!(
                                "no reply from {} within {timeout:?}",
                                self.addr
                            )))
                        }
                    }
                }
                None => self.stream.read_buf(&mut self.buf).await?,
            };
            if n == 0 {
                return Err(RsedisError::ConnectionLost(format!(
                    "{} closed the connection",
                    self.addr
                )));
            }
        }
    }

    /// Send one command and read its reply. Only for use outside the
    /// connection's pipelined path (handshake, health checks).
    pub async fn round_trip(&mut self, cmd: &Command) -> Result<Reply> {
        self.send_raw(&encode_command(cmd)).await?;
        self.read_reply().await
    }

    /// Perform AUTH if credentials are available, then SELECT a non-zero db.
    async fn init(&mut self, node: &NodeDescriptor) -> Result<()> {
        if let Some(password) = node.password.as_deref() {
            let mut auth = Command::new("AUTH");
            if let Some(user) = node.username.as_deref() {
                auth = auth.arg(user);
            }
            let reply = self.round_trip(&auth.arg(password)).await?;
            expect_ok(reply, "AUTH")?;
            debug!(addr = %self.addr, "authenticated");
        }
        if node.db != 0 {
            let reply = self.round_trip(&Command::new("SELECT").arg(node.db)).await?;
            expect_ok(reply, "SELECT")?;
        }
        Ok(())
    }

    /// Send PING and verify response.
    pub async fn ping(&mut self) -> Result<bool> {
        let reply = self.round_trip(&Command::new("PING")).await?;
        Ok(matches!(reply, Reply::Status(ref s) if s == "PONG"))
    }
}

fn expect_ok(reply: Reply, what: &str) -> Result<()> {
    match reply {
        Reply::Status(ref s) if s == "OK" => Ok(()),
        Reply::Error(msg) => Err(RsedisError::redis(msg)),
        other => Err(RsedisError::Protocol(format!(
            "unexpected {what} response: {}",
            other.type_name()
        ))),
    }
}

#[cfg(feature = "tls")]
async fn wrap_tls(tcp: TcpStream, host: &str) -> Result<Box<dyn AsyncStream>> {
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use std::sync::Arc;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| RsedisError::Config(format!("invalid TLS server name {host}: {e}")))?;
    let stream = connector.connect(name, tcp).await?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(_tcp: TcpStream, _host: &str) -> Result<Box<dyn AsyncStream>> {
    Err(RsedisError::Config(
        "TLS connections (rediss://) need the `tls` feature. \
         Use redis:// or set tls=false."
            .into(),
    ))
}

// ── Tests ──────────────────────────────────────────────────────────
