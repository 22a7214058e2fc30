//! Persistent connection to the signal-cli daemon.
//!
//! A [`Connection`] is split into a [`FrameReader`] (owned by the receive
//! loop) and a [`FrameWriter`] (shared by callers). Both speak
//! newline-delimited JSON, see [`framing`].

pub mod framing;
pub mod oneshot;

use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use framing::{encode_frame, FramingError, LineFramer, DEFAULT_MAX_FRAME_LEN};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unix sockets are not supported on this platform")]
    Unsupported,

    #[error("Connection closed by daemon")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl Endpoint {
    /// Lightweight health check: does anything accept connections here?
    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, Connection::connect(self)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Reachability check of {} failed: {}", self, e);
                false
            }
            Err(_) => false,
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One inbound item produced by the receive loop.
#[derive(Debug)]
pub enum Inbound {
    Frame(Value),
    /// Discarded frame; the connection stays usable
    Malformed(FramingError),
}

pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let connect_err = |source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(connect_err)?;
                let _ = stream.set_nodelay(true);
                Ok(Self::from_stream(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(connect_err)?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported),
        }
    }

    /// Wrap any duplex byte stream (sockets, or in-memory pipes in tests).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(Box::new(read)),
            writer: FrameWriter::new(Box::new(write)),
        }
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read half: turns raw reads into frames.
pub struct FrameReader {
    inner: BoxedReader,
    framer: LineFramer,
    chunk: Vec<u8>,
}

impl FrameReader {
    pub fn new(inner: BoxedReader) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: BoxedReader, max_frame_len: usize) -> Self {
        Self {
            inner,
            framer: LineFramer::new(max_frame_len),
            chunk: vec![0u8; 8192],
        }
    }

    /// Next frame from the stream. Returns `Err(Closed)` on EOF.
    pub async fn next(&mut self) -> Result<Inbound, TransportError> {
        loop {
            if let Some(item) = self.framer.next_frame() {
                return Ok(match item {
                    Ok(value) => Inbound::Frame(value),
                    Err(e) => Inbound::Malformed(e),
                });
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.framer.pending_len() > 0 {
                    tracing::debug!(
                        "Dropping {} unterminated bytes at end of stream",
                        self.framer.pending_len()
                    );
                }
                return Err(TransportError::Closed);
            }
            self.framer.push(&self.chunk[..n]);
        }
    }
}

/// Write half.
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(inner: BoxedWriter) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, value: &Value) -> Result<(), TransportError> {
        let bytes = encode_frame(value)?;
        self.send_raw(&bytes).await
    }

    /// Write pre-framed bytes (must already end with `\n`).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_survive_chunked_writes() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, _writer) = Connection::from_stream(client).into_split();

        let payload = b"{\"id\":1,\"result\":\"pong\"}\n{\"method\":\"receive\",\"params\":{}}\n";
        tokio::spawn(async move {
            for chunk in payload.chunks(5) {
                server.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        match reader.next().await.unwrap() {
            Inbound::Frame(v) => assert_eq!(v, json!({"id": 1, "result": "pong"})),
            other => panic!("unexpected {:?}", other),
        }
        match reader.next().await.unwrap() {
            Inbound::Frame(v) => assert_eq!(v["method"], "receive"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(reader.next().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_not_fatal() {
        let (client, mut server) = tokio::io::duplex(256);
        let (mut reader, _writer) = Connection::from_stream(client).into_split();
        server.write_all(b"garbage\n{\"ok\":1}\n").await.unwrap();

        assert!(matches!(reader.next().await.unwrap(), Inbound::Malformed(_)));
        assert!(matches!(reader.next().await.unwrap(), Inbound::Frame(_)));
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_frame() {
        let (client, server) = tokio::io::duplex(256);
        let (_reader, mut writer) = Connection::from_stream(client).into_split();
        let (mut peer_reader, _peer_writer) = Connection::from_stream(server).into_split();

        writer.send(&json!({"id": 7, "method": "send", "params": {"message": "hi\nthere"}})).await.unwrap();
        match peer_reader.next().await.unwrap() {
            Inbound::Frame(v) => assert_eq!(v["params"]["message"], "hi\nthere"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_fails_without_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Tcp { host: "127.0.0.1".into(), port };
        assert!(matches!(
            Connection::connect(&endpoint).await,
            Err(TransportError::Connect { .. })
        ));
        assert!(!endpoint.is_reachable(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn reachable_with_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::Tcp { host: "127.0.0.1".into(), port };
        assert!(endpoint.is_reachable(Duration::from_millis(500)).await);
    }

    #[test]
    fn endpoint_display() {
        let tcp = Endpoint::Tcp { host: "127.0.0.1".into(), port: 7583 };
        assert_eq!(tcp.to_string(), "127.0.0.1:7583");
        let unix = Endpoint::Unix(PathBuf::from("/tmp/signal.sock"));
        assert_eq!(unix.to_string(), "unix:/tmp/signal.sock");
    }
}
