//! Transports carrying programs to the host and replies back.
//!
//! The host software is reached through a stream bridge: the request is the
//! program text, the reply is a run of text lines terminated by an empty line.
//! [`StreamTransport`] implements that framing over any async byte stream
//! (TCP in production, `tokio::io::duplex` in tests). [`super::MockHost`]
//! implements the trait directly against the simulated instrument.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::ConnectError;

/// Default window spent discarding stale bytes before a request.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Failure of the underlying link.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the stream.
    #[error("host closed the connection")]
    Closed,

    /// Reading or writing the stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async byte stream usable as a host link.
pub trait HostIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HostIo for T {}

/// One request/response link to the host.
///
/// Implementations are driven by a single caller at a time; the
/// [`super::ProtocolClient`] serializes access.
#[async_trait]
pub trait HostTransport: Send {
    /// Send one program and return the raw reply text.
    ///
    /// May be cancelled (timeout); the caller then calls [`Self::resync`]
    /// before the next exchange.
    async fn exchange(&mut self, program: &str) -> Result<String, TransportError>;

    /// Read the next reply without sending anything. Used to skip a late
    /// reply to an earlier, timed-out request that arrived ahead of the
    /// current one.
    async fn next_reply(&mut self) -> Result<String, TransportError>;

    /// Discard any late reply still in flight. Returns the number of bytes
    /// dropped.
    async fn resync(&mut self) -> Result<usize, TransportError>;

    /// Shut the link down.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

/// Line-framed transport over an async byte stream.
pub struct StreamTransport<S: HostIo> {
    stream: BufReader<S>,
    peer: String,
    drain_window: Duration,
}

impl<S: HostIo> StreamTransport<S> {
    /// Transport over `stream`, labelled `peer` in logs.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer: peer.into(),
            drain_window: DEFAULT_DRAIN_WINDOW,
        }
    }

    /// Override the resync drain window.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }
}

#[async_trait]
impl<S: HostIo> HostTransport for StreamTransport<S> {
    async fn exchange(&mut self, program: &str) -> Result<String, TransportError> {
        self.stream.write_all(program.as_bytes()).await?;
        self.stream.flush().await?;
        self.next_reply().await
    }

    async fn next_reply(&mut self) -> Result<String, TransportError> {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(TransportError::Closed);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                return Ok(reply);
            }
            reply.push_str(line);
            reply.push('\n');
        }
    }

    async fn resync(&mut self) -> Result<usize, TransportError> {
        let deadline = tokio::time::Instant::now() + self.drain_window;
        let mut discarded = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let available = match tokio::time::timeout(remaining, self.stream.fill_buf()).await {
                Ok(Ok(buf)) => buf.len(),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            };
            if available == 0 {
                return Err(TransportError::Closed);
            }
            self.stream.consume(available);
            discarded += available;
        }

        Ok(discarded)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// Open a TCP link to the host bridge.
pub async fn connect_tcp(
    address: &str,
    timeout: Duration,
) -> Result<StreamTransport<TcpStream>, ConnectError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Err(_) => Err(ConnectError::Timeout(timeout)),
        Ok(Err(e)) => Err(ConnectError::HostUnavailable(format!("{address}: {e}"))),
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(StreamTransport::new(stream, format!("tcp://{address}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn exchange_reads_until_blank_line() {
        let (client, mut host) = tokio::io::duplex(256);
        let mut transport = StreamTransport::new(client, "duplex");

        let host_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"begin\r\n  writeln(a);\r\nend.\r\n");
            host.write_all(b"writeln(a)\r\n0,5\r\n\r\n").await.unwrap();
            host
        });

        let reply = transport
            .exchange("begin\r\n  writeln(a);\r\nend.\r\n")
            .await
            .unwrap();
        assert_eq!(reply, "writeln(a)\n0,5\n");
        drop(host_task.await.unwrap());
    }

    #[tokio::test]
    async fn exchange_reports_closed_peer() {
        let (client, host) = tokio::io::duplex(64);
        drop(host);
        let mut transport = StreamTransport::new(client, "duplex");

        let result = transport.exchange("begin\r\nend.\r\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn resync_discards_pending_bytes() {
        let (client, mut host) = tokio::io::duplex(256);
        let mut transport =
            StreamTransport::new(client, "duplex").with_drain_window(Duration::from_millis(20));

        host.write_all(b"stale\r\n1,0\r\n\r\n").await.unwrap();
        let discarded = transport.resync().await.unwrap();

        assert_eq!(discarded, 14);
        assert_eq!(transport.resync().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_host_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect_tcp(&address, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectError::HostUnavailable(_))));
    }
}
