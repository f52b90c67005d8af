//! Protocol client for the SXM host control software.
//!
//! Exactly one request is outstanding per session. Callers share the client
//! behind an `Arc` and contend for a FIFO `tokio::sync::Mutex` around the
//! transport, so a second caller queues behind the in-flight request instead
//! of failing.
//!
//! Timeouts are surfaced, never retried. Because the host may still answer a
//! timed-out request, the transport is resynchronized (late bytes discarded)
//! before the next request goes out. A late reply that arrives after the
//! resync is recognized by its echo line, which names a different program,
//! and skipped. Each accepted reply answers the request that is in flight.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::codec::{HostCommand, HostReply};
use super::mock::MockHost;
use super::transport::{connect_tcp, HostTransport, TransportError};
use crate::clock::{ProtocolClock, ProtocolTime};
use crate::error::{CommandError, ConnectError};
use crate::parameter::{ParameterHandle, ParameterRegistry};

/// Default bound on the connection handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default bound on one request/response cycle.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the host control software is reached.
pub enum HostEndpoint {
    /// TCP stream bridge, `host:port`.
    Tcp(String),
    /// In-process simulated host.
    Mock(MockHost),
}

impl std::fmt::Debug for HostEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostEndpoint::Tcp(address) => write!(f, "Tcp({address})"),
            HostEndpoint::Mock(_) => write!(f, "Mock"),
        }
    }
}

/// Timeouts applied by [`ProtocolClient`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Bound on the handshake.
    pub handshake_timeout: Duration,
    /// Bound on each request.
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Acknowledgement of a parameter write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    /// Parameter name.
    pub parameter: String,
    /// Value the host acknowledged.
    pub value: f64,
    /// When the request was handed to the transport.
    pub issued_at: ProtocolTime,
    /// When the host's response arrived.
    pub acknowledged_at: ProtocolTime,
}

struct TransportSlot {
    transport: Box<dyn HostTransport>,
    /// Set while an exchange is outstanding; still set if it was cancelled.
    needs_resync: bool,
}

struct Exchange {
    reply: HostReply,
    issued_at: ProtocolTime,
    acknowledged_at: ProtocolTime,
}

/// Command/response client for the host control software.
///
/// Requests are serialized: at most one program is outstanding on the
/// transport. Cancelling a request (dropping its future) leaves the link
/// marked for resync.
pub struct ProtocolClient {
    slot: Mutex<TransportSlot>,
    registry: Arc<ParameterRegistry>,
    clock: ProtocolClock,
    request_timeout: Duration,
    last_round_trip: parking_lot::Mutex<Option<Duration>>,
    closed: AtomicBool,
    peer: String,
}

impl ProtocolClient {
    /// Establish a session with the host.
    ///
    /// Fails with `HostUnavailable` if the host cannot be reached and with
    /// `Timeout` if the handshake is not answered in time.
    pub async fn connect(
        endpoint: HostEndpoint,
        options: ConnectOptions,
        registry: Arc<ParameterRegistry>,
        clock: ProtocolClock,
    ) -> Result<Self, ConnectError> {
        let transport: Box<dyn HostTransport> = match endpoint {
            HostEndpoint::Tcp(address) => {
                Box::new(connect_tcp(&address, options.handshake_timeout).await?)
            }
            HostEndpoint::Mock(host) => Box::new(host),
        };
        Self::with_transport(transport, options, registry, clock).await
    }

    /// Establish a session over an already opened transport.
    pub async fn with_transport(
        mut transport: Box<dyn HostTransport>,
        options: ConnectOptions,
        registry: Arc<ParameterRegistry>,
        clock: ProtocolClock,
    ) -> Result<Self, ConnectError> {
        let peer = transport.describe();
        let program = HostCommand::Handshake
            .encode()
            .map_err(|e| ConnectError::HostUnavailable(e.to_string()))?;

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(options.handshake_timeout, transport.exchange(&program)).await
        {
            Err(_) => {
                warn!(peer = %peer, timeout = ?options.handshake_timeout, "Host handshake timed out");
                return Err(ConnectError::Timeout(options.handshake_timeout));
            }
            Ok(Err(e)) => return Err(ConnectError::HostUnavailable(format!("{peer}: {e}"))),
            Ok(Ok(reply)) => {
                debug!(peer = %peer, reply = %reply.trim_end(), "Host handshake answered");
            }
        }
        // The first round trip bounds step holds before any request completes.
        let handshake_round_trip = started.elapsed();

        info!(peer = %peer, "Connected to host control software");
        Ok(Self {
            slot: Mutex::new(TransportSlot {
                transport,
                needs_resync: false,
            }),
            registry,
            clock,
            request_timeout: options.request_timeout,
            last_round_trip: parking_lot::Mutex::new(Some(handshake_round_trip)),
            closed: AtomicBool::new(false),
            peer,
        })
    }

    /// Write a named parameter and wait for the host's acknowledgement.
    #[instrument(skip(self), err)]
    pub async fn set_parameter(&self, name: &str, value: f64) -> Result<Ack, CommandError> {
        let handle = self.handle(name)?;
        let exchange = self
            .round_trip(&HostCommand::Set {
                address: handle.address().clone(),
                value,
            })
            .await?;

        handle.record(value);
        debug!(parameter = %name, value, "Parameter acknowledged");
        Ok(Ack {
            parameter: name.to_string(),
            value,
            issued_at: exchange.issued_at,
            acknowledged_at: exchange.acknowledged_at,
        })
    }

    /// Read a named parameter from the host.
    ///
    /// Write-only (DNC) parameters answer from the session cache and are
    /// `Rejected` until written once.
    #[instrument(skip(self), err)]
    pub async fn get_parameter(&self, name: &str) -> Result<f64, CommandError> {
        let handle = self.handle(name)?;
        if !handle.address().is_readable() {
            return handle.last_known().ok_or_else(|| {
                CommandError::Rejected(format!(
                    "parameter '{name}' is write-only and has not been set in this session"
                ))
            });
        }

        let exchange = self
            .round_trip(&HostCommand::Get {
                address: handle.address().clone(),
            })
            .await?;
        let value = reply_value(&exchange.reply)?;
        handle.record(value);
        Ok(value)
    }

    /// Read one channel through the host software (`GetChannel`).
    #[instrument(skip(self), err)]
    pub async fn read_channel(&self, index: i32) -> Result<f64, CommandError> {
        let exchange = self.round_trip(&HostCommand::GetChannel(index)).await?;
        reply_value(&exchange.reply)
    }

    /// Send caller text verbatim inside a program; returns the reply text
    /// after the echo line.
    #[instrument(skip(self), err)]
    pub async fn send_raw_command(&self, text: &str) -> Result<String, CommandError> {
        let exchange = self.round_trip(&HostCommand::Raw(text.to_string())).await?;
        Ok(exchange.reply.text())
    }

    /// Latency of the most recent completed request/response cycle.
    pub fn last_round_trip(&self) -> Option<Duration> {
        *self.last_round_trip.lock()
    }

    /// Bound applied to each request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Parameter registry shared with the session.
    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    /// Clock stamping issue and acknowledgement times.
    pub fn clock(&self) -> ProtocolClock {
        self.clock
    }

    /// Whether [`Self::close`] has run or the link was lost.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session. Waits for the in-flight request, if any. Idempotent.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = slot.transport.close().await {
            debug!(peer = %self.peer, error = %e, "Error while closing host transport");
        }
        info!(peer = %self.peer, "Disconnected from host control software");
    }

    fn handle(&self, name: &str) -> Result<ParameterHandle, CommandError> {
        self.registry
            .handle(name)
            .ok_or_else(|| CommandError::Rejected(format!("unknown parameter '{name}'")))
    }

    async fn round_trip(&self, command: &HostCommand) -> Result<Exchange, CommandError> {
        let program = command.encode()?;
        let echo = command.echo()?;

        let mut slot = self.slot.lock().await;
        if self.is_closed() {
            return Err(CommandError::ConnectionLost(format!(
                "session to {} is closed",
                self.peer
            )));
        }

        if slot.needs_resync {
            match tokio::time::timeout(self.request_timeout, slot.transport.resync()).await {
                Ok(Ok(discarded)) => {
                    if discarded > 0 {
                        debug!(peer = %self.peer, discarded, "Discarded late host reply");
                    }
                    slot.needs_resync = false;
                }
                Ok(Err(e)) => return Err(self.connection_lost(e.to_string())),
                Err(_) => return Err(CommandError::Timeout(self.request_timeout)),
            }
        }

        slot.needs_resync = true;
        let issued_at = self.clock.now();
        let started = tokio::time::Instant::now();

        let transport = &mut slot.transport;
        let answered = tokio::time::timeout(self.request_timeout, async {
            let mut reply = HostReply::parse(&transport.exchange(&program).await?);
            while !reply.echoes(&echo) {
                debug!(
                    peer = %self.peer,
                    expected = %echo,
                    stale = ?reply.lines().first(),
                    "Skipped reply to an earlier request"
                );
                reply = HostReply::parse(&transport.next_reply().await?);
            }
            Ok::<_, TransportError>(reply)
        })
        .await;

        let reply = match answered {
            Err(_) => {
                warn!(peer = %self.peer, timeout = ?self.request_timeout, "Host request timed out");
                return Err(CommandError::Timeout(self.request_timeout));
            }
            Ok(Err(e)) => return Err(self.connection_lost(e.to_string())),
            Ok(Ok(reply)) => reply,
        };

        slot.needs_resync = false;
        let acknowledged_at = self.clock.now();
        *self.last_round_trip.lock() = Some(started.elapsed());
        drop(slot);

        if let Some(reason) = reply.rejection() {
            return Err(CommandError::Rejected(reason.to_string()));
        }

        Ok(Exchange {
            reply,
            issued_at,
            acknowledged_at,
        })
    }

    fn connection_lost(&self, reason: String) -> CommandError {
        self.closed.store(true, Ordering::Release);
        warn!(peer = %self.peer, reason = %reason, "Connection to host lost");
        CommandError::ConnectionLost(reason)
    }
}

fn reply_value(reply: &HostReply) -> Result<f64, CommandError> {
    reply.value().ok_or_else(|| {
        CommandError::Rejected(format!(
            "host reply carried no numeric value: {:?}",
            reply.lines()
        ))
    })
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("peer", &self.peer)
            .field("request_timeout", &self.request_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockFault;
    use crate::simulation::MockInstrument;

    async fn mock_client() -> (ProtocolClient, crate::protocol::MockHostHandle) {
        let host = MockHost::new(MockInstrument::new());
        let handle = host.handle();
        let client = ProtocolClient::connect(
            HostEndpoint::Mock(host),
            ConnectOptions::default(),
            Arc::new(ParameterRegistry::with_defaults()),
            ProtocolClock::new(),
        )
        .await
        .unwrap();
        (client, handle)
    }

    #[tokio::test]
    async fn set_updates_cache_and_acknowledges_in_order() {
        let (client, _host) = mock_client().await;

        let ack = client.set_parameter("amp_ki", 0.2).await.unwrap();

        assert!(ack.acknowledged_at >= ack.issued_at);
        assert_eq!(
            client.registry().handle("amp_ki").unwrap().last_known(),
            Some(0.2)
        );
        assert!(client.last_round_trip().is_some());
    }

    #[tokio::test]
    async fn unknown_parameter_never_reaches_host() {
        let (client, host) = mock_client().await;
        let sent_before = host.programs().len();

        let err = client.set_parameter("z_gain", 1.0).await.unwrap_err();

        assert!(matches!(err, CommandError::Rejected(_)));
        assert_eq!(host.programs().len(), sent_before);
    }

    #[tokio::test]
    async fn dnc_read_uses_session_cache() {
        let (client, _host) = mock_client().await;

        assert!(matches!(
            client.get_parameter("drive").await,
            Err(CommandError::Rejected(_))
        ));
        client.set_parameter("drive", 0.75).await.unwrap();
        assert_eq!(client.get_parameter("drive").await.unwrap(), 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_next_request_succeeds() {
        let (client, host) = mock_client().await;
        host.inject(MockFault::NoReply);

        let err = client.get_parameter("amp_ref").await.unwrap_err();
        assert_eq!(err, CommandError::Timeout(DEFAULT_REQUEST_TIMEOUT));
        assert!(!client.is_closed());

        assert_eq!(client.get_parameter("amp_ref").await.unwrap(), 0.08);
    }

    #[tokio::test]
    async fn disconnect_marks_session_closed() {
        let (client, host) = mock_client().await;
        host.inject(MockFault::Disconnect);

        let err = client.get_parameter("amp_ref").await.unwrap_err();
        assert!(matches!(err, CommandError::ConnectionLost(_)));
        assert!(client.is_closed());

        let again = client.get_parameter("amp_ref").await.unwrap_err();
        assert!(matches!(again, CommandError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, host) = mock_client().await;
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert!(host.is_disconnected());
    }
}
