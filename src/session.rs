//! Acquisition session coordinator.
//!
//! [`AcquisitionSession`] is the single facade the GUI talks to. It owns the
//! connections to the host software and to the acquisition driver, arbitrates
//! access to the instrument, and fans samples and step events out to any
//! number of subscribers.
//!
//! # Single-writer discipline
//!
//! Parameter traffic goes through an `RwLock<()>` used as a lease:
//!
//! - GUI requests (`set_parameter`, `get_parameter`, raw commands) take a read
//!   lease with `try_read`, so they run concurrently with each other (the
//!   protocol client still serializes them on the wire).
//! - A step test takes the write lease with `try_write` and holds it until the
//!   run ends.
//!
//! Neither side ever waits for the other: a GUI request during a step test,
//! or a step test started while a GUI request is in flight, fails with `Busy`
//! before anything is sent to the instrument.
//!
//! # Example
//!
//! ```
//! use ncafm_core::{AcquisitionSession, CoreConfig};
//!
//! # tokio_test::block_on(async {
//! // Default configuration: simulated host and scope.
//! let session = AcquisitionSession::open(CoreConfig::default()).await.unwrap();
//! session.set_parameter("amp_ki", 0.12).await.unwrap();
//! assert_eq!(session.get_parameter("amp_ki").await.unwrap(), 0.12);
//! session.disconnect().await.unwrap();
//! # })
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Connected(Idle) ◄──► Connected(Streaming)
//!       ▲                                          │                      │
//!       └──────────────────── disconnect() ────────┴──────────────────────┘
//! ```

use futures::{Stream, StreamExt};
use parking_lot::RwLock as SyncRwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::clock::{AcquisitionClock, ClockCalibration, ProtocolClock};
use crate::config::{CoreConfig, DriverEndpointKind, HostEndpointKind};
use crate::driver::{
    ChannelId, ChannelInfo, ChannelSample, DriverChannelReader, DriverEndpoint, MockScopeDevice,
    SampleStream, CHANNEL_TABLE,
};
use crate::error::{CoreError, CoreResult, DriverError, SequencerError, StreamError};
use crate::parameter::{ParameterRegistry, ParameterSnapshot};
use crate::protocol::{Ack, HostEndpoint, MockHost, MockHostHandle, ProtocolClient};
use crate::sequencer::{SequencerState, StepEvent, StepSequencer, StepTestHandle, StepTestPlan};
use crate::simulation::MockInstrument;

/// What a connected session is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Activity {
    /// No scope running.
    Idle,
    /// The scope is running.
    Streaming,
}

/// Lifecycle state of an [`AcquisitionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake done; the activity tells whether the scope runs.
    Connected(Activity),
}

impl SessionState {
    /// Whether the session has a live connection.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected(Activity::Idle) => write!(f, "connected (idle)"),
            SessionState::Connected(Activity::Streaming) => write!(f, "connected (streaming)"),
        }
    }
}

/// Item of the scope subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeEvent {
    /// One raw reading.
    Sample(ChannelSample),
    /// The scope was stopped or restarted.
    Stopped,
    /// The driver failed mid-acquisition; the scope must be restarted.
    Terminated(StreamError),
}

struct ScopePump {
    task: JoinHandle<()>,
}

struct Connection {
    client: Arc<ProtocolClient>,
    reader: Option<DriverChannelReader>,
    sequencer: StepSequencer,
    scope: Option<ScopePump>,
}

/// Consumer-facing facade over one instrument.
///
/// Owns the protocol client, the driver reader and the step sequencer of the
/// current connection. Cheap to share behind an `Arc`.
pub struct AcquisitionSession {
    config: CoreConfig,
    registry: Arc<ParameterRegistry>,
    state: Arc<watch::Sender<SessionState>>,
    connection: Mutex<Option<Connection>>,
    lease: Arc<RwLock<()>>,
    samples_tx: broadcast::Sender<ScopeEvent>,
    step_events_tx: broadcast::Sender<StepEvent>,
    calibration: SyncRwLock<Option<ClockCalibration>>,
    protocol_clock: ProtocolClock,
    acquisition_clock: AcquisitionClock,
    mock_host: SyncRwLock<Option<MockHostHandle>>,
}

impl AcquisitionSession {
    /// Session in the `Disconnected` state.
    pub fn new(config: CoreConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (samples_tx, _) = broadcast::channel(config.session.sample_buffer.max(1));
        let (step_events_tx, _) = broadcast::channel(config.session.event_buffer.max(1));

        Self {
            registry: Arc::new(config.parameter_registry()),
            config,
            state: Arc::new(state),
            connection: Mutex::new(None),
            lease: Arc::new(RwLock::new(())),
            samples_tx,
            step_events_tx,
            calibration: SyncRwLock::new(None),
            protocol_clock: ProtocolClock::new(),
            acquisition_clock: AcquisitionClock::new(),
            mock_host: SyncRwLock::new(None),
        }
    }

    /// Create a session and connect it.
    pub async fn open(config: CoreConfig) -> CoreResult<Self> {
        let session = Self::new(config);
        session.connect().await?;
        Ok(session)
    }

    /// Configuration the session was built from.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open both channels. Idempotent while connected.
    pub async fn connect(&self) -> CoreResult<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }
        self.state.send_replace(SessionState::Connecting);

        match self.open_connection().await {
            Ok(opened) => {
                *connection = Some(opened);
                let calibration = self.calibrate_clocks();
                self.state
                    .send_replace(SessionState::Connected(Activity::Idle));
                info!(
                    host = ?self.config.host.endpoint,
                    driver = ?self.config.driver.endpoint,
                    clock_offset_ns = calibration.offset_ns(),
                    "Session connected"
                );
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(SessionState::Disconnected);
                warn!(error = %e, "Session connect failed");
                Err(e)
            }
        }
    }

    async fn open_connection(&self) -> CoreResult<Connection> {
        // Both simulated channels observe the same instrument.
        let instrument = MockInstrument::new();

        let endpoint = match self.config.host.endpoint {
            HostEndpointKind::Mock => {
                let host =
                    MockHost::new(instrument.clone()).with_latency(self.config.host.mock_latency);
                *self.mock_host.write() = Some(host.handle());
                HostEndpoint::Mock(host)
            }
            HostEndpointKind::Tcp => HostEndpoint::Tcp(self.config.host.address.clone()),
        };
        let client = Arc::new(
            ProtocolClient::connect(
                endpoint,
                self.config.connect_options(),
                self.registry.clone(),
                self.protocol_clock,
            )
            .await?,
        );

        let driver_endpoint = match self.config.driver.endpoint {
            DriverEndpointKind::Mock => {
                DriverEndpoint::Mock(MockScopeDevice::new(instrument, &self.config.driver.mock))
            }
            DriverEndpointKind::Device => {
                DriverEndpoint::Device(self.config.driver.device_path.clone())
            }
        };
        let reader = match DriverChannelReader::open(
            driver_endpoint,
            self.config.reader_options(),
            self.acquisition_clock,
        ) {
            Ok(reader) => Some(reader),
            Err(e) if self.config.driver.optional => {
                warn!(error = %e, "Acquisition driver unavailable, continuing without scope");
                None
            }
            Err(e) => {
                client.close().await;
                return Err(e.into());
            }
        };

        Ok(Connection {
            sequencer: StepSequencer::new(client.clone(), self.step_events_tx.clone()),
            client,
            reader,
            scope: None,
        })
    }

    /// Stop the scope, abort any step test, then close both channels.
    /// Idempotent.
    pub async fn disconnect(&self) -> CoreResult<()> {
        let mut connection = self.connection.lock().await;
        let Some(mut conn) = connection.take() else {
            return Ok(());
        };

        self.stop_scope_locked(&mut conn).await;

        if conn.sequencer.abort() {
            info!("Aborting step test for disconnect");
        }
        if !conn
            .sequencer
            .wait_finished(self.config.session.stop_timeout)
            .await
        {
            warn!("Step test did not finish before disconnect");
        }

        if let Some(mut reader) = conn.reader.take() {
            reader.close().await;
        }
        conn.client.close().await;
        *self.mock_host.write() = None;

        self.state.send_replace(SessionState::Disconnected);
        info!("Session disconnected");
        Ok(())
    }

    /// Stop the scope and abort any step test; stay connected.
    pub async fn stop(&self) -> CoreResult<()> {
        let mut connection = self.connection.lock().await;
        let Some(conn) = connection.as_mut() else {
            return Ok(());
        };

        conn.sequencer.abort();
        self.stop_scope_locked(conn).await;
        if !conn
            .sequencer
            .wait_finished(self.config.session.stop_timeout)
            .await
        {
            warn!("Step test did not finish after abort");
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Read-only view of the session state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Write `name` and wait for the acknowledgement.
    pub async fn set_parameter(&self, name: &str, value: f64) -> CoreResult<Ack> {
        let _lease = self.request_lease()?;
        let client = self.client().await?;
        Ok(client.set_parameter(name, value).await?)
    }

    /// Read `name` from the host.
    pub async fn get_parameter(&self, name: &str) -> CoreResult<f64> {
        let _lease = self.request_lease()?;
        let client = self.client().await?;
        Ok(client.get_parameter(name).await?)
    }

    /// Send caller text as a program and return the raw reply.
    pub async fn send_raw_command(&self, text: &str) -> CoreResult<String> {
        let _lease = self.request_lease()?;
        let client = self.client().await?;
        Ok(client.send_raw_command(text).await?)
    }

    /// Read a channel through the host software (slow path).
    pub async fn read_channel(&self, index: ChannelId) -> CoreResult<f64> {
        let _lease = self.request_lease()?;
        let client = self.client().await?;
        Ok(client.read_channel(index).await?)
    }

    /// Drive a writable output (the topography DAC) through the acquisition
    /// driver, in the channel's unit. Returns the counts sent.
    ///
    /// Holds Z only while the host's feedback loop is disabled
    /// (`feedback_enable` = 0); the driver does not check that.
    pub async fn write_output(&self, channel: ChannelId, value: f64) -> CoreResult<i32> {
        let _lease = self.request_lease()?;
        let connection = self.connection.lock().await;
        let conn = connection.as_ref().ok_or(CoreError::NotConnected)?;
        let reader = conn.reader.as_ref().ok_or_else(|| {
            DriverError::unavailable(
                self.config.driver.device_path.clone(),
                "acquisition driver is not open (offline mode)",
            )
        })?;
        Ok(reader.write_output(channel, value).await?)
    }

    /// Known parameters with their cached values.
    pub fn parameters(&self) -> Vec<ParameterSnapshot> {
        self.registry.snapshot()
    }

    /// Parameter registry of this session.
    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    fn request_lease(&self) -> CoreResult<OwnedRwLockReadGuard<()>> {
        self.lease
            .clone()
            .try_read_owned()
            .map_err(|_| CoreError::Busy("a step test owns the parameter channel".into()))
    }

    async fn client(&self) -> CoreResult<Arc<ProtocolClient>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.client.clone())
            .ok_or(CoreError::NotConnected)
    }

    // =========================================================================
    // Step tests
    // =========================================================================

    /// Start a step test. Returns the event subscription, abort handle and
    /// completion of the run.
    pub async fn start_step_test(&self, plan: StepTestPlan) -> CoreResult<StepTestHandle> {
        let connection = self.connection.lock().await;
        let conn = connection.as_ref().ok_or(CoreError::NotConnected)?;
        if conn.sequencer.is_running() {
            return Err(SequencerError::AlreadyRunning.into());
        }

        let lease = self.lease.clone().try_write_owned().map_err(|_| {
            CoreError::Busy("a parameter request is in flight".into())
        })?;
        Ok(conn.sequencer.start_with_lease(plan, lease)?)
    }

    /// Abort the running step test, if any.
    pub async fn abort_step_test(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(conn) => conn.sequencer.abort(),
            None => false,
        }
    }

    /// Phase of the step sequencer, if connected.
    pub async fn sequencer_state(&self) -> Option<SequencerState> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.sequencer.state())
    }

    /// Subscribe to acknowledged step transitions.
    pub fn subscribe_step_events(&self) -> broadcast::Receiver<StepEvent> {
        self.step_events_tx.subscribe()
    }

    // =========================================================================
    // Scope
    // =========================================================================

    /// Start streaming `channels` (the configured defaults when empty) and
    /// return a subscription. A running scope is restarted with the new
    /// channel set.
    pub async fn start_scope(
        &self,
        channels: &[ChannelId],
    ) -> CoreResult<broadcast::Receiver<ScopeEvent>> {
        let channels = if channels.is_empty() {
            self.config.scope_channels()?
        } else {
            channels.to_vec()
        };

        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or(CoreError::NotConnected)?;
        if conn.reader.is_none() {
            return Err(DriverError::unavailable(
                self.config.driver.device_path.clone(),
                "acquisition driver is not open (offline mode)",
            )
            .into());
        }

        self.stop_scope_locked(conn).await;
        let Some(reader) = conn.reader.as_mut() else {
            return Err(CoreError::NotConnected);
        };

        reader.configure_channels(&channels)?;
        let stream = reader.start_stream()?;
        let receiver = self.samples_tx.subscribe();

        let task = tokio::spawn(pump_samples(
            stream,
            self.samples_tx.clone(),
            self.state.clone(),
        ));
        conn.scope = Some(ScopePump { task });
        self.state
            .send_replace(SessionState::Connected(Activity::Streaming));
        info!(channels = ?channels, "Scope started");
        Ok(receiver)
    }

    /// Stop the scope. No-op when it is not running.
    pub async fn stop_scope(&self) -> CoreResult<()> {
        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_mut() {
            self.stop_scope_locked(conn).await;
        }
        Ok(())
    }

    async fn stop_scope_locked(&self, conn: &mut Connection) {
        if let Some(reader) = conn.reader.as_mut() {
            reader.stop().await;
        }
        if let Some(mut pump) = conn.scope.take() {
            if tokio::time::timeout(self.config.session.stop_timeout, &mut pump.task)
                .await
                .is_err()
            {
                // A detached pump would later flip a restarted scope to Idle.
                pump.task.abort();
                warn!("Scope pump did not exit in time, aborted");
            }
            debug!("Scope stopped");
        }
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connected(Activity::Streaming) {
                *state = SessionState::Connected(Activity::Idle);
                true
            } else {
                false
            }
        });
    }

    /// Subscribe to scope events without (re)starting the scope.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<ScopeEvent> {
        self.samples_tx.subscribe()
    }

    /// [`Self::subscribe_samples`] as a `Stream`.
    pub fn scope_events(&self) -> impl Stream<Item = ScopeEvent> + Send + 'static {
        scope_stream(self.samples_tx.subscribe())
    }

    /// Static channel table of the driver.
    pub fn channel_table(&self) -> &'static [ChannelInfo] {
        CHANNEL_TABLE
    }

    // =========================================================================
    // Clocks
    // =========================================================================

    /// Measure the protocol/acquisition clock offset and keep it as the
    /// session's calibration.
    pub fn calibrate_clocks(&self) -> ClockCalibration {
        let calibration = ClockCalibration::measure(&self.protocol_clock, &self.acquisition_clock);
        debug!(
            offset_ns = calibration.offset_ns(),
            uncertainty = ?calibration.uncertainty(),
            "Clock calibration measured"
        );
        *self.calibration.write() = Some(calibration);
        calibration
    }

    /// Latest calibration, `None` before the first connect.
    pub fn clock_calibration(&self) -> Option<ClockCalibration> {
        *self.calibration.read()
    }

    // =========================================================================
    // Simulation
    // =========================================================================

    /// Handle on the simulated host while connected to it.
    pub fn mock_host(&self) -> Option<MockHostHandle> {
        self.mock_host.read().clone()
    }

    /// Wait until the session reaches `target`, bounded by `timeout`.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|result| result.is_ok());
        reached
    }
}

/// Adapt a scope subscription into a `Stream`. A subscriber that falls behind
/// skips the samples it missed instead of ending.
pub fn scope_stream(
    receiver: broadcast::Receiver<ScopeEvent>,
) -> impl Stream<Item = ScopeEvent> + Send + 'static {
    BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Scope subscriber lagged, samples skipped");
                None
            }
        }
    })
}

async fn pump_samples(
    mut stream: SampleStream,
    samples: broadcast::Sender<ScopeEvent>,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut failed = false;
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(sample) => ScopeEvent::Sample(sample),
            Err(error) => {
                warn!(error = %error, "Scope stream terminated");
                failed = true;
                ScopeEvent::Terminated(error)
            }
        };
        // Nobody listening is fine.
        let _ = samples.send(event);
    }
    if !failed {
        let _ = samples.send(ScopeEvent::Stopped);
    }

    state.send_if_modified(|state| {
        if *state == SessionState::Connected(Activity::Streaming) {
            *state = SessionState::Connected(Activity::Idle);
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn operations_need_a_connection() {
        let session = AcquisitionSession::new(CoreConfig::default());

        let err = session.set_parameter("amp_ref", 0.1).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
        assert!(session.disconnect().await.is_ok());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.clock_calibration().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_is_idempotent() {
        let session = AcquisitionSession::new(CoreConfig::default());
        session.connect().await.unwrap();
        session.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Connected(Activity::Idle));
        assert!(session.clock_calibration().is_some());
        assert!(session.mock_host().is_some());

        session.disconnect().await.unwrap();
        assert!(session.mock_host().is_none());
        assert!(logs_contain("Session connected"));
        assert!(logs_contain("Session disconnected"));
    }

    #[test]
    fn session_state_display() {
        assert_eq!(
            SessionState::Connected(Activity::Streaming).to_string(),
            "connected (streaming)"
        );
    }
}
