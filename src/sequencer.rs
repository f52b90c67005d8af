//! Step sequencer.
//!
//! Applies a timed square-wave perturbation to one host parameter through the
//! [`ProtocolClient`] and reports when each transition was acknowledged, so
//! the response captured by the driver reader can be lined up against it.
//!
//! # State machine
//!
//! ```text
//! Idle ──start──► Armed ──settle──► Stepping(1..=N) ──► Settling ──► Idle
//!                   │                    │                  │
//!                   └────────── abort / command failure ────┴──► Aborted
//! ```
//!
//! A step's hold is measured from when its request was issued. Steps are never
//! skipped: a failed `set_parameter` aborts the plan. On abort the sequencer
//! makes exactly one attempt to put the parameter back at baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::{AcquisitionTime, ClockCalibration, ProtocolTime};
use crate::driver::ChannelSample;
use crate::error::{CommandError, SequencerError};
use crate::protocol::{Ack, ProtocolClient};

// =============================================================================
// Plan
// =============================================================================

/// How step targets are derived from baseline and amplitude.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPattern {
    /// Odd steps `baseline + amplitude`, even steps `baseline - amplitude`.
    #[default]
    Alternating,
    /// Odd steps `baseline + amplitude`, even steps `baseline`.
    Unipolar,
}

impl StepPattern {
    /// Target of 1-based step `step`.
    pub fn target(&self, baseline: f64, amplitude: f64, step: u32) -> f64 {
        let odd = step % 2 == 1;
        match (self, odd) {
            (_, true) => baseline + amplitude,
            (StepPattern::Alternating, false) => baseline - amplitude,
            (StepPattern::Unipolar, false) => baseline,
        }
    }
}

impl std::fmt::Display for StepPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPattern::Alternating => write!(f, "alternating"),
            StepPattern::Unipolar => write!(f, "unipolar"),
        }
    }
}

impl std::str::FromStr for StepPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alternating" => Ok(StepPattern::Alternating),
            "unipolar" => Ok(StepPattern::Unipolar),
            other => Err(format!(
                "unknown step pattern '{other}' (expected alternating or unipolar)"
            )),
        }
    }
}

/// One step test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTestPlan {
    /// Name of the stepped parameter.
    pub parameter: String,
    /// Value before the first step and after the last.
    pub baseline: f64,
    /// Step size relative to the baseline.
    pub amplitude: f64,
    /// Number of steps.
    pub steps: u32,
    /// Time each step is held, measured from issue.
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
    /// Quiet time before the first step and after the return to baseline.
    #[serde(with = "humantime_serde", default)]
    pub settle: Duration,
    /// Direction of successive steps.
    #[serde(default)]
    pub pattern: StepPattern,
}

impl StepTestPlan {
    /// Plan with no settle time and the default pattern.
    pub fn new(
        parameter: impl Into<String>,
        baseline: f64,
        amplitude: f64,
        steps: u32,
        hold: Duration,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            baseline,
            amplitude,
            steps,
            hold,
            settle: Duration::ZERO,
            pattern: StepPattern::default(),
        }
    }

    /// Set the settle time.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the step pattern.
    pub fn with_pattern(mut self, pattern: StepPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Targets of steps `1..=steps`.
    pub fn targets(&self) -> Vec<f64> {
        (1..=self.steps)
            .map(|step| self.pattern.target(self.baseline, self.amplitude, step))
            .collect()
    }

    /// Check the plan against the measured request round-trip latency.
    pub fn validate(&self, last_round_trip: Option<Duration>) -> Result<(), SequencerError> {
        if self.parameter.trim().is_empty() {
            return Err(SequencerError::InvalidPlan("no parameter named".into()));
        }
        if self.steps == 0 {
            return Err(SequencerError::InvalidPlan(
                "step count must be at least 1".into(),
            ));
        }
        if self.hold.is_zero() {
            return Err(SequencerError::InvalidPlan("hold must be positive".into()));
        }
        if !self.baseline.is_finite() || !self.amplitude.is_finite() {
            return Err(SequencerError::InvalidPlan(
                "baseline and amplitude must be finite".into(),
            ));
        }
        if let Some(round_trip) = last_round_trip {
            if self.hold <= round_trip {
                return Err(SequencerError::InvalidPlan(format!(
                    "hold {:?} does not exceed request round-trip latency {:?}",
                    self.hold, round_trip
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// State, events and outcome
// =============================================================================

/// Phase of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    /// No run active.
    Idle,
    /// Run accepted, baseline being applied.
    Armed,
    /// Step `index` of `of` is in effect.
    Stepping {
        /// 1-based step index.
        index: u32,
        /// Number of steps in the plan.
        of: u32,
    },
    /// Waiting out the settle time after the return to baseline.
    Settling,
    /// The last run was aborted.
    Aborted,
}

impl SequencerState {
    /// Whether a new run may start from this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, SequencerState::Idle | SequencerState::Aborted)
    }
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "idle"),
            SequencerState::Armed => write!(f, "armed"),
            SequencerState::Stepping { index, of } => write!(f, "stepping {index}/{of}"),
            SequencerState::Settling => write!(f, "settling"),
            SequencerState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Kind of an acknowledged transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A step away from the baseline.
    Step,
    /// Return to baseline after the last step, or on abort.
    Baseline,
}

/// An acknowledged transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    /// Run this event belongs to.
    pub run_id: Uuid,
    /// Step or return to baseline.
    pub kind: StepKind,
    /// 1-based step index; `steps + 1` for the baseline event.
    pub index: u32,
    /// Value the parameter was set to.
    pub target: f64,
    /// When the request was issued.
    pub issued_at: ProtocolTime,
    /// When the host acknowledged the transition.
    pub acknowledged_at: ProtocolTime,
    /// Wall-clock time of the acknowledgement.
    pub wall_time: DateTime<Utc>,
}

/// Why a run aborted.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The caller asked for it.
    Requested,
    /// A step request failed.
    CommandFailed(CommandError),
}

/// What happened to the parameter when a run aborted.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineRestore {
    /// The baseline was written back.
    Restored,
    /// The restore request failed. The instrument may still hold
    /// `last_value`.
    Failed {
        /// Error of the restore request.
        error: CommandError,
        /// Last value acknowledged by the host.
        last_value: Option<f64>,
    },
    /// The connection was gone; the instrument may still hold `last_value`.
    NotAttempted {
        /// Last value acknowledged by the host.
        last_value: Option<f64>,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Every step and the return to baseline were acknowledged.
    Completed,
    /// The run stopped early.
    Aborted {
        /// Why the run stopped.
        reason: AbortReason,
        /// Outcome of the baseline restore.
        baseline: BaselineRestore,
    },
}

/// Full record of one run.
#[derive(Debug, Clone)]
pub struct StepTestReport {
    /// Id of the run.
    pub run_id: Uuid,
    /// The plan as executed.
    pub plan: StepTestPlan,
    /// How the run ended.
    pub outcome: StepOutcome,
    /// Acknowledged transitions, in order.
    pub events: Vec<StepEvent>,
    /// When the run was accepted.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
}

impl StepOutcome {
    /// Sequencer state once a run with this outcome has ended.
    pub fn resting_state(&self) -> SequencerState {
        match self {
            StepOutcome::Completed => SequencerState::Idle,
            StepOutcome::Aborted { .. } => SequencerState::Aborted,
        }
    }
}

impl StepTestReport {
    /// Whether the run completed.
    pub fn is_completed(&self) -> bool {
        self.outcome == StepOutcome::Completed
    }

    /// Events of kind [`StepKind::Step`].
    pub fn steps(&self) -> impl Iterator<Item = &StepEvent> {
        self.events.iter().filter(|e| e.kind == StepKind::Step)
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Requests cancellation of one run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request the abort. The run restores the baseline before it ends.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the abort was requested.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves to the run's report.
#[derive(Debug)]
pub struct StepTestCompletion {
    rx: oneshot::Receiver<StepTestReport>,
}

impl StepTestCompletion {
    /// Wait for the report.
    pub async fn wait(self) -> Result<StepTestReport, SequencerError> {
        self.rx.await.map_err(|_| SequencerError::Interrupted)
    }
}

/// Returned by [`StepSequencer::start`].
#[derive(Debug)]
pub struct StepTestHandle {
    /// Id of the run.
    pub run_id: Uuid,
    /// Step events, starting with this run's first.
    pub events: broadcast::Receiver<StepEvent>,
    /// Abort handle of this run.
    pub abort: AbortHandle,
    /// Resolves to the run's report.
    pub completion: StepTestCompletion,
}

impl StepTestHandle {
    /// Shorthand for `self.abort.abort()`.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Wait for the run's report.
    pub async fn wait(self) -> Result<StepTestReport, SequencerError> {
        self.completion.wait().await
    }
}

// =============================================================================
// Sequencer
// =============================================================================

struct ActiveRun {
    run_id: Uuid,
    abort: AbortHandle,
    task: JoinHandle<()>,
}

/// Runs one step test at a time over a [`ProtocolClient`].
///
/// State changes are published on a watch channel; acknowledged transitions
/// on the events channel.
pub struct StepSequencer {
    client: Arc<ProtocolClient>,
    events: broadcast::Sender<StepEvent>,
    state: Arc<watch::Sender<SequencerState>>,
    active: parking_lot::Mutex<Option<ActiveRun>>,
}

impl StepSequencer {
    /// Sequencer issuing requests through `client` and publishing step events
    /// on `events`.
    pub fn new(client: Arc<ProtocolClient>, events: broadcast::Sender<StepEvent>) -> Self {
        let (state, _) = watch::channel(SequencerState::Idle);
        Self {
            client,
            events,
            state: Arc::new(state),
            active: parking_lot::Mutex::new(None),
        }
    }

    /// Current phase.
    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    /// Follow phase changes.
    pub fn watch_state(&self) -> watch::Receiver<SequencerState> {
        self.state.subscribe()
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        !self.state().is_ready()
    }

    /// Id of the active run.
    pub fn current_run(&self) -> Option<Uuid> {
        self.active
            .lock()
            .as_ref()
            .filter(|_| self.is_running())
            .map(|run| run.run_id)
    }

    /// Start a run. Must be called inside a tokio runtime.
    pub fn start(&self, plan: StepTestPlan) -> Result<StepTestHandle, SequencerError> {
        self.start_with_lease(plan, ())
    }

    /// Start a run that keeps `lease` alive until it finishes.
    pub(crate) fn start_with_lease<L: Send + 'static>(
        &self,
        plan: StepTestPlan,
        lease: L,
    ) -> Result<StepTestHandle, SequencerError> {
        let mut active = self.active.lock();
        if self.is_running() {
            return Err(SequencerError::AlreadyRunning);
        }

        plan.validate(self.client.last_round_trip())?;
        if self.client.registry().spec(&plan.parameter).is_none() {
            return Err(SequencerError::InvalidPlan(format!(
                "unknown parameter '{}'",
                plan.parameter
            )));
        }

        let run_id = Uuid::new_v4();
        let abort = AbortHandle::new();
        let (done_tx, done_rx) = oneshot::channel();
        let events = self.events.subscribe();
        self.state.send_replace(SequencerState::Armed);

        let run = Run {
            run_id,
            plan,
            client: self.client.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            abort: abort.subscribe(),
            recorded: Vec::new(),
            last_value: None,
        };
        let span = info_span!("step_test", run_id = %run_id, parameter = %run.plan.parameter);
        let state = self.state.clone();
        let task = tokio::spawn(
            async move {
                let report = run.execute().await;
                // Release before announcing the resting state, so a caller that
                // sees Idle/Aborted finds the parameter channel free.
                drop(lease);
                state.send_replace(report.outcome.resting_state());
                if done_tx.send(report).is_err() {
                    debug!("Step test report dropped by caller");
                }
            }
            .instrument(span),
        );

        *active = Some(ActiveRun {
            run_id,
            abort: abort.clone(),
            task,
        });

        Ok(StepTestHandle {
            run_id,
            events,
            abort,
            completion: StepTestCompletion { rx: done_rx },
        })
    }

    /// Abort the active run, if any. Returns whether a run was signalled.
    pub fn abort(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(run) if !run.task.is_finished() => {
                run.abort.abort();
                true
            }
            _ => false,
        }
    }

    /// Wait until no run is active. Returns false if `timeout` elapsed first.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let finished = tokio::time::timeout(timeout, state.wait_for(SequencerState::is_ready))
            .await
            .is_ok();
        finished
    }
}

impl Drop for StepSequencer {
    fn drop(&mut self) {
        if let Some(run) = self.active.lock().as_ref() {
            run.abort.abort();
        }
    }
}

// =============================================================================
// Run
// =============================================================================

struct Run {
    run_id: Uuid,
    plan: StepTestPlan,
    client: Arc<ProtocolClient>,
    events: broadcast::Sender<StepEvent>,
    state: Arc<watch::Sender<SequencerState>>,
    abort: watch::Receiver<bool>,
    recorded: Vec<StepEvent>,
    /// Last value acknowledged by the host during this run.
    last_value: Option<f64>,
}

/// Why the stepping phase stopped early.
enum Interrupt {
    Abort(AbortReason),
    /// The return to baseline itself failed; no further restore attempt.
    BaselineFailed(CommandError),
}

impl Run {
    async fn execute(mut self) -> StepTestReport {
        let started_at = Utc::now();
        info!(
            steps = self.plan.steps,
            baseline = self.plan.baseline,
            amplitude = self.plan.amplitude,
            hold = ?self.plan.hold,
            pattern = %self.plan.pattern,
            "Step test started"
        );

        let outcome = match self.step_through().await {
            Ok(()) => {
                info!("Step test completed");
                StepOutcome::Completed
            }
            Err(Interrupt::Abort(reason)) => {
                let baseline = self.restore_baseline().await;
                warn!(reason = ?reason, baseline = ?baseline, "Step test aborted");
                StepOutcome::Aborted { reason, baseline }
            }
            Err(Interrupt::BaselineFailed(error)) => {
                warn!(error = %error, "Return to baseline failed");
                StepOutcome::Aborted {
                    reason: AbortReason::CommandFailed(error.clone()),
                    baseline: BaselineRestore::Failed {
                        error,
                        last_value: self.last_value,
                    },
                }
            }
        };

        StepTestReport {
            run_id: self.run_id,
            plan: self.plan,
            outcome,
            events: self.recorded,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn step_through(&mut self) -> Result<(), Interrupt> {
        self.state.send_replace(SequencerState::Armed);
        self.pause(self.plan.settle).await?;

        let of = self.plan.steps;
        for index in 1..=of {
            self.check_abort()?;
            self.state
                .send_replace(SequencerState::Stepping { index, of });

            let target = self
                .plan
                .pattern
                .target(self.plan.baseline, self.plan.amplitude, index);
            let issued = Instant::now();
            let ack = self
                .client
                .set_parameter(&self.plan.parameter, target)
                .await
                .map_err(|e| Interrupt::Abort(AbortReason::CommandFailed(e)))?;
            self.record(StepKind::Step, index, ack);

            self.pause_until(issued + self.plan.hold).await?;
        }

        self.check_abort()?;
        let ack = self
            .client
            .set_parameter(&self.plan.parameter, self.plan.baseline)
            .await
            .map_err(Interrupt::BaselineFailed)?;
        self.record(StepKind::Baseline, of + 1, ack);

        self.state.send_replace(SequencerState::Settling);
        self.pause(self.plan.settle).await?;
        Ok(())
    }

    async fn restore_baseline(&mut self) -> BaselineRestore {
        if self.client.is_closed() {
            return BaselineRestore::NotAttempted {
                last_value: self.last_value,
            };
        }
        match self
            .client
            .set_parameter(&self.plan.parameter, self.plan.baseline)
            .await
        {
            Ok(ack) => {
                self.record(StepKind::Baseline, self.plan.steps + 1, ack);
                BaselineRestore::Restored
            }
            Err(CommandError::ConnectionLost(_)) => BaselineRestore::NotAttempted {
                last_value: self.last_value,
            },
            Err(error) => BaselineRestore::Failed {
                error,
                last_value: self.last_value,
            },
        }
    }

    fn record(&mut self, kind: StepKind, index: u32, ack: Ack) {
        let event = StepEvent {
            run_id: self.run_id,
            kind,
            index,
            target: ack.value,
            issued_at: ack.issued_at,
            acknowledged_at: ack.acknowledged_at,
            wall_time: Utc::now(),
        };
        debug!(step = index, kind = ?kind, target = ack.value, "Step acknowledged");
        self.last_value = Some(ack.value);
        // No subscribers is fine; the report keeps every event.
        let _ = self.events.send(event.clone());
        self.recorded.push(event);
    }

    fn check_abort(&self) -> Result<(), Interrupt> {
        if *self.abort.borrow() {
            Err(Interrupt::Abort(AbortReason::Requested))
        } else {
            Ok(())
        }
    }

    async fn pause(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.pause_until(Instant::now() + duration).await
    }

    async fn pause_until(&mut self, deadline: Instant) -> Result<(), Interrupt> {
        tokio::select! {
            Ok(_) = self.abort.wait_for(|aborted| *aborted) => {
                Err(Interrupt::Abort(AbortReason::Requested))
            }
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Samples captured while one step was in effect.
#[derive(Debug, Clone)]
pub struct StepWindow {
    /// The step this window belongs to.
    pub event: StepEvent,
    /// Acknowledgement of the step, in the acquisition domain.
    pub start: AcquisitionTime,
    /// Acknowledgement of the next transition, if any.
    pub end: Option<AcquisitionTime>,
    /// Samples with timestamps inside the window.
    pub samples: Vec<ChannelSample>,
}

/// Split `samples` into windows starting at each acknowledged transition.
///
/// Events are mapped into the acquisition clock domain through `calibration`.
/// Samples before the first event are dropped.
pub fn correlate_samples(
    events: &[StepEvent],
    samples: &[ChannelSample],
    calibration: &ClockCalibration,
) -> Vec<StepWindow> {
    let mut ordered: Vec<&StepEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.acknowledged_at);

    let starts: Vec<AcquisitionTime> = ordered
        .iter()
        .map(|event| calibration.to_acquisition(event.acknowledged_at))
        .collect();

    ordered
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let start = starts[i];
            let end = starts.get(i + 1).copied();
            let samples = samples
                .iter()
                .filter(|s| s.timestamp >= start && end.map_or(true, |end| s.timestamp < end))
                .copied()
                .collect();
            StepWindow {
                event: (*event).clone(),
                start,
                end,
                samples,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternating_pattern_swings_both_ways() {
        let plan = StepTestPlan::new("amp_ref", 10.0, 2.0, 4, Duration::from_millis(500));
        assert_eq!(plan.targets(), vec![12.0, 8.0, 12.0, 8.0]);
    }

    #[test]
    fn unipolar_pattern_returns_to_baseline() {
        let plan = StepTestPlan::new("amp_ref", 10.0, 2.0, 3, Duration::from_millis(500))
            .with_pattern(StepPattern::Unipolar);
        assert_eq!(plan.targets(), vec![12.0, 10.0, 12.0]);
    }

    #[test]
    fn pattern_parses_case_insensitively() {
        assert_eq!("Unipolar".parse::<StepPattern>(), Ok(StepPattern::Unipolar));
        assert!("square".parse::<StepPattern>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_free_once_the_resting_state_is_visible() {
        use crate::clock::ProtocolClock;
        use crate::parameter::ParameterRegistry;
        use crate::protocol::{ConnectOptions, HostEndpoint, MockHost};
        use crate::simulation::MockInstrument;

        let client = ProtocolClient::connect(
            HostEndpoint::Mock(MockHost::new(MockInstrument::new())),
            ConnectOptions::default(),
            Arc::new(ParameterRegistry::with_defaults()),
            ProtocolClock::new(),
        )
        .await
        .unwrap();
        let (events, _) = broadcast::channel(16);
        let sequencer = StepSequencer::new(Arc::new(client), events);
        let lease = Arc::new(tokio::sync::RwLock::new(()));
        let mut states = sequencer.watch_state();

        let plan = StepTestPlan::new("amp_ki", 0.1, 0.02, 2, Duration::from_millis(200))
            .with_settle(Duration::from_millis(100));
        let guard = lease.clone().try_write_owned().unwrap();
        let _handle = sequencer.start_with_lease(plan, guard).unwrap();
        assert!(lease.try_read().is_err());

        states.wait_for(|s| *s == SequencerState::Settling).await.unwrap();
        states.wait_for(SequencerState::is_ready).await.unwrap();
        assert!(lease.try_read().is_ok());
    }

    #[test]
    fn validation_rejects_degenerate_plans() {
        let hold = Duration::from_millis(100);
        let zero_steps = StepTestPlan::new("amp_ref", 1.0, 0.1, 0, hold);
        let zero_hold = StepTestPlan::new("amp_ref", 1.0, 0.1, 2, Duration::ZERO);
        let too_fast = StepTestPlan::new("amp_ref", 1.0, 0.1, 2, hold);
        let nan = StepTestPlan::new("amp_ref", f64::NAN, 0.1, 2, hold);

        assert!(matches!(
            zero_steps.validate(None),
            Err(SequencerError::InvalidPlan(_))
        ));
        assert!(zero_hold.validate(None).is_err());
        assert!(nan.validate(None).is_err());
        assert!(too_fast.validate(Some(Duration::from_millis(100))).is_err());
        assert!(too_fast.validate(Some(Duration::from_millis(99))).is_ok());
    }

    #[test]
    fn plan_deserializes_with_humantime_durations() {
        let plan: StepTestPlan = toml::from_str(
            r#"
            parameter = "amp_ref"
            baseline = 0.08
            amplitude = 0.01
            steps = 6
            hold = "250ms"
            pattern = "unipolar"
            "#,
        )
        .unwrap();

        assert_eq!(plan.hold, Duration::from_millis(250));
        assert_eq!(plan.settle, Duration::ZERO);
        assert_eq!(plan.pattern, StepPattern::Unipolar);
    }

    fn event(index: u32, ack_ms: u64) -> StepEvent {
        StepEvent {
            run_id: Uuid::nil(),
            kind: StepKind::Step,
            index,
            target: index as f64,
            issued_at: ProtocolTime::from_duration(Duration::from_millis(ack_ms - 1)),
            acknowledged_at: ProtocolTime::from_duration(Duration::from_millis(ack_ms)),
            wall_time: Utc::now(),
        }
    }

    fn sample(at_ms: u64) -> ChannelSample {
        ChannelSample {
            channel: -12,
            raw: at_ms as i32,
            timestamp: AcquisitionTime::from_duration(Duration::from_millis(at_ms)),
            sequence: at_ms,
        }
    }

    #[test]
    fn correlation_splits_samples_at_acknowledgements() {
        // Acquisition clock runs 1 s ahead of the protocol clock.
        let calibration = ClockCalibration::from_reference(
            ProtocolTime::from_duration(Duration::ZERO),
            AcquisitionTime::from_duration(Duration::from_secs(1)),
            Duration::ZERO,
        );
        let events = [event(2, 600), event(1, 100)];
        let samples: Vec<_> = [1_050, 1_100, 1_300, 1_599, 1_600, 1_900]
            .into_iter()
            .map(sample)
            .collect();

        let windows = correlate_samples(&events, &samples, &calibration);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].event.index, 1);
        assert_eq!(
            windows[0].samples.iter().map(|s| s.raw).collect::<Vec<_>>(),
            vec![1_100, 1_300, 1_599]
        );
        assert_eq!(windows[1].end, None);
        assert_eq!(
            windows[1].samples.iter().map(|s| s.raw).collect::<Vec<_>>(),
            vec![1_600, 1_900]
        );
    }
}
