//! # NC-AFM Instrument Communication & Acquisition Core
//!
//! This crate is the headless core of the NC-AFM tuning tool. It talks to the
//! same physical instrument over two independent channels and keeps the two in
//! step:
//!
//! - **`protocol`**: command/response client for the SXM host control software
//!   (named parameter get/set, raw commands). Requests are strictly serialized.
//! - **`driver`**: direct reader for the acquisition driver below the host
//!   software. Produces a timestamped, cancellable stream of raw channel samples.
//! - **`sequencer`**: runs step tests, timed square-wave perturbations of one
//!   parameter, and reports when every transition was acknowledged.
//! - **`session`**: the `AcquisitionSession` facade owning the lifecycle of the
//!   above and fanning samples and step events out to subscribers.
//!
//! Supporting modules:
//!
//! - **`clock`**: the two clock domains and the offset calibration between them.
//! - **`parameter`**: parameter handles and the per-session registry.
//! - **`simulation`**: shared simulated instrument behind the mock host and
//!   mock scope device (offline mode, tests).
//! - **`config`**: figment-based configuration loading.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: error taxonomy shared by all components.

pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod parameter;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod simulation;

pub use clock::{AcquisitionTime, ClockCalibration, ProtocolTime};
pub use config::CoreConfig;
pub use driver::{ChannelId, ChannelSample, DriverChannelReader, SampleStream};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use protocol::{Ack, ProtocolClient};
pub use sequencer::{StepEvent, StepPattern, StepSequencer, StepTestHandle, StepTestPlan};
pub use session::{AcquisitionSession, Activity, ScopeEvent, SessionState};
