//! Error types for the acquisition core.
//!
//! Every component has its own `thiserror` error so that its contract stays
//! explicit: the protocol client returns [`ConnectError`] and [`CommandError`],
//! the driver reader returns [`DriverError`] and terminates streams with
//! [`StreamError`], and the step sequencer returns [`SequencerError`].
//!
//! All of them convert into [`CoreError`] with `?`. The consumer-facing layer
//! should branch on [`CoreError::kind`], because the recovery action differs
//! per kind:
//!
//! | Kind               | Meaning                                  | Recovery            |
//! |--------------------|------------------------------------------|---------------------|
//! | `Connection`       | host or driver unreachable or lost       | reconnect           |
//! | `Timeout`          | no response within the bounded interval  | caller may retry    |
//! | `Rejected`         | host refused the request / bad input     | fix input           |
//! | `InvalidPlan`      | step test plan failed validation         | fix plan            |
//! | `StreamTerminated` | driver transfer failed mid-acquisition   | restart the stream  |
//! | `Busy`             | conflicting operation in progress        | wait and retry      |
//! | `Configuration`    | configuration file or values invalid     | fix configuration   |

use std::time::Duration;
use thiserror::Error;

use crate::driver::ChannelId;

/// Convenience alias for results using the crate error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The link to the host or the driver is down.
    Connection,
    /// The host did not answer in time.
    Timeout,
    /// The host or the driver refused the request.
    Rejected,
    /// A step test plan failed validation.
    InvalidPlan,
    /// The sample stream ended with an error.
    StreamTerminated,
    /// Another operation holds the instrument.
    Busy,
    /// The configuration is invalid.
    Configuration,
}

impl ErrorKind {
    /// Short operator-facing hint describing how to recover.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "reconnect to the instrument",
            ErrorKind::Timeout => "retry the request",
            ErrorKind::Rejected => "correct the requested value",
            ErrorKind::InvalidPlan => "correct the step test plan",
            ErrorKind::StreamTerminated => "restart the scope",
            ErrorKind::Busy => "wait for the running operation to finish",
            ErrorKind::Configuration => "fix the configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::InvalidPlan => "invalid_plan",
            ErrorKind::StreamTerminated => "stream_terminated",
            ErrorKind::Busy => "busy",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Failure to establish a session with the host control software.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// The host process is not reachable (not running, refused, wrong address).
    #[error("Host application unavailable: {0}")]
    HostUnavailable(String),

    /// The host accepted the connection but never answered the handshake.
    #[error("No handshake response from host within {0:?}")]
    Timeout(Duration),
}

/// Failure of a single request/response cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The host reported an invalid value or the request named an unknown
    /// parameter. Never retried automatically.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// No matching response arrived within the request timeout. The request
    /// may or may not have been applied by the host.
    #[error("No response from host within {0:?}")]
    Timeout(Duration),

    /// The transport to the host failed; the session must be reconnected.
    #[error("Connection to host lost: {0}")]
    ConnectionLost(String),
}

impl CommandError {
    /// Classify this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Rejected(_) => ErrorKind::Rejected,
            CommandError::Timeout(_) => ErrorKind::Timeout,
            CommandError::ConnectionLost(_) => ErrorKind::Connection,
        }
    }
}

// =============================================================================
// Driver Errors
// =============================================================================

/// Cause of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The kernel interface could not be opened.
    Unavailable,
    /// A channel id is not part of the driver's channel table.
    InvalidChannel,
    /// The operation is not allowed while a stream is running.
    Busy,
    /// A control transfer failed.
    Transfer,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Unavailable => "unavailable",
            DriverErrorKind::InvalidChannel => "invalid_channel",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Transfer => "transfer",
        };
        write!(f, "{}", label)
    }
}

/// Failure of the acquisition driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{device}' {kind} error: {message}")]
pub struct DriverError {
    /// Device the error came from.
    pub device: String,
    /// What went wrong.
    pub kind: DriverErrorKind,
    /// Detail from the OS or the device.
    pub message: String,
}

impl DriverError {
    /// Error of `kind` on `device`.
    pub fn new(
        device: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// `DriverUnavailable`: wrong permissions, device absent, or the host
    /// software holds an incompatible lock.
    pub fn unavailable(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DriverErrorKind::Unavailable, message)
    }

    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.kind {
            DriverErrorKind::Unavailable => ErrorKind::Connection,
            DriverErrorKind::InvalidChannel => ErrorKind::Rejected,
            DriverErrorKind::Busy => ErrorKind::Busy,
            DriverErrorKind::Transfer => ErrorKind::StreamTerminated,
        }
    }
}

/// Terminal error item of a sample stream. Reported exactly once, after which
/// the stream ends.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Sample stream terminated on channel {channel}: {message}")]
pub struct StreamError {
    /// Channel the stream was reading.
    pub channel: ChannelId,
    /// Error reported by the driver.
    pub message: String,
}

// =============================================================================
// Sequencer Errors
// =============================================================================

/// Failure to start or complete a step test.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    /// A run is already active on this session.
    #[error("A step test is already running")]
    AlreadyRunning,

    /// The plan failed validation before any request was sent.
    #[error("Invalid step test plan: {0}")]
    InvalidPlan(String),

    /// The run task ended without delivering a report.
    #[error("Step test task ended without a report")]
    Interrupted,
}

// =============================================================================
// Crate Error
// =============================================================================

/// Primary error type returned across the consumer-facing facade.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Connecting to the host failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A host request failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The acquisition driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The sample stream terminated.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A step test could not start or finish.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// An operation needs a connected session.
    #[error("Session is not connected")]
    NotConnected,

    /// A conflicting operation is in progress (e.g. a step test owns the
    /// parameter channel).
    #[error("Instrument busy: {0}")]
    Busy(String),

    /// Figment failed to extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A configured value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Classify this failure so the caller can pick the recovery action.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Connect(_) | CoreError::NotConnected | CoreError::Io(_) => {
                ErrorKind::Connection
            }
            CoreError::Command(err) => err.kind(),
            CoreError::Driver(err) => err.kind(),
            CoreError::Stream(_) => ErrorKind::StreamTerminated,
            CoreError::Sequencer(SequencerError::AlreadyRunning) | CoreError::Busy(_) => {
                ErrorKind::Busy
            }
            CoreError::Sequencer(SequencerError::InvalidPlan(_)) => ErrorKind::InvalidPlan,
            CoreError::Sequencer(SequencerError::Interrupted) => ErrorKind::Connection,
            CoreError::Config(_) | CoreError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Busy`.
    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }
}
