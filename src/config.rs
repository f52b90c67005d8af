//! Configuration using Figment
//!
//! Configuration is layered from:
//! 1. `config/ncafm.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `NCAFM_`, nested with `__`
//!
//! Every section has defaults, so an empty file describes a fully simulated
//! setup (mock host, mock scope).
//!
//! # Example
//! ```no_run
//! use ncafm_core::config::CoreConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // NCAFM_HOST__ENDPOINT=tcp NCAFM_HOST__ADDRESS=10.0.0.5:5105 overrides the file
//! let config = CoreConfig::load()?;
//! config.validate()?;
//! println!("Host endpoint: {:?}", config.host.endpoint);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::driver::{lookup_channel, ChannelId, MockScopeConfig, ReaderOptions};
use crate::error::{CoreError, CoreResult};
use crate::logging::OutputFormat;
use crate::parameter::{default_specs, ParameterRegistry, ParameterSpec};
use crate::protocol::ConnectOptions;
use crate::sequencer::{StepPattern, StepTestPlan};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ncafm.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Application name and logging.
    pub application: ApplicationConfig,
    /// Host control software link.
    pub host: HostConfig,
    /// Acquisition driver access.
    pub driver: DriverConfig,
    /// Defaults for step test plans.
    pub step_test: StepTestConfig,
    /// Session timeouts and buffers.
    pub session: SessionConfig,
    /// Parameters in addition to (or overriding) the built-in table.
    pub parameters: Vec<ParameterSpec>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name used in log output.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format.
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ncafm".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// How the host control software is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostEndpointKind {
    /// In-process simulated host
    #[default]
    Mock,
    /// TCP bridge to the SXM remote-control interface
    Tcp,
}

/// Host control software connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Real bridge or in-process mock.
    pub endpoint: HostEndpointKind,
    /// `host:port` of the TCP bridge
    pub address: String,
    /// Bound on the initial handshake.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Bound on each request, measured from issue.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Simulated request latency of the mock host
    #[serde(with = "humantime_serde")]
    pub mock_latency: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: HostEndpointKind::Mock,
            address: "127.0.0.1:5105".to_string(),
            handshake_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(1),
            mock_latency: Duration::from_millis(5),
        }
    }
}

/// How the acquisition driver is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverEndpointKind {
    /// Simulated scope device
    #[default]
    Mock,
    /// Driver device node
    Device,
}

/// Acquisition driver access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Real device node or simulated scope.
    pub endpoint: DriverEndpointKind,
    /// Path of the driver device node.
    pub device_path: String,
    /// Interval between driver transfers.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Connect without the driver if it cannot be opened (scope unavailable)
    pub optional: bool,
    /// Default scope channels, by name or index
    pub channels: Vec<String>,
    /// Settings of the simulated scope device.
    pub mock: MockScopeConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: DriverEndpointKind::Mock,
            device_path: crate::driver::ioctl::DEFAULT_DEVICE_PATH.to_string(),
            poll_interval: Duration::from_millis(10),
            optional: false,
            channels: vec!["QPlusAmpl".to_string(), "Drive".to_string()],
            mock: MockScopeConfig::default(),
        }
    }
}

/// Step test defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTestConfig {
    /// Step direction pattern.
    pub pattern: StepPattern,
    /// Time each step is held.
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
    /// Quiet time around the step sequence.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for StepTestConfig {
    fn default() -> Self {
        Self {
            pattern: StepPattern::Alternating,
            hold: Duration::from_millis(500),
            settle: Duration::from_millis(200),
        }
    }
}

/// Session fan-out and shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the sample broadcast channel
    pub sample_buffer: usize,
    /// Capacity of the step event broadcast channel
    pub event_buffer: usize,
    /// Bound on each shutdown wait during disconnect
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_buffer: 4096,
            event_buffer: 256,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl CoreConfig {
    /// Load configuration from `config/ncafm.toml` and environment variables
    ///
    /// Example: `NCAFM_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file yields the
    /// defaults (plus environment overrides).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NCAFM_").split("__"))
            .extract()
    }

    /// Load, then validate.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let config = Self::load_from(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CoreResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.host.endpoint == HostEndpointKind::Tcp && self.host.address.trim().is_empty() {
            return invalid("host.address is required for the tcp endpoint");
        }
        if self.host.handshake_timeout.is_zero() || self.host.request_timeout.is_zero() {
            return invalid("host timeouts must be positive");
        }

        if self.driver.endpoint == DriverEndpointKind::Device
            && self.driver.device_path.trim().is_empty()
        {
            return invalid("driver.device_path is required for the device endpoint");
        }
        if self.driver.poll_interval.is_zero() {
            return invalid("driver.poll_interval must be positive");
        }
        self.scope_channels()?;

        if self.step_test.hold.is_zero() {
            return invalid("step_test.hold must be positive");
        }

        if self.session.sample_buffer == 0 || self.session.event_buffer == 0 {
            return invalid("session buffers must hold at least one item");
        }

        let mut names = HashSet::new();
        for spec in &self.parameters {
            if spec.name.trim().is_empty() {
                return invalid("parameter with empty name");
            }
            if !names.insert(spec.name.as_str()) {
                return invalid(format!("Duplicate parameter name: {}", spec.name));
            }
        }

        Ok(())
    }

    /// Default scope channels resolved against the driver's channel table.
    pub fn scope_channels(&self) -> CoreResult<Vec<ChannelId>> {
        self.driver
            .channels
            .iter()
            .map(|key| {
                lookup_channel(key).map(|info| info.index).ok_or_else(|| {
                    CoreError::Configuration(format!("Unknown scope channel '{key}'"))
                })
            })
            .collect()
    }

    /// Built-in parameter table merged with configured parameters.
    pub fn parameter_registry(&self) -> ParameterRegistry {
        ParameterRegistry::new(default_specs().into_iter().chain(self.parameters.clone()))
    }

    /// Protocol client options from the `[host]` section.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            handshake_timeout: self.host.handshake_timeout,
            request_timeout: self.host.request_timeout,
        }
    }

    /// Reader options from the `[driver]` and `[session]` sections.
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            poll_interval: self.driver.poll_interval,
            stop_timeout: self.session.stop_timeout,
        }
    }

    /// Step test plan using the configured hold, settle and pattern.
    pub fn step_plan(
        &self,
        parameter: impl Into<String>,
        baseline: f64,
        amplitude: f64,
        steps: u32,
    ) -> StepTestPlan {
        StepTestPlan::new(parameter, baseline, amplitude, steps, self.step_test.hold)
            .with_settle(self.step_test.settle)
            .with_pattern(self.step_test.pattern)
    }
}

fn invalid(message: impl Into<String>) -> CoreResult<()> {
    Err(CoreError::Configuration(message.into()))
}
