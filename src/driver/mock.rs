//! Simulated scope device.
//!
//! Reads channel values from the shared [`MockInstrument`], converts them to
//! counts with the channel table's scale factor and adds seeded noise. Writes
//! to the topography DAC go back into the instrument. A read failure can be
//! scheduled to exercise stream termination.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{channel_info, ChannelId, DriverDevice, CHANNEL_TABLE};
use crate::error::{DriverError, DriverErrorKind};
use crate::simulation::MockInstrument;

const DEVICE_NAME: &str = "mock-scope";

/// Behavior of the simulated scope device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockScopeConfig {
    /// RNG seed; random when absent.
    pub seed: Option<u64>,
    /// Peak noise in driver counts.
    pub noise_counts: f64,
    /// Fail every read after this many successful ones.
    pub fail_after_reads: Option<u64>,
}

impl Default for MockScopeConfig {
    fn default() -> Self {
        Self {
            seed: None,
            noise_counts: 50.0,
            fail_after_reads: None,
        }
    }
}

/// Scope device reading channels off a [`MockInstrument`].
///
/// Values are converted to counts through the channel table's scale, plus
/// uniform noise.
pub struct MockScopeDevice {
    instrument: MockInstrument,
    rng: StdRng,
    noise_counts: f64,
    fail_after_reads: Option<u64>,
    reads: u64,
}

impl MockScopeDevice {
    /// Device over `instrument`, seeded from `config`.
    pub fn new(instrument: MockInstrument, config: &MockScopeConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            instrument,
            rng,
            noise_counts: config.noise_counts.abs(),
            fail_after_reads: config.fail_after_reads,
            reads: 0,
        }
    }
}

impl DriverDevice for MockScopeDevice {
    fn read_raw(&mut self, channel: ChannelId) -> Result<i32, DriverError> {
        let info = channel_info(channel).ok_or_else(|| {
            DriverError::new(
                DEVICE_NAME,
                DriverErrorKind::InvalidChannel,
                format!("unknown channel {channel}"),
            )
        })?;

        if self.fail_after_reads.is_some_and(|limit| self.reads >= limit) {
            return Err(DriverError::new(
                DEVICE_NAME,
                DriverErrorKind::Transfer,
                format!("simulated transfer failure on channel {channel}"),
            ));
        }
        self.reads += 1;

        let mut counts = self.instrument.channel(channel) / info.scale;
        if self.noise_counts > 0.0 {
            counts += self.rng.gen_range(-self.noise_counts..=self.noise_counts);
        }
        Ok(counts.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    fn write_raw(&mut self, write_index: i32, counts: i32) -> Result<(), DriverError> {
        let info = CHANNEL_TABLE
            .iter()
            .find(|info| info.write_index() == Some(write_index))
            .ok_or_else(|| {
                DriverError::new(
                    DEVICE_NAME,
                    DriverErrorKind::InvalidChannel,
                    format!("no writable output at index {write_index}"),
                )
            })?;
        self.instrument
            .write_output(info.index, f64::from(counts) * info.scale);
        Ok(())
    }

    fn describe(&self) -> String {
        DEVICE_NAME.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterAddress;

    fn quiet() -> MockScopeConfig {
        MockScopeConfig {
            seed: Some(7),
            noise_counts: 0.0,
            fail_after_reads: None,
        }
    }

    #[test]
    fn drive_counts_follow_dnc_parameter() {
        let instrument = MockInstrument::new();
        instrument.write(&ParameterAddress::DncPara(4), 0.5);
        let mut device = MockScopeDevice::new(instrument, &quiet());

        let raw = device.read_raw(-10).unwrap();
        let expected = (0.5 / 4.97789e-09_f64).round() as i32;
        assert_eq!(raw, expected);
    }

    #[test]
    fn topography_write_reads_back_with_feedback_off() {
        let instrument = MockInstrument::new();
        instrument.write(&ParameterAddress::FeedPara("enable".into()), 0.0);
        let mut device = MockScopeDevice::new(instrument, &quiet());

        device.write_raw(0, -40_000).unwrap();
        assert_eq!(device.read_raw(0).unwrap(), -40_000);

        let err = device.write_raw(-10, 5).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidChannel);
    }

    #[test]
    fn unknown_channel_is_invalid() {
        let mut device = MockScopeDevice::new(MockInstrument::new(), &quiet());
        let err = device.read_raw(99).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidChannel);
    }

    #[test]
    fn scheduled_failure_is_sticky() {
        let config = MockScopeConfig {
            fail_after_reads: Some(2),
            ..quiet()
        };
        let mut device = MockScopeDevice::new(MockInstrument::new(), &config);

        assert!(device.read_raw(-12).is_ok());
        assert!(device.read_raw(-12).is_ok());
        assert_eq!(device.read_raw(-12).unwrap_err().kind, DriverErrorKind::Transfer);
        assert!(device.read_raw(-12).is_err());
    }

    #[test]
    fn seeded_noise_is_bounded() {
        let config = MockScopeConfig {
            seed: Some(1),
            noise_counts: 10.0,
            fail_after_reads: None,
        };
        let instrument = MockInstrument::new();
        let mut device = MockScopeDevice::new(instrument.clone(), &config);

        for _ in 0..100 {
            let raw = device.read_raw(-10).unwrap() as f64;
            let clean = (instrument.channel(-10) / 4.97789e-09).round();
            assert!((raw - clean).abs() <= 11.0);
        }
    }
}
