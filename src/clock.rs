//! Clock domains.
//!
//! The protocol channel and the driver channel are timed by independent
//! monotonic clocks. Their timestamps are distinct types ([`ProtocolTime`] and
//! [`AcquisitionTime`]) so they cannot be compared by accident; a
//! [`ClockCalibration`] maps one domain onto the other.
//!
//! The protocol clock follows `tokio::time`, so it advances with the runtime's
//! (possibly paused) clock. The acquisition clock is read on the blocking
//! driver worker and follows `std::time::Instant`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Timestamp in the protocol (host command) clock domain, measured from the
/// session's protocol epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProtocolTime(Duration);

impl ProtocolTime {
    /// Timestamp `since_epoch` after the protocol epoch.
    pub fn from_duration(since_epoch: Duration) -> Self {
        Self(since_epoch)
    }

    /// Time elapsed since the protocol epoch.
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

/// Timestamp in the acquisition (driver) clock domain, measured from the
/// session's acquisition epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AcquisitionTime(Duration);

impl AcquisitionTime {
    /// Timestamp `since_epoch` after the acquisition epoch.
    pub fn from_duration(since_epoch: Duration) -> Self {
        Self(since_epoch)
    }

    /// Time elapsed since the acquisition epoch.
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

/// Monotonic clock stamping protocol acknowledgements.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolClock {
    epoch: tokio::time::Instant,
}

impl ProtocolClock {
    /// Clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }

    /// Current protocol timestamp.
    pub fn now(&self) -> ProtocolTime {
        ProtocolTime(self.epoch.elapsed())
    }
}

impl Default for ProtocolClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic clock stamping driver samples.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionClock {
    epoch: Instant,
}

impl AcquisitionClock {
    /// Clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current acquisition timestamp.
    pub fn now(&self) -> AcquisitionTime {
        AcquisitionTime(self.epoch.elapsed())
    }
}

impl Default for AcquisitionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset between the protocol and acquisition clock domains.
///
/// `acquisition = protocol + offset`, valid to within `uncertainty`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockCalibration {
    offset_ns: i128,
    uncertainty: Duration,
    measured_at: DateTime<Utc>,
}

impl ClockCalibration {
    /// Build a calibration from a reference event observed in both domains.
    pub fn from_reference(
        protocol: ProtocolTime,
        acquisition: AcquisitionTime,
        uncertainty: Duration,
    ) -> Self {
        Self {
            offset_ns: acquisition.0.as_nanos() as i128 - protocol.0.as_nanos() as i128,
            uncertainty,
            measured_at: Utc::now(),
        }
    }

    /// Measure the offset by bracketing one protocol clock reading between two
    /// acquisition clock readings. The bracket half-width is the uncertainty.
    pub fn measure(protocol: &ProtocolClock, acquisition: &AcquisitionClock) -> Self {
        let before = acquisition.now();
        let reference = protocol.now();
        let after = acquisition.now();

        let half_width = (after.0 - before.0) / 2;
        Self::from_reference(
            reference,
            AcquisitionTime(before.0 + half_width),
            half_width,
        )
    }

    /// Signed offset in nanoseconds (`acquisition - protocol`).
    pub fn offset_ns(&self) -> i128 {
        self.offset_ns
    }

    /// Half-width of the window the reference was taken in.
    pub fn uncertainty(&self) -> Duration {
        self.uncertainty
    }

    /// Wall-clock time of the calibration.
    pub fn measured_at(&self) -> DateTime<Utc> {
        self.measured_at
    }

    /// Map a protocol timestamp into the acquisition domain. Instants before
    /// the acquisition epoch saturate to zero.
    pub fn to_acquisition(&self, time: ProtocolTime) -> AcquisitionTime {
        AcquisitionTime(shift(time.0, self.offset_ns))
    }

    /// Map an acquisition timestamp into the protocol domain.
    pub fn to_protocol(&self, time: AcquisitionTime) -> ProtocolTime {
        ProtocolTime(shift(time.0, -self.offset_ns))
    }
}

fn shift(time: Duration, offset_ns: i128) -> Duration {
    let shifted = time.as_nanos() as i128 + offset_ns;
    if shifted <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(u64::try_from(shifted).unwrap_or(u64::MAX))
    }
}
