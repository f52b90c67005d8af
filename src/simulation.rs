//! Simulated NC-AFM instrument.
//!
//! One [`MockInstrument`] is shared by the mock host ([`crate::protocol::MockHost`])
//! and the mock scope device ([`crate::driver::MockScopeDevice`]), so a
//! parameter written over the protocol channel shows up on the driver channel
//! the way it would on the real instrument. Used for offline mode and tests.
//!
//! Physics is deliberately crude: the oscillation amplitude follows the
//! amplitude setpoint with a first-order lag, drive and frequency echo their
//! DNC parameters, and topography drifts slowly while the Z feedback is
//! enabled. With feedback disabled, topography holds whatever was last
//! written to its DAC. Values are in physical units;
//! the scope device converts them to driver counts.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::parameter::ParameterAddress;

/// Time constant of the amplitude loop response.
const AMPLITUDE_TAU: Duration = Duration::from_millis(20);

/// Shared, cloneable handle to the simulated instrument state.
#[derive(Clone)]
pub struct MockInstrument {
    inner: Arc<Mutex<InstrumentState>>,
}

struct InstrumentState {
    values: HashMap<String, f64>,
    amplitude: f64,
    amplitude_updated: Instant,
    epoch: Instant,
    /// Last value written to the topography DAC, nm.
    topo_hold: Option<f64>,
}

impl MockInstrument {
    /// Instrument with the loop parked at typical operating values.
    pub fn new() -> Self {
        let values = [
            (ParameterAddress::ScanPara("Edit23".into()), 0.08),
            (ParameterAddress::ScanPara("Edit24".into()), 0.1),
            (ParameterAddress::ScanPara("Edit32".into()), 0.05),
            (ParameterAddress::ScanPara("Edit27".into()), 1.0),
            (ParameterAddress::ScanPara("Edit22".into()), 0.5),
            (ParameterAddress::DncPara(3), 32_768.0),
            (ParameterAddress::DncPara(4), 0.3),
            (ParameterAddress::FeedPara("enable".into()), 1.0),
        ]
        .into_iter()
        .map(|(address, value)| (address.key(), value))
        .collect();

        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(InstrumentState {
                values,
                amplitude: 0.08,
                amplitude_updated: now,
                epoch: now,
                topo_hold: None,
            })),
        }
    }

    /// Current value of a parameter, `None` if the instrument has no such
    /// parameter.
    pub fn read(&self, address: &ParameterAddress) -> Option<f64> {
        self.inner.lock().values.get(&address.key()).copied()
    }

    /// Write a parameter. Unknown scan/feed items are created, like the host
    /// accepting any edit field.
    pub fn write(&self, address: &ParameterAddress, value: f64) {
        let mut state = self.inner.lock();
        if *address == ParameterAddress::ScanPara("Edit23".into()) {
            // Settle the lag up to now so the new setpoint starts from the
            // current amplitude.
            state.advance_amplitude(Instant::now());
        }
        state.values.insert(address.key(), value);
    }

    /// Drive an output channel to `value` (physical units). Only the
    /// topography DAC reacts, and only while the Z feedback is disabled.
    pub fn write_output(&self, index: i32, value: f64) {
        if index == 0 {
            self.inner.lock().topo_hold = Some(value);
        }
    }

    /// Value of the simulated `FeedPara('enable')`.
    pub fn feedback_enabled(&self) -> bool {
        self.inner.lock().feedback_enabled()
    }

    /// Physical value of a channel right now.
    pub fn channel(&self, index: i32) -> f64 {
        let mut state = self.inner.lock();
        let now = Instant::now();
        state.advance_amplitude(now);
        let t = now.duration_since(state.epoch).as_secs_f64();

        match index {
            // Topo, nm
            0 => match state.topo_hold {
                Some(held) if !state.feedback_enabled() => held,
                _ => 2.0 * (0.5 * t).sin(),
            },
            // Frequency: used frequency
            -9 => state.value(&ParameterAddress::DncPara(3)),
            // Drive
            -10 => state.value(&ParameterAddress::DncPara(4)),
            // QPlusAmpl
            -12 => state.amplitude,
            // Phase, degrees
            -13 => 90.0 + 0.5 * (2.0 * t).sin(),
            // df, Hz
            -40 => -5.0 + 0.2 * (0.3 * t).sin(),
            // Zeit, s
            23 => t,
            _ => 0.0,
        }
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentState {
    fn feedback_enabled(&self) -> bool {
        self.value(&ParameterAddress::FeedPara("enable".into())) != 0.0
    }

    fn value(&self, address: &ParameterAddress) -> f64 {
        self.values.get(&address.key()).copied().unwrap_or(0.0)
    }

    fn advance_amplitude(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.amplitude_updated);
        let setpoint = self.value(&ParameterAddress::ScanPara("Edit23".into()));
        let alpha = 1.0 - (-dt.as_secs_f64() / AMPLITUDE_TAU.as_secs_f64()).exp();
        self.amplitude += (setpoint - self.amplitude) * alpha;
        self.amplitude_updated = now;
    }
}
