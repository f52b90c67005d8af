//! Parameter handles for host-resident tunables.
//!
//! A [`ParameterHandle`] names one tunable inside the host control software
//! (a PID gain, a setpoint) and caches the last value the core saw for it.
//! Handles are created on first reference from the session's
//! [`ParameterRegistry`] and live as long as the session; they are never
//! destroyed independently.
//!
//! The cache is a `watch` channel, so a consumer can follow a parameter
//! without polling:
//!
//! ```rust,ignore
//! let handle = registry.handle("amp_ref")?;
//! let mut rx = handle.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("amp_ref is now {:?}", *rx.borrow());
//!     }
//! });
//! ```
//!
//! The core does not interpret parameter values. `unit` and `guarded` are
//! advisory metadata for the consumer (the tuning GUI asks for confirmation
//! before writing more than ±10 V to a guarded parameter).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Where a parameter lives inside the host software.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterAddress {
    /// Scan parameter addressed by its edit-field code, e.g. `Edit23`.
    ScanPara(String),
    /// Feedback parameter addressed by item name.
    FeedPara(String),
    /// DNC (dynamic non-contact) parameter addressed by index. Write-only on
    /// the host.
    DncPara(u32),
}

impl ParameterAddress {
    /// Whether the host can report the current value of this parameter.
    pub fn is_readable(&self) -> bool {
        !matches!(self, ParameterAddress::DncPara(_))
    }

    /// Stable key used by the simulated instrument.
    pub fn key(&self) -> String {
        match self {
            ParameterAddress::ScanPara(code) => format!("EDIT:{code}"),
            ParameterAddress::FeedPara(item) => format!("FEED:{item}"),
            ParameterAddress::DncPara(index) => format!("DNC:{index}"),
        }
    }
}

impl std::fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterAddress::ScanPara(code) => write!(f, "{code}"),
            ParameterAddress::FeedPara(item) => write!(f, "Feed:{item}"),
            ParameterAddress::DncPara(index) => write!(f, "DNC{index}"),
        }
    }
}

/// Static description of a tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Unique name within a session (e.g. `amp_ref`).
    pub name: String,
    /// Where the host software keeps the value.
    pub address: ParameterAddress,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    /// Advisory unit of measurement.
    #[serde(default)]
    pub unit: Option<String>,
    /// Advisory: the consumer should confirm large values before writing.
    #[serde(default)]
    pub guarded: bool,
}

impl ParameterSpec {
    /// Unguarded spec labelled with its own name.
    pub fn new(name: impl Into<String>, address: ParameterAddress) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            address,
            unit: None,
            guarded: false,
        }
    }

    /// Set the human-readable label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the advisory unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Mark the parameter as needing confirmation.
    pub fn guarded(mut self) -> Self {
        self.guarded = true;
        self
    }
}

/// The NC-AFM loop parameters exposed by the SXM remote interface.
pub fn default_specs() -> Vec<ParameterSpec> {
    use ParameterAddress::{DncPara, FeedPara, ScanPara};

    vec![
        ParameterSpec::new("amp_ref", ScanPara("Edit23".into()))
            .with_label("Amplitude Ref")
            .with_unit("V")
            .guarded(),
        ParameterSpec::new("amp_ki", ScanPara("Edit24".into())).with_label("Amplitude Ki"),
        ParameterSpec::new("amp_kp", ScanPara("Edit32".into())).with_label("Amplitude Kp"),
        ParameterSpec::new("pll_kp", ScanPara("Edit27".into())).with_label("PLL Kp"),
        ParameterSpec::new("pll_ki", ScanPara("Edit22".into())).with_label("PLL Ki"),
        ParameterSpec::new("used_freq", DncPara(3))
            .with_label("Used Frequency (f0)")
            .with_unit("Hz"),
        ParameterSpec::new("drive", DncPara(4))
            .with_label("Drive")
            .with_unit("V")
            .guarded(),
        // 1 closes the Z feedback loop; 0 opens it so Z can be held through
        // the topography DAC.
        ParameterSpec::new("feedback_enable", FeedPara("enable".into()))
            .with_label("Z Feedback Enable")
            .guarded(),
    ]
}

// =============================================================================
// ParameterHandle
// =============================================================================

/// Session-scoped handle to one host parameter.
#[derive(Clone)]
pub struct ParameterHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    spec: ParameterSpec,
    last_known: watch::Sender<Option<f64>>,
}

impl ParameterHandle {
    fn new(spec: ParameterSpec) -> Self {
        let (last_known, _) = watch::channel(None);
        Self {
            inner: Arc::new(HandleInner { spec, last_known }),
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Advisory unit, if any.
    pub fn unit(&self) -> Option<&str> {
        self.inner.spec.unit.as_deref()
    }

    /// Host address of the parameter.
    pub fn address(&self) -> &ParameterAddress {
        &self.inner.spec.address
    }

    /// The spec this handle was created from.
    pub fn spec(&self) -> &ParameterSpec {
        &self.inner.spec
    }

    /// Last value read from or acknowledged by the host in this session.
    pub fn last_known(&self) -> Option<f64> {
        *self.inner.last_known.borrow()
    }

    /// Follow the cached value.
    pub fn subscribe(&self) -> watch::Receiver<Option<f64>> {
        self.inner.last_known.subscribe()
    }

    pub(crate) fn record(&self, value: f64) {
        self.inner.last_known.send_replace(Some(value));
    }
}

impl std::fmt::Debug for ParameterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterHandle")
            .field("name", &self.name())
            .field("address", self.address())
            .field("last_known", &self.last_known())
            .finish()
    }
}

/// Point-in-time view of a parameter for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSnapshot {
    /// Parameter name.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Host address.
    pub address: ParameterAddress,
    /// Advisory unit.
    pub unit: Option<String>,
    /// Whether writes should be confirmed.
    pub guarded: bool,
    /// Cached value, `None` before the first read or write.
    pub last_known: Option<f64>,
}

// =============================================================================
// ParameterRegistry
// =============================================================================

/// Known parameter specs plus the handles created so far in this session.
pub struct ParameterRegistry {
    specs: Vec<ParameterSpec>,
    handles: RwLock<HashMap<String, ParameterHandle>>,
}

impl ParameterRegistry {
    /// Registry over the given specs. Later specs replace earlier ones with the
    /// same name, so configured parameters can override the defaults.
    pub fn new(specs: impl IntoIterator<Item = ParameterSpec>) -> Self {
        let mut merged: Vec<ParameterSpec> = Vec::new();
        for spec in specs {
            match merged.iter_mut().find(|existing| existing.name == spec.name) {
                Some(existing) => *existing = spec,
                None => merged.push(spec),
            }
        }
        Self {
            specs: merged,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Registry over the built-in parameter table.
    pub fn with_defaults() -> Self {
        Self::new(default_specs())
    }

    /// Spec registered under `name`.
    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    /// All registered specs, in registration order.
    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    /// Handle for `name`, created on first reference. `None` if the name is
    /// not a known parameter.
    pub fn handle(&self, name: &str) -> Option<ParameterHandle> {
        if let Some(handle) = self.handles.read().get(name) {
            return Some(handle.clone());
        }
        let spec = self.spec(name)?.clone();
        let mut handles = self.handles.write();
        Some(
            handles
                .entry(spec.name.clone())
                .or_insert_with(|| ParameterHandle::new(spec))
                .clone(),
        )
    }

    /// All known parameters in declaration order, with cached values.
    pub fn snapshot(&self) -> Vec<ParameterSnapshot> {
        let handles = self.handles.read();
        self.specs
            .iter()
            .map(|spec| ParameterSnapshot {
                name: spec.name.clone(),
                label: spec.label.clone(),
                address: spec.address.clone(),
                unit: spec.unit.clone(),
                guarded: spec.guarded,
                last_known: handles.get(&spec.name).and_then(|h| h.last_known()),
            })
            .collect()
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_created_once_and_shared() {
        let registry = ParameterRegistry::with_defaults();

        let first = registry.handle("amp_ref").unwrap();
        first.record(0.08);

        let second = registry.handle("amp_ref").unwrap();
        assert_eq!(second.last_known(), Some(0.08));
        assert_eq!(second.address(), &ParameterAddress::ScanPara("Edit23".into()));
        assert!(registry.handle("does_not_exist").is_none());
    }

    #[test]
    fn configured_spec_overrides_default() {
        let registry = ParameterRegistry::new(
            default_specs()
                .into_iter()
                .chain([ParameterSpec::new("drive", ParameterAddress::DncPara(5))]),
        );

        assert_eq!(registry.specs().len(), default_specs().len());
        assert_eq!(
            registry.spec("drive").map(|s| &s.address),
            Some(&ParameterAddress::DncPara(5))
        );
    }

    #[test]
    fn dnc_parameters_are_write_only() {
        assert!(!ParameterAddress::DncPara(3).is_readable());
        assert!(ParameterAddress::ScanPara("Edit24".into()).is_readable());
        assert!(ParameterAddress::FeedPara("Ki".into()).is_readable());
    }

    #[test]
    fn snapshot_reports_cached_values() {
        let registry = ParameterRegistry::with_defaults();
        registry.handle("pll_kp").unwrap().record(1.5);

        let snapshot = registry.snapshot();
        let pll = snapshot.iter().find(|p| p.name == "pll_kp").unwrap();
        let drive = snapshot.iter().find(|p| p.name == "drive").unwrap();

        assert_eq!(pll.last_known, Some(1.5));
        assert_eq!(drive.last_known, None);
        assert!(drive.guarded);
    }

    #[tokio::test]
    async fn subscribers_see_recorded_values() {
        let registry = ParameterRegistry::with_defaults();
        let handle = registry.handle("amp_ki").unwrap();
        let mut rx = handle.subscribe();

        handle.record(0.25);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(0.25));
    }

    #[test]
    fn address_deserializes_from_inline_table() {
        let spec: ParameterSpec = toml::from_str(
            r#"
            name = "z_gain"
            address = { scan_para = "Edit40" }
            unit = "nm/V"
            "#,
        )
        .unwrap();

        assert_eq!(spec.address, ParameterAddress::ScanPara("Edit40".into()));
        assert_eq!(spec.unit.as_deref(), Some("nm/V"));
        assert!(!spec.guarded);
    }
}
