//! Operator configuration
//!
//! Everything the controllers need to know about how they were started is
//! carried by [`OperatorConfig`], built once in `main` and passed down.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Field manager used for every write issued by the operator
pub const FIELD_MANAGER: &str = "metrics-operator";

/// Annotation selecting which operator instance handles an object
pub const CONTROLLER_ID_ANNOTATION: &str = "operator.metrics.operator.dev/controller-id";

/// Finalizer guarding the removal of workload bindings on deletion
pub const STATUS_CLEANUP_FINALIZER: &str = "metrics.operator.dev/status-cleanup";

/// Enables the status subresource of configuration resources (bindings)
/// and the status-cleanup finalizer on workloads.
pub const STATUS_FOR_CONFIGURATION_RESOURCES: &str = "StatusForConfigurationResources";

#[derive(Clone, Debug)]
struct FeatureGate {
    description: &'static str,
    enabled: bool,
}

/// Set of known feature gates and their current values.
#[derive(Clone, Debug)]
pub struct FeatureGates {
    gates: BTreeMap<&'static str, FeatureGate>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        let mut gates = BTreeMap::new();
        gates.insert(
            STATUS_FOR_CONFIGURATION_RESOURCES,
            FeatureGate {
                description: "Report workload bindings in the status of configuration resources",
                enabled: false,
            },
        );
        Self { gates }
    }
}

impl FeatureGates {
    pub fn enabled(&self, name: &str) -> bool {
        self.gates.get(name).map(|g| g.enabled).unwrap_or(false)
    }

    /// Merges user-provided values. Unknown gates are rejected.
    pub fn update(&mut self, flags: &BTreeMap<String, bool>) -> Result<()> {
        for (name, value) in flags {
            let supported = self.to_string();
            let gate = self.gates.get_mut(name.as_str()).ok_or_else(|| {
                Error::ConfigError(format!(
                    "feature gate {name:?} is unknown (supported feature gates: {supported})"
                ))
            })?;
            gate.enabled = *value;
        }
        Ok(())
    }

    /// Parses a `name=bool,name=bool` list on top of the defaults.
    pub fn parse(s: &str) -> Result<Self> {
        let mut flags = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                Error::ConfigError(format!("invalid feature gate {pair:?}, expected name=bool"))
            })?;
            let value: bool = value.trim().parse().map_err(|_| {
                Error::ConfigError(format!("invalid value for feature gate {name:?}: {value:?}"))
            })?;
            flags.insert(name.trim().to_string(), value);
        }

        let mut gates = Self::default();
        gates.update(&flags)?;
        Ok(gates)
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.gates
            .iter()
            .map(|(name, g)| format!("{name}: {} (enabled: {})", g.description, g.enabled))
            .collect()
    }

    /// (name, enabled) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.gates.iter().map(|(name, g)| (*name, g.enabled))
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .iter()
            .map(|(name, enabled)| format!("{name}={enabled}"))
            .collect();
        f.write_str(&pairs.join(","))
    }
}

/// Runtime configuration of the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Only objects annotated with this controller id are handled
    pub controller_id: String,
    pub feature_gates: FeatureGates,
    /// Period of the sweep refreshing the status of unavailable workloads
    pub status_poll_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            controller_id: String::new(),
            feature_gates: FeatureGates::default(),
            status_poll_interval: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    pub fn config_resources_status_enabled(&self) -> bool {
        self.feature_gates.enabled(STATUS_FOR_CONFIGURATION_RESOURCES)
    }
}
