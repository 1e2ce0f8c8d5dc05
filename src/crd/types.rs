//! Shared types for the metrics operator CRDs

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Condition status values.
///
/// `Degraded` is used by the Available condition when some, but not all,
/// replicas are ready.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Degraded,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Degraded => "Degraded",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Kubernetes-style status condition
///
/// Used both in workload status (Available, Reconciled) and in the per-binding
/// condition lists stored on configuration resources (Accepted).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. "Available", "Reconciled", "Accepted")
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// Last time the condition transitioned (RFC 3339)
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The .metadata.generation that the condition was set based upon
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: 0,
        }
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Records that a workload selects a configuration resource.
///
/// Stored in the configuration resource's status and uniquely identified by
/// (namespace, name, group, resource).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadBinding {
    pub namespace: String,
    pub name: String,
    pub group: String,
    /// Plural resource name of the workload (e.g. "metricsservers")
    pub resource: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Remedy applied to pods stuck on an orphaned revision during a rollout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RepairPolicy {
    #[default]
    None,
    Evict,
    Delete,
}

impl fmt::Display for RepairPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairPolicy::None => write!(f, "none"),
            RepairPolicy::Evict => write!(f, "evict"),
            RepairPolicy::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for RepairPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(RepairPolicy::None),
            "evict" => Ok(RepairPolicy::Evict),
            "delete" => Ok(RepairPolicy::Delete),
            other => Err(Error::ConfigError(format!(
                "unknown repair policy {other:?} (expected none, evict or delete)"
            ))),
        }
    }
}
