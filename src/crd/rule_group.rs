//! RuleGroup Custom Resource Definition
//!
//! A RuleGroup carries a rule file. It can be selected by any number of
//! MetricsServers; each of them records a binding in the RuleGroup status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::WorkloadBinding;
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "metrics.operator.dev",
    version = "v1",
    kind = "RuleGroup",
    namespaced,
    status = "RuleGroupStatus",
    shortname = "rg"
)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroupSpec {
    /// Rule file content (YAML)
    pub rules: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroupStatus {
    /// Workloads which select this RuleGroup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<WorkloadBinding>,
}

impl RuleGroupSpec {
    /// Checks that the rule file is a non-empty YAML mapping.
    pub fn validate(&self) -> Result<()> {
        if self.rules.trim().is_empty() {
            return Err(Error::ValidationError("rules must not be empty".to_string()));
        }

        match serde_yaml::from_str::<serde_yaml::Value>(&self.rules) {
            Ok(serde_yaml::Value::Mapping(_)) => Ok(()),
            Ok(_) => Err(Error::ValidationError(
                "rules must be a YAML mapping".to_string(),
            )),
            Err(e) => Err(Error::ValidationError(format!("invalid YAML: {e}"))),
        }
    }
}
