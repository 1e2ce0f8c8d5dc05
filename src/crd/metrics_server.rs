//! MetricsServer Custom Resource Definition
//!
//! A MetricsServer is the workload managed by the operator. Each instance owns
//! one generated StatefulSet and a set of sharded Secrets holding the rule
//! files of the RuleGroups it selects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, RepairPolicy};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "metrics.operator.dev",
    version = "v1",
    kind = "MetricsServer",
    namespaced,
    status = "MetricsServerStatus",
    shortname = "msrv",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type=='Available')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricsServerSpec {
    /// Container image of the server
    pub image: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Extra command-line arguments passed verbatim to the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Selects the RuleGroups (in the same namespace) loaded by the server.
    /// No selector means no rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub rule_selector: Option<LabelSelector>,

    /// What to do with pods stuck on an orphaned revision during a rollout
    #[serde(default)]
    pub repair_policy: RepairPolicy,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsServerStatus {
    /// Total number of pods owned by the generated StatefulSet
    #[serde(default)]
    pub replicas: i32,
    /// Pods running the StatefulSet's update revision
    #[serde(default)]
    pub updated_replicas: i32,
    /// Ready pods
    #[serde(default)]
    pub available_replicas: i32,
    /// Pods which aren't ready
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Available and Reconciled conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MetricsServer {
    /// Name of the generated StatefulSet
    pub fn statefulset_name(&self) -> String {
        kube::ResourceExt::name_any(self)
    }

    /// Name prefix of the sharded rule-file secrets
    pub fn rule_files_secret_name(&self) -> String {
        format!("{}-rulefiles", kube::ResourceExt::name_any(self))
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
