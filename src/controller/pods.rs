//! Pod access and pod state helpers shared by the StatefulSet reporter and
//! the rollout repair.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::error::Result;

/// Label set by the StatefulSet controller to the revision a pod was created from
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

#[async_trait]
pub trait PodClient: Send + Sync {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Requests an eviction, honouring pod disruption budgets.
    async fn evict(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes the pod with background propagation.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

fn condition_status<'a>(pod: &'a Pod, type_: &str) -> Option<&'a str> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

/// True when the pod has a Ready condition set to True.
pub fn has_ready_condition(pod: &Pod) -> bool {
    condition_status(pod, "Ready") == Some("True")
}

/// True when the pod is running and ready.
pub fn is_ready(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running");
    running && has_ready_condition(pod)
}

/// Message of the first unmet pod condition, checked in the order
/// Scheduled, Initialized, ContainersReady, Ready. Empty when none is False.
pub fn message(pod: &Pod) -> String {
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    ["PodScheduled", "Initialized", "ContainersReady", "Ready"]
        .iter()
        .find_map(|type_| {
            conditions
                .iter()
                .find(|c| c.type_ == *type_ && c.status == "False")
        })
        .map(|c| c.message.clone().unwrap_or_default())
        .unwrap_or_default()
}

/// Revision the pod was created from, or "" when unknown.
pub fn revision(pod: &Pod) -> &str {
    pod.labels()
        .get(CONTROLLER_REVISION_HASH_LABEL)
        .map(String::as_str)
        .unwrap_or("")
}

/// Ordinal of a StatefulSet pod: the integer after the last `-` of its name.
pub fn ordinal(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// True when the pod is controlled by the named StatefulSet.
pub fn is_owned_by_statefulset(pod: &Pod, statefulset: &str) -> bool {
    pod.owner_references()
        .iter()
        .any(|o| o.kind == "StatefulSet" && o.name == statefulset)
}
