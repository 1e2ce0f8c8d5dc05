//! Repair of StatefulSet rollouts stuck on an orphaned revision
//!
//! With `podManagementPolicy: OrderedReady`, a pod created from a broken
//! revision blocks the rollout forever, even after the spec is fixed: the
//! StatefulSet controller waits for the pod to become ready before replacing
//! it. Depending on the workload's repair policy, such a pod is evicted or
//! deleted so the controller can recreate it from the current spec.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::pods::{self, PodClient};
use super::selector::selector_to_string;
use crate::crd::RepairPolicy;
use crate::error::{Error, Result};

/// What a single repair pass did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Repair disabled, or the StatefulSet spec isn't observed yet
    Skipped,
    /// No pod is stuck
    NothingToRepair,
    Evicted(String),
    Deleted(String),
}

/// Looks for a pod stuck on a revision which is neither the current nor the
/// update revision, and applies `policy` to the one with the highest
/// ordinal. At most one pod is touched per call.
#[instrument(skip(client, sts), fields(name = %sts.name_any(), namespace = ?sts.namespace()))]
pub async fn resolve_stuck_statefulset(
    client: &dyn PodClient,
    sts: &StatefulSet,
    policy: RepairPolicy,
) -> Result<RepairOutcome> {
    if policy == RepairPolicy::None {
        return Ok(RepairOutcome::Skipped);
    }

    let generation = sts.metadata.generation.unwrap_or(0);
    let status = sts.status.clone().unwrap_or_default();
    if status.observed_generation.unwrap_or(0) != generation {
        debug!("StatefulSet spec not yet observed, skipping repair");
        return Ok(RepairOutcome::Skipped);
    }

    let selector = sts
        .spec
        .as_ref()
        .map(|s| &s.selector)
        .ok_or_else(|| Error::ValidationError(format!("statefulset {} has no spec", sts.name_any())))?;
    let namespace = sts.namespace().unwrap_or_default();
    let mut candidates = client.list(&namespace, &selector_to_string(selector)?).await?;

    // Highest ordinal first; unparsable names sort as ordinal 0.
    candidates.sort_by_key(|p| std::cmp::Reverse(pods::ordinal(&p.name_any()).unwrap_or(0)));

    let current = status.current_revision.unwrap_or_default();
    let update = status.update_revision.unwrap_or_default();

    for pod in &candidates {
        if pods::has_ready_condition(pod) {
            continue;
        }

        let revision = pods::revision(pod);
        if revision == current || revision == update {
            continue;
        }

        let name = pod.name_any();
        let pod_namespace = pod.namespace().unwrap_or_else(|| namespace.clone());
        info!(
            pod = %name,
            revision,
            current_revision = %current,
            update_revision = %update,
            "Found stuck pod during rollout, repairing"
        );

        return match policy {
            RepairPolicy::Evict => {
                client.evict(&pod_namespace, &name).await?;
                Ok(RepairOutcome::Evicted(name))
            }
            RepairPolicy::Delete => {
                client.delete(&pod_namespace, &name).await?;
                Ok(RepairOutcome::Deleted(name))
            }
            RepairPolicy::None => Ok(RepairOutcome::Skipped),
        };
    }

    Ok(RepairOutcome::NothingToRepair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fakes::{FakePodClient, PodAction};
    use crate::controller::pods::test_pods::pod;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    fn sts(generation: i64, observed: i64) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("monitoring".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                selector: LabelSelector {
                    match_labels: Some([("app".to_string(), "main".to_string())].into()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(observed),
                current_revision: Some("current".to_string()),
                update_revision: Some("update".to_string()),
                ..Default::default()
            }),
        }
    }

    fn stuck_rollout() -> FakePodClient {
        FakePodClient::new(vec![
            pod("main", 0, "current", true),
            pod("main", 1, "orphan", false),
            pod("main", 2, "orphan", false),
            pod("main", 3, "update", false),
            pod("main", 4, "orphan", true),
        ])
    }

    #[tokio::test]
    async fn test_policy_none_is_noop() {
        let client = stuck_rollout();
        let outcome = resolve_stuck_statefulset(&client, &sts(2, 2), RepairPolicy::None)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Skipped);
        assert!(client.actions().is_empty());
        assert_eq!(client.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_unobserved_spec_is_skipped() {
        let client = stuck_rollout();
        let outcome = resolve_stuck_statefulset(&client, &sts(3, 2), RepairPolicy::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Skipped);
        assert!(client.actions().is_empty());
    }

    #[tokio::test]
    async fn test_repairs_one_pod_per_call_highest_ordinal_first() {
        let client = stuck_rollout();
        let sts = sts(2, 2);

        let outcome = resolve_stuck_statefulset(&client, &sts, RepairPolicy::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Deleted("main-2".to_string()));
        assert_eq!(client.actions(), vec![PodAction::Delete("main-2".to_string())]);

        let outcome = resolve_stuck_statefulset(&client, &sts, RepairPolicy::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Deleted("main-1".to_string()));

        let outcome = resolve_stuck_statefulset(&client, &sts, RepairPolicy::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::NothingToRepair);
        assert_eq!(client.actions().len(), 2);
    }

    #[tokio::test]
    async fn test_evict_policy() {
        let client = stuck_rollout();
        let outcome = resolve_stuck_statefulset(&client, &sts(2, 2), RepairPolicy::Evict)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Evicted("main-2".to_string()));
        assert_eq!(client.actions(), vec![PodAction::Evict("main-2".to_string())]);
    }
}
