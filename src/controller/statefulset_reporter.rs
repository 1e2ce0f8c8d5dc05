//! Workload status derived from the pods of its StatefulSet

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::conditions::{CONDITION_TYPE_AVAILABLE, REASON_NO_POD_READY, REASON_SOME_PODS_NOT_READY};
use super::pods::{self, PodClient};
use super::selector::selector_to_string;
use crate::crd::{Condition, ConditionStatus, MetricsServer, MetricsServerStatus};
use crate::error::{Error, Result};

/// The object whose status summarises the StatefulSet's pods.
pub trait GoverningObject {
    fn generation(&self) -> i64;
    fn expected_replicas(&self) -> i32;
    fn set_replicas(&mut self, replicas: i32);
    fn set_updated_replicas(&mut self, replicas: i32);
    fn set_available_replicas(&mut self, replicas: i32);
    fn set_unavailable_replicas(&mut self, replicas: i32);
}

impl GoverningObject for MetricsServer {
    fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    fn expected_replicas(&self) -> i32 {
        self.spec.replicas
    }

    fn set_replicas(&mut self, replicas: i32) {
        self.status.get_or_insert_with(MetricsServerStatus::default).replicas = replicas;
    }

    fn set_updated_replicas(&mut self, replicas: i32) {
        self.status
            .get_or_insert_with(MetricsServerStatus::default)
            .updated_replicas = replicas;
    }

    fn set_available_replicas(&mut self, replicas: i32) {
        self.status
            .get_or_insert_with(MetricsServerStatus::default)
            .available_replicas = replicas;
    }

    fn set_unavailable_replicas(&mut self, replicas: i32) {
        self.status
            .get_or_insert_with(MetricsServerStatus::default)
            .unavailable_replicas = replicas;
    }
}

pub struct StatefulSetReporter<'a> {
    sts: &'a StatefulSet,
    /// Pods controlled by the StatefulSet
    pub pods: Vec<Pod>,
}

impl<'a> StatefulSetReporter<'a> {
    pub fn new(sts: &'a StatefulSet, pods: Vec<Pod>) -> Self {
        let name = sts.name_any();
        let pods = pods
            .into_iter()
            .filter(|p| pods::is_owned_by_statefulset(p, &name))
            .collect();
        Self { sts, pods }
    }

    /// Lists the StatefulSet's pods through its selector.
    pub async fn load(client: &dyn PodClient, sts: &'a StatefulSet) -> Result<Self> {
        let selector = sts
            .spec
            .as_ref()
            .map(|s| &s.selector)
            .ok_or_else(|| Error::ValidationError(format!("statefulset {} has no spec", sts.name_any())))?;
        let pods = client
            .list(&sts.namespace().unwrap_or_default(), &selector_to_string(selector)?)
            .await?;
        Ok(Self::new(sts, pods))
    }

    fn update_revision(&self) -> &str {
        self.sts
            .status
            .as_ref()
            .and_then(|s| s.update_revision.as_deref())
            .unwrap_or("")
    }

    pub fn is_updated(&self, pod: &Pod) -> bool {
        pods::revision(pod) == self.update_revision()
    }

    /// Pods running the StatefulSet's update revision.
    pub fn updated_pods(&self) -> Vec<&Pod> {
        self.pods.iter().filter(|p| self.is_updated(p)).collect()
    }

    pub fn ready_pods(&self) -> Vec<&Pod> {
        self.pods.iter().filter(|p| pods::is_ready(p)).collect()
    }

    /// Writes the replica counters on `obj` and returns its Available condition.
    pub fn update(&self, obj: &mut impl GoverningObject) -> Condition {
        let total = self.pods.len() as i32;
        let ready = self.ready_pods().len() as i32;
        let updated = self.updated_pods().len() as i32;

        obj.set_replicas(total);
        obj.set_updated_replicas(updated);
        obj.set_available_replicas(ready);
        obj.set_unavailable_replicas(total - ready);

        let (status, reason) = if ready >= obj.expected_replicas() {
            (ConditionStatus::True, "")
        } else if ready == 0 {
            (ConditionStatus::False, REASON_NO_POD_READY)
        } else {
            (ConditionStatus::Degraded, REASON_SOME_PODS_NOT_READY)
        };

        let message = self
            .pods
            .iter()
            .filter_map(|p| {
                let m = pods::message(p);
                (!m.is_empty()).then(|| format!("pod {}: {m}", p.name_any()))
            })
            .collect::<Vec<_>>()
            .join("\n");

        Condition::new(CONDITION_TYPE_AVAILABLE, status, reason, &message)
            .with_observed_generation(obj.generation())
    }
}
