//! Kubernetes resource builders for MetricsServer
//!
//! Every MetricsServer gets one StatefulSet named after it, plus the
//! `<name>-rulefiles-<i>` Secrets holding the rule files of the RuleGroups it
//! selects. Both carry an owner reference so they're garbage collected with
//! the MetricsServer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{info, instrument};

use crate::crd::MetricsServer;
use crate::error::Result;

/// Annotation on the pod template tracking the number of rule-file shards
pub const RULE_SHARDS_ANNOTATION: &str = "metrics.operator.dev/rule-file-shards";

pub const RULES_VOLUME_NAME: &str = "rule-files";
pub const RULES_MOUNT_PATH: &str = "/etc/metrics/rules";
const WEB_PORT: i32 = 9090;

/// Writes generated StatefulSets.
#[async_trait]
pub trait StatefulSetClient: Send + Sync {
    /// Server-side applies `sts` with the operator's field manager.
    async fn apply(&self, sts: &StatefulSet) -> Result<()>;
}

/// Labels carried by every object generated for the MetricsServer
pub fn standard_labels(ms: &MetricsServer) -> BTreeMap<String, String> {
    let mut labels = selector_labels(ms);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "metrics-operator".to_string(),
    );
    labels
}

/// Subset of [`standard_labels`] used as the StatefulSet selector, which is
/// immutable.
pub fn selector_labels(ms: &MetricsServer) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "metrics-server".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), ms.name_any());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(ms: &MetricsServer) -> OwnerReference {
    OwnerReference {
        api_version: MetricsServer::api_version(&()).to_string(),
        kind: MetricsServer::kind(&()).to_string(),
        name: ms.name_any(),
        uid: ms.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Template of the rule-file shards: name prefix, labels and owner.
pub fn rule_files_secret_template(ms: &MetricsServer) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(ms.rule_files_secret_name()),
            namespace: ms.namespace(),
            labels: Some(standard_labels(ms)),
            owner_references: Some(vec![owner_reference(ms)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Builds the desired StatefulSet. `rule_files` is the projected volume of
/// the rule-file shards and `rule_shards` their count.
pub fn build_statefulset(ms: &MetricsServer, rule_files: Volume, rule_shards: u64) -> StatefulSet {
    let labels = standard_labels(ms);

    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(RULE_SHARDS_ANNOTATION.to_string(), rule_shards.to_string());

    let mut args = vec![format!("--rules.dir={RULES_MOUNT_PATH}")];
    args.extend(ms.spec.args.iter().cloned());

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(ms.statefulset_name()),
            namespace: ms.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(ms)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(ms.spec.replicas),
            service_name: ms.statefulset_name(),
            pod_management_policy: Some("OrderedReady".to_string()),
            selector: LabelSelector {
                match_labels: Some(selector_labels(ms)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "metrics-server".to_string(),
                        image: Some(ms.spec.image.clone()),
                        args: Some(args),
                        ports: Some(vec![ContainerPort {
                            name: Some("web".to_string()),
                            container_port: WEB_PORT,
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: RULES_VOLUME_NAME.to_string(),
                            mount_path: RULES_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![rule_files]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Ensure the StatefulSet matches the desired state
#[instrument(skip(client, sts), fields(name = %sts.name_any(), namespace = sts.namespace()))]
pub async fn ensure_statefulset(client: &dyn StatefulSetClient, sts: &StatefulSet) -> Result<()> {
    client.apply(sts).await?;
    info!("StatefulSet applied");
    Ok(())
}
