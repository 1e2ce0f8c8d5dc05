//! Drives the reconciliation engine from watcher events, the way the
//! operator wires it, with an in-memory syncer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use metrics_operator::controller::event_source::Informer;
use metrics_operator::controller::{ReconcileKey, ResourceReconciler, Syncer};
use metrics_operator::crd::{MetricsServer, MetricsServerSpec};
use metrics_operator::{Error, Result};

#[derive(Default)]
struct MemorySyncer {
    syncs: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
    invalid: Mutex<bool>,
    reported: Mutex<Vec<String>>,
}

impl MemorySyncer {
    fn syncs(&self) -> Vec<String> {
        self.syncs.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Syncer for MemorySyncer {
    async fn sync(&self, key: &str) -> Result<()> {
        self.syncs.lock().unwrap().push(key.to_string());
        if *self.invalid.lock().unwrap() {
            return Err(Error::ValidationError("replicas must be positive".to_string()));
        }
        Ok(())
    }

    async fn update_status(&self, key: &str) -> Result<()> {
        self.statuses.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn resolve(&self, sts: &StatefulSet) -> Option<ReconcileKey> {
        let owner = sts
            .owner_references()
            .iter()
            .find(|o| o.controller == Some(true) && o.kind == "MetricsServer")?;
        Some(format!("{}/{}", sts.namespace()?, owner.name))
    }

    async fn report_terminal_error(&self, key: &str, _err: &Error) -> Result<()> {
        self.reported.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

fn server(resource_version: &str, generation: i64) -> MetricsServer {
    let mut ms = MetricsServer::new(
        "main",
        MetricsServerSpec {
            image: "metrics:latest".to_string(),
            replicas: 2,
            args: vec![],
            rule_selector: None,
            repair_policy: Default::default(),
        },
    );
    ms.metadata.namespace = Some("monitoring".to_string());
    ms.metadata.uid = Some("uid-main".to_string());
    ms.metadata.resource_version = Some(resource_version.to_string());
    ms.metadata.generation = Some(generation);
    ms
}

fn statefulset(resource_version: &str, ready_replicas: i32) -> StatefulSet {
    let mut sts = StatefulSet::default();
    sts.metadata.name = Some("metrics-server-main".to_string());
    sts.metadata.namespace = Some("monitoring".to_string());
    sts.metadata.resource_version = Some(resource_version.to_string());
    sts.metadata.generation = Some(1);
    sts.metadata.labels = Some(BTreeMap::from([(
        "app.kubernetes.io/instance".to_string(),
        "main".to_string(),
    )]));
    sts.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "metrics.operator.dev/v1".to_string(),
        kind: "MetricsServer".to_string(),
        name: "main".to_string(),
        uid: "uid-main".to_string(),
        controller: Some(true),
        ..Default::default()
    }]);
    sts.status = Some(StatefulSetStatus {
        ready_replicas: Some(ready_replicas),
        ..Default::default()
    });
    sts
}

struct Harness {
    syncer: Arc<MemorySyncer>,
    reconciler: Arc<ResourceReconciler>,
    servers: Arc<Informer<MetricsServer>>,
    statefulsets: Arc<Informer<StatefulSet>>,
}

impl Harness {
    fn new() -> Self {
        let syncer = Arc::new(MemorySyncer::default());
        let reconciler = ResourceReconciler::new("MetricsServer", "", syncer.clone());

        let servers = Informer::<MetricsServer>::new("MetricsServer");
        let statefulsets = Informer::<StatefulSet>::new("StatefulSet");
        servers.add_event_handler(Arc::new(reconciler.workload_handler()));
        statefulsets.add_event_handler(Arc::new(reconciler.statefulset_handler()));

        Self {
            syncer,
            reconciler,
            servers,
            statefulsets,
        }
    }

    /// Waits until both queues are drained and idle.
    async fn settle(&self) {
        for _ in 0..200 {
            if self.reconciler.reconcile_queue().is_empty() && self.reconciler.status_queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if self.reconciler.reconcile_queue().is_empty() && self.reconciler.status_queue().is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queues did not drain");
    }
}

#[tokio::test]
async fn test_new_workload_is_synced_then_status_refreshed() {
    let h = Harness::new();
    h.reconciler.run();

    h.servers.handle(Event::Apply(server("1", 1)));
    h.settle().await;

    assert_eq!(h.syncer.syncs(), vec!["monitoring/main"]);
    assert_eq!(h.syncer.statuses(), vec!["monitoring/main"]);

    h.reconciler.stop().await;
}

#[tokio::test]
async fn test_pods_becoming_ready_only_refresh_status() {
    let h = Harness::new();
    h.reconciler.run();

    h.servers.handle(Event::Apply(server("1", 1)));
    h.statefulsets.handle(Event::Apply(statefulset("10", 0)));
    h.settle().await;
    let syncs_before = h.syncer.syncs().len();
    let statuses_before = h.syncer.statuses().len();

    // Only the StatefulSet status moves.
    h.statefulsets.handle(Event::Apply(statefulset("11", 2)));
    h.settle().await;

    assert_eq!(h.syncer.syncs().len(), syncs_before);
    assert_eq!(h.syncer.statuses().len(), statuses_before + 1);

    h.reconciler.stop().await;
}

#[tokio::test]
async fn test_status_only_workload_update_is_ignored() {
    let h = Harness::new();
    h.reconciler.run();

    h.servers.handle(Event::Apply(server("1", 1)));
    h.settle().await;

    // A status write bumps the resource version but not the generation.
    h.servers.handle(Event::Apply(server("2", 1)));
    h.settle().await;
    assert_eq!(h.syncer.syncs().len(), 1);

    h.servers.handle(Event::Apply(server("3", 2)));
    h.settle().await;
    assert_eq!(h.syncer.syncs().len(), 2);

    h.reconciler.stop().await;
}

#[tokio::test]
async fn test_terminal_error_is_reported_without_retry() {
    let h = Harness::new();
    *h.syncer.invalid.lock().unwrap() = true;
    h.reconciler.run();

    h.servers.handle(Event::Apply(server("1", 1)));
    h.settle().await;

    assert_eq!(h.syncer.syncs().len(), 1);
    assert_eq!(*h.syncer.reported.lock().unwrap(), vec!["monitoring/main"]);
    assert_eq!(h.reconciler.reconcile_queue().num_requeues("monitoring/main"), 0);
    // The failure is still surfaced through a status refresh.
    assert_eq!(h.syncer.statuses(), vec!["monitoring/main"]);

    h.reconciler.stop().await;
}

#[tokio::test]
async fn test_relist_replays_deleted_workloads() {
    let h = Harness::new();
    h.reconciler.run();

    h.servers.handle(Event::Apply(server("1", 1)));
    h.settle().await;

    // A relist which no longer contains the workload acts as a delete.
    h.servers.handle(Event::Init);
    h.servers.handle(Event::InitDone);
    h.settle().await;

    assert!(h.servers.cache().is_empty());
    assert!(h.servers.has_synced());
    assert_eq!(h.syncer.syncs(), vec!["monitoring/main", "monitoring/main"]);

    h.reconciler.stop().await;
}

#[test]
fn test_stop_without_workers_returns() {
    let syncer = Arc::new(MemorySyncer::default());
    let reconciler = ResourceReconciler::new("MetricsServer", "", syncer);
    reconciler.enqueue_for_reconciliation("monitoring/main");

    tokio_test::block_on(reconciler.stop());
    assert!(reconciler.reconcile_queue().is_shutting_down());
}
