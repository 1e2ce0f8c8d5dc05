//! Operator wiring
//!
//! Builds the informers, the MetricsServer syncer and the reconciliation
//! engine, then runs them until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::select_all;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::accessor::meta_namespace_key;
use super::event_source::{Informer, ObjectCache};
use super::kube_backend::{KubeObjectClient, KubePodClient, KubeSecretStore, KubeStatefulSetClient};
use super::metrics;
use super::resource_reconciler::{is_managed_by_controller, EventHandler, ResourceReconciler};
use super::selector::selector_matches;
use super::status_poller::status_poller;
use super::syncer::{Caches, Clients, MetricsServerSyncer, StatusRefresher};
use crate::config::OperatorConfig;
use crate::crd::{MetricsServer, RuleGroup};
use crate::error::{Error, Result};

/// Shared state between the operator and the HTTP server
#[derive(Default)]
pub struct OperatorState {
    ready: AtomicBool,
}

impl OperatorState {
    /// True once the caches are synced and the workers are running.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Requeues the MetricsServers selecting a RuleGroup whenever it changes.
struct RuleGroupEventHandler {
    servers: Arc<ObjectCache<MetricsServer>>,
    reconciler: Arc<ResourceReconciler>,
    controller_id: String,
}

impl RuleGroupEventHandler {
    fn enqueue_selecting(&self, rg: &RuleGroup) {
        for ms in self.servers.list() {
            if ms.namespace() != rg.namespace() {
                continue;
            }
            if !is_managed_by_controller(ms.as_ref(), &self.controller_id) {
                continue;
            }
            let Some(selector) = &ms.spec.rule_selector else {
                continue;
            };

            match selector_matches(selector, rg.labels()) {
                Ok(true) => {
                    debug!(rule_group = %meta_namespace_key(rg), server = %ms.name_any(), "RuleGroup changed");
                    metrics::triggered_by(&RuleGroup::kind(&()), "update").inc();
                    self.reconciler.enqueue_for_reconciliation(&meta_namespace_key(ms.as_ref()));
                }
                Ok(false) => {}
                // Surfaced by the MetricsServer's own reconciliation.
                Err(_) => self.reconciler.enqueue_for_reconciliation(&meta_namespace_key(ms.as_ref())),
            }
        }
    }
}

impl EventHandler<RuleGroup> for RuleGroupEventHandler {
    fn on_add(&self, obj: &RuleGroup) {
        self.enqueue_selecting(obj);
    }

    fn on_update(&self, old: &RuleGroup, new: &RuleGroup) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        // Both versions: a relabel may drop the RuleGroup from a selection.
        self.enqueue_selecting(old);
        self.enqueue_selecting(new);
    }

    fn on_delete(&self, obj: &RuleGroup) {
        self.enqueue_selecting(obj);
    }
}

async fn verify_crd<K>(api: &Api<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let kind = K::kind(&());
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{kind} CRD not installed")))
        }
    }
}

/// Informer tasks, by the kind they watch.
type InformerTasks = Vec<(String, JoinHandle<Result<()>>)>;

/// Waits for `shutdown`. Returns the error of the first informer stopping
/// on its own before that; the remaining tasks stay in `informers`.
async fn wait_for_shutdown(informers: &mut InformerTasks, shutdown: &mut watch::Receiver<bool>) -> Option<Error> {
    if informers.is_empty() {
        let _ = shutdown.wait_for(|stop| *stop).await;
        return None;
    }

    let (result, index) = tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => return None,
        (result, index, _) = select_all(informers.iter_mut().map(|(_, task)| task)) => (result, index),
    };

    let (kind, _) = informers.swap_remove(index);
    match result {
        Ok(Err(e)) => Some(e),
        Ok(Ok(())) => Some(Error::WatchStreamEnded(kind)),
        Err(e) => {
            error!(%kind, error = %e, "informer task failed");
            Some(Error::WatchStreamEnded(kind))
        }
    }
}

/// Main entry point of the operator. Returns once `shutdown` flips to true
/// and every worker has stopped, or with an error once an informer stops
/// following the cluster.
pub async fn run_operator(
    client: Client,
    config: OperatorConfig,
    state: Arc<OperatorState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let namespace = config.namespace.as_deref();
    info!(namespace = ?namespace, controller_id = %config.controller_id, "Starting MetricsServer controller");
    metrics::record_feature_gates(&config.feature_gates);

    let servers_api: Api<MetricsServer> = api(&client, namespace);
    let rule_groups_api: Api<RuleGroup> = api(&client, namespace);
    let statefulsets_api: Api<StatefulSet> = api(&client, namespace);

    verify_crd(&servers_api).await?;
    verify_crd(&rule_groups_api).await?;

    let servers = Informer::<MetricsServer>::new("MetricsServer");
    let rule_groups = Informer::<RuleGroup>::new("RuleGroup");
    let statefulsets = Informer::<StatefulSet>::new("StatefulSet");

    let caches = Caches {
        servers: servers.cache().clone(),
        rule_groups: rule_groups.cache().clone(),
        statefulsets: statefulsets.cache().clone(),
    };
    let objects = Arc::new(KubeObjectClient::<MetricsServer>::new(client.clone()));
    let clients = Clients {
        secrets: Arc::new(KubeSecretStore::new(client.clone())),
        statefulsets: Arc::new(KubeStatefulSetClient::new(client.clone())),
        pods: Arc::new(KubePodClient::new(client.clone())),
        rule_group_status: Arc::new(KubeObjectClient::<RuleGroup>::new(client.clone())),
        server_metadata: objects.clone(),
        server_status: objects,
    };

    let syncer = Arc::new(MetricsServerSyncer::new(config.clone(), caches, clients));
    let reconciler = ResourceReconciler::new(&MetricsServer::kind(&()), &config.controller_id, syncer);

    // Stops the background tasks, on shutdown or when an informer fails.
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut informers: InformerTasks = Vec::new();
    {
        let (informer, rx) = (servers.clone(), stop_rx.clone());
        informers.push(("MetricsServer".to_string(), tokio::spawn(async move { informer.run(servers_api, rx).await })));
        let (informer, rx) = (rule_groups.clone(), stop_rx.clone());
        informers.push(("RuleGroup".to_string(), tokio::spawn(async move { informer.run(rule_groups_api, rx).await })));
        let (informer, rx) = (statefulsets.clone(), stop_rx.clone());
        informers.push(("StatefulSet".to_string(), tokio::spawn(async move { informer.run(statefulsets_api, rx).await })));
    }

    let early_exit = tokio::select! {
        _ = async {
            servers.wait_for_sync().await;
            rule_groups.wait_for_sync().await;
            statefulsets.wait_for_sync().await;
        } => None,
        exit = wait_for_shutdown(&mut informers, &mut shutdown) => Some(exit),
    };
    if let Some(failure) = early_exit {
        if failure.is_none() {
            warn!("Shutdown requested before caches synced");
        }
        let _ = stop_tx.send(true);
        join_tasks(informers).await;
        return failure.map_or(Ok(()), Err);
    }
    info!("Caches synced");

    // The StatefulSet events seen before the handlers are registered are
    // lost, so refresh the status of every existing workload once.
    for ms in servers.cache().list() {
        if is_managed_by_controller(ms.as_ref(), &config.controller_id) {
            reconciler.enqueue_for_status(&meta_namespace_key(ms.as_ref()));
        }
    }

    servers.add_event_handler(Arc::new(reconciler.workload_handler()));
    statefulsets.add_event_handler(Arc::new(reconciler.statefulset_handler()));
    rule_groups.add_event_handler(Arc::new(RuleGroupEventHandler {
        servers: servers.cache().clone(),
        reconciler: reconciler.clone(),
        controller_id: config.controller_id.clone(),
    }));

    reconciler.run();

    let poller = {
        let refresher = StatusRefresher::new(servers.cache().clone(), reconciler.clone(), &config.controller_id);
        let (period, rx) = (config.status_poll_interval, stop_rx.clone());
        tokio::spawn(async move { status_poller(&refresher, period, rx).await })
    };

    state.set_ready(true);
    info!("MetricsServer controller ready");

    let failure = wait_for_shutdown(&mut informers, &mut shutdown).await;
    state.set_ready(false);
    match &failure {
        Some(e) => error!(error = %e, "Informer stopped, shutting down MetricsServer controller"),
        None => info!("Shutting down MetricsServer controller"),
    }

    let _ = stop_tx.send(true);
    reconciler.stop().await;
    if let Err(e) = poller.await {
        error!(error = %e, "status poller failed");
    }
    join_tasks(informers).await;

    failure.map_or(Ok(()), Err)
}

async fn join_tasks(informers: InformerTasks) {
    for (kind, task) in informers {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%kind, error = %e, "informer stopped with an error"),
            Err(e) => error!(%kind, error = %e, "informer task failed"),
        }
    }
}
