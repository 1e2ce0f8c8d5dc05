//! MetricsServer reconciliation
//!
//! [`MetricsServerSyncer`] plugs the MetricsServer logic into the generic
//! [`ResourceReconciler`]. Reads come from the informer caches; writes go
//! through the cluster-facing traits so the whole flow runs against fakes
//! in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::accessor::{self, object_key, ReconcileKey};
use super::conditions::{
    update_conditions, CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_RECONCILED,
    REASON_INVALID_CONFIGURATION,
};
use super::config_resource::{
    ConfigResourceSyncer, ResourcesSelection, StatusClient, TypedConfigurationResource, WorkloadRef,
};
use super::event_source::ObjectCache;
use super::finalizers::{FinalizerSyncer, MetadataClient};
use super::pods::PodClient;
use super::resource_reconciler::{is_managed_by_controller, ResourceReconciler, Syncer};
use super::resources::{
    build_statefulset, ensure_statefulset, rule_files_secret_template, StatefulSetClient,
    RULES_VOLUME_NAME,
};
use super::selector::selector_matches;
use super::sharded_secret::{reconcile_sharded_secret, SecretStore};
use super::statefulset_reporter::StatefulSetReporter;
use super::statefulset_repair::{resolve_stuck_statefulset, RepairOutcome};
use super::status_poller::StatusReconciler;
use crate::config::{OperatorConfig, STATUS_CLEANUP_FINALIZER};
use crate::crd::{Condition, ConditionStatus, MetricsServer, MetricsServerStatus, RuleGroup};
use crate::error::{Error, Result};

pub const REASON_RECONCILIATION_FAILED: &str = "ReconciliationFailed";
pub const REASON_STATEFULSET_NOT_FOUND: &str = "StatefulSetNotFound";

/// Writes the status subresource of MetricsServers.
#[async_trait]
pub trait WorkloadStatusClient: Send + Sync {
    async fn update_status(&self, ms: &MetricsServer) -> Result<()>;
}

/// Informer caches read by the syncer.
#[derive(Clone, Default)]
pub struct Caches {
    pub servers: Arc<ObjectCache<MetricsServer>>,
    pub rule_groups: Arc<ObjectCache<RuleGroup>>,
    pub statefulsets: Arc<ObjectCache<StatefulSet>>,
}

/// Cluster-facing writers used by the syncer.
#[derive(Clone)]
pub struct Clients {
    pub secrets: Arc<dyn SecretStore>,
    pub statefulsets: Arc<dyn StatefulSetClient>,
    pub pods: Arc<dyn PodClient>,
    pub rule_group_status: Arc<dyn StatusClient<RuleGroup>>,
    pub server_metadata: Arc<dyn MetadataClient<MetricsServer>>,
    pub server_status: Arc<dyn WorkloadStatusClient>,
}

/// Outcome of the last reconciliation of each workload, reported as the
/// Reconciled condition by the status refresh.
#[derive(Default)]
pub struct ReconciliationTracker {
    failures: Mutex<BTreeMap<ReconcileKey, (String, String)>>,
}

impl ReconciliationTracker {
    pub fn set_status(&self, key: &str, err: Option<&Error>) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match err {
            None => {
                failures.remove(key);
            }
            Some(err) => {
                let reason = if err.is_retriable() {
                    REASON_RECONCILIATION_FAILED
                } else {
                    REASON_INVALID_CONFIGURATION
                };
                failures.insert(key.to_string(), (reason.to_string(), err.to_string()));
            }
        }
    }

    pub fn forget(&self, key: &str) {
        self.set_status(key, None);
    }

    pub fn condition(&self, key: &str, generation: i64) -> Condition {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let condition = match failures.get(key) {
            None => Condition::new(CONDITION_TYPE_RECONCILED, ConditionStatus::True, "", ""),
            Some((reason, message)) => {
                Condition::new(CONDITION_TYPE_RECONCILED, ConditionStatus::False, reason, message)
            }
        };
        condition.with_observed_generation(generation)
    }
}

pub struct MetricsServerSyncer {
    config: OperatorConfig,
    caches: Caches,
    clients: Clients,
    reconciliations: ReconciliationTracker,
}

impl MetricsServerSyncer {
    pub fn new(config: OperatorConfig, caches: Caches, clients: Clients) -> Self {
        Self {
            config,
            caches,
            clients,
            reconciliations: ReconciliationTracker::default(),
        }
    }

    fn config_syncer(&self, ms: &MetricsServer) -> ConfigResourceSyncer<RuleGroup> {
        ConfigResourceSyncer::new(WorkloadRef::of(ms), self.clients.rule_group_status.clone())
    }

    /// RuleGroups of the MetricsServer's namespace matched by its rule
    /// selector, each with its validation outcome.
    pub fn select_rule_groups(&self, ms: &MetricsServer) -> Result<ResourcesSelection<RuleGroup>> {
        let mut selection = ResourcesSelection::default();
        let Some(selector) = &ms.spec.rule_selector else {
            return Ok(selection);
        };

        let namespace = ms.namespace();
        for rg in self.caches.rule_groups.list() {
            if rg.namespace() != namespace {
                continue;
            }
            if !selector_matches(selector, rg.labels())? {
                continue;
            }

            let key = accessor::meta_namespace_key(rg.as_ref());
            let generation = accessor::generation(rg.as_ref());
            let resource = match rg.spec.validate() {
                Ok(()) => TypedConfigurationResource::new(rg, None, "", generation),
                Err(err) => {
                    warn!(rule_group = %key, error = %err, "skipping invalid RuleGroup");
                    TypedConfigurationResource::new(rg, Some(err), REASON_INVALID_CONFIGURATION, generation)
                }
            };
            selection.insert(key, resource);
        }

        debug!(selected = selection.len(), "RuleGroups selected");
        Ok(selection)
    }

    #[instrument(skip(self, ms), fields(name = %ms.name_any(), namespace = ms.namespace()))]
    async fn sync_server(&self, key: &str, ms: &MetricsServer) -> Result<()> {
        let deleting = accessor::deletion_in_progress(ms);
        let config_syncer = self.config_syncer(ms);
        let rule_groups = self.caches.rule_groups.list();

        let finalizer = FinalizerSyncer::new(
            self.clients.server_metadata.clone(),
            STATUS_CLEANUP_FINALIZER,
            self.config.config_resources_status_enabled(),
        );
        let (bindings, all) = (&config_syncer, &rule_groups);
        finalizer
            .sync(ms, deleting, move || async move {
                bindings.cleanup_bindings(all, &ResourcesSelection::default()).await
            })
            .await?;

        if deleting {
            self.reconciliations.forget(key);
            return Ok(());
        }

        let selection = self.select_rule_groups(ms)?;

        let rule_files: BTreeMap<String, Vec<u8>> = selection
            .valid_resources()
            .values()
            .map(|rg| {
                let file = format!("{}-{}.yaml", rg.namespace().unwrap_or_default(), rg.name_any());
                (file, rg.spec.rules.clone().into_bytes())
            })
            .collect();
        let sharded = reconcile_sharded_secret(
            self.clients.secrets.as_ref(),
            rule_files_secret_template(ms),
            rule_files,
        )
        .await?;

        let sts = build_statefulset(ms, sharded.volume(RULES_VOLUME_NAME), sharded.hash());
        ensure_statefulset(self.clients.statefulsets.as_ref(), &sts).await?;

        if self.config.config_resources_status_enabled() {
            for (_, resource) in selection.iter() {
                config_syncer
                    .update_binding(&resource.resource, &resource.conditions())
                    .await?;
            }
            config_syncer.cleanup_bindings(&rule_groups, &selection).await?;
        }

        info!(rule_groups = selection.len(), shards = sharded.shards().len(), "MetricsServer reconciled");
        Ok(())
    }

    /// Derives the Available condition and replica counters from the
    /// StatefulSet, repairing a stuck rollout on the way.
    async fn observe_statefulset(&self, ms: &mut MetricsServer) -> Result<Condition> {
        let sts_key = object_key(ms.namespace().as_deref(), &ms.statefulset_name());
        let generation = accessor::generation(ms);

        let Some(sts) = self.caches.statefulsets.get(&sts_key) else {
            ms.status.get_or_insert_with(MetricsServerStatus::default);
            return Ok(Condition::new(
                CONDITION_TYPE_AVAILABLE,
                ConditionStatus::False,
                REASON_STATEFULSET_NOT_FOUND,
                &format!("statefulset {sts_key} not found"),
            )
            .with_observed_generation(generation));
        };

        let reporter = StatefulSetReporter::load(self.clients.pods.as_ref(), &sts).await?;
        let available = reporter.update(ms);

        match resolve_stuck_statefulset(self.clients.pods.as_ref(), &sts, ms.spec.repair_policy).await? {
            RepairOutcome::Evicted(pod) => info!(%pod, "Evicted pod stuck on an orphaned revision"),
            RepairOutcome::Deleted(pod) => info!(%pod, "Deleted pod stuck on an orphaned revision"),
            RepairOutcome::Skipped | RepairOutcome::NothingToRepair => {}
        }

        Ok(available)
    }
}

#[async_trait]
impl Syncer for MetricsServerSyncer {
    async fn sync(&self, key: &str) -> Result<()> {
        let Some(ms) = self.caches.servers.get(key) else {
            debug!(%key, "MetricsServer not found in cache, nothing to do");
            self.reconciliations.forget(key);
            return Ok(());
        };

        let result = self.sync_server(key, &ms).await;
        if !accessor::deletion_in_progress(ms.as_ref()) {
            self.reconciliations.set_status(key, result.as_ref().err());
        }
        result
    }

    async fn update_status(&self, key: &str) -> Result<()> {
        let Some(cached) = self.caches.servers.get(key) else {
            return Ok(());
        };
        if accessor::deletion_in_progress(cached.as_ref()) {
            return Ok(());
        }

        let mut ms = (*cached).clone();
        let available = self.observe_statefulset(&mut ms).await?;
        let reconciled = self.reconciliations.condition(key, accessor::generation(&ms));

        let status = ms.status.get_or_insert_with(MetricsServerStatus::default);
        status.conditions = update_conditions(cached.conditions(), &[available, reconciled]);

        if serde_json::to_value(&ms.status)? == serde_json::to_value(&cached.status)? {
            debug!(%key, "status is up to date");
            return Ok(());
        }

        self.clients.server_status.update_status(&ms).await?;
        debug!(%key, "status updated");
        Ok(())
    }

    fn resolve(&self, sts: &StatefulSet) -> Option<ReconcileKey> {
        let owner = accessor::controller_owner(sts)?;
        if owner.kind != MetricsServer::kind(&()) {
            return None;
        }

        let key = object_key(sts.namespace().as_deref(), &owner.name);
        let ms = self.caches.servers.get(&key)?;
        is_managed_by_controller(ms.as_ref(), &self.config.controller_id).then_some(key)
    }

    /// Records the failure for the Reconciled condition. The engine refreshes
    /// the status after every sync, so the write goes through the status queue.
    async fn report_terminal_error(&self, key: &str, err: &Error) -> Result<()> {
        self.reconciliations.set_status(key, Some(err));
        Ok(())
    }
}

/// Feeds the status poller from the MetricsServer cache.
pub struct StatusRefresher {
    servers: Arc<ObjectCache<MetricsServer>>,
    reconciler: Arc<ResourceReconciler>,
    controller_id: String,
}

impl StatusRefresher {
    pub fn new(
        servers: Arc<ObjectCache<MetricsServer>>,
        reconciler: Arc<ResourceReconciler>,
        controller_id: &str,
    ) -> Self {
        Self {
            servers,
            reconciler,
            controller_id: controller_id.to_string(),
        }
    }
}

impl StatusReconciler for StatusRefresher {
    fn iterate(&self) -> Vec<(ReconcileKey, Vec<Condition>)> {
        self.servers
            .list()
            .iter()
            .filter(|ms| is_managed_by_controller(ms.as_ref(), &self.controller_id))
            .map(|ms| (accessor::meta_namespace_key(ms.as_ref()), ms.conditions().to_vec()))
            .collect()
    }

    fn refresh_status_for(&self, key: &str) {
        self.reconciler.enqueue_for_status(key);
    }
}
