//! Event-driven reconciliation engine
//!
//! The [`ResourceReconciler`] receives events for the managed workloads and
//! for the StatefulSets generated from them, and feeds two work queues:
//!
//! - the reconcile queue drives [`Syncer::sync`], the full reconciliation;
//! - the status queue drives [`Syncer::update_status`], which only refreshes
//!   the workload status from the observed state.
//!
//! A StatefulSet update which doesn't touch its spec, labels or annotations
//! (typically pods becoming ready) only needs a status refresh. Every
//! reconciliation, successful or not, is followed by one as well.
//!
//! Each queue has a single worker and never hands out a key which is still
//! being processed, so `sync` and `update_status` never run concurrently for
//! the same key.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Resource, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::accessor::{self, meta_namespace_key, ReconcileKey};
use super::metrics;
use super::queue::WorkQueue;
use crate::config::{CONTROLLER_ID_ANNOTATION, STATUS_CLEANUP_FINALIZER};
use crate::error::{Error, Result};

/// Synchronizes the workloads of one kind. Implementations must tolerate
/// redundant calls for the same key.
#[async_trait]
pub trait Syncer: Send + Sync + 'static {
    /// Reconciles the desired state of the workload identified by `key`.
    async fn sync(&self, key: &str) -> Result<()>;

    /// Refreshes the status subresource of the workload identified by `key`.
    async fn update_status(&self, key: &str) -> Result<()>;

    /// Key of the workload controlling `sts`, if it is known and managed by
    /// this controller.
    fn resolve(&self, sts: &StatefulSet) -> Option<ReconcileKey>;

    /// Surfaces an error which retrying won't fix, e.g. as a status condition.
    async fn report_terminal_error(&self, _key: &str, _err: &Error) -> Result<()> {
        Ok(())
    }
}

/// Receives the notifications of one object stream.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// True when the objects have different resource versions.
pub fn has_object_changed<K: Resource>(old: &K, new: &K) -> bool {
    if old.resource_version() != new.resource_version() {
        debug!(
            object = %meta_namespace_key(new),
            old = ?old.resource_version(),
            current = ?new.resource_version(),
            "different resource versions"
        );
        return true;
    }
    false
}

/// True when the objects differ in a way which requires a full
/// reconciliation: generation, labels or annotations. Status-only changes
/// don't count, which keeps status writes from triggering reconcile loops.
pub fn has_state_changed<K: Resource>(old: &K, new: &K) -> bool {
    let object = meta_namespace_key(new);

    if accessor::generation(old) != accessor::generation(new) {
        debug!(%object, old = accessor::generation(old), current = accessor::generation(new), "different generations");
        return true;
    }

    if old.labels() != new.labels() {
        debug!(%object, old = ?old.labels(), current = ?new.labels(), "different labels");
        return true;
    }

    if old.annotations() != new.annotations() {
        debug!(%object, old = ?old.annotations(), current = ?new.annotations(), "different annotations");
        return true;
    }

    false
}

/// True when the object's controller-id annotation matches `controller_id`.
/// A missing annotation is the empty id.
pub fn is_managed_by_controller<K: Resource>(obj: &K, controller_id: &str) -> bool {
    let object_id = accessor::annotation(obj, CONTROLLER_ID_ANNOTATION);
    if object_id != controller_id {
        debug!(
            object = %meta_namespace_key(obj),
            object_id,
            controller_id,
            "skipping object not managed by the controller"
        );
        return false;
    }
    true
}

fn deletion_in_progress<K: Resource>(obj: &K) -> bool {
    if accessor::deletion_in_progress(obj) {
        debug!(object = %meta_namespace_key(obj), "object deletion in progress");
        return true;
    }
    false
}

pub struct ResourceReconciler {
    /// Kind of the managed workload, e.g. "MetricsServer"
    kind: String,
    /// Lowercase kind, used as metric label and queue name
    controller: String,
    controller_id: String,
    syncer: Arc<dyn Syncer>,
    reconcile_queue: Arc<WorkQueue>,
    status_queue: Arc<WorkQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceReconciler {
    pub fn new(kind: &str, controller_id: &str, syncer: Arc<dyn Syncer>) -> Arc<Self> {
        let controller = kind.to_lowercase();

        // Register the trigger counters upfront so they're exported at 0.
        for triggered_by in ["StatefulSet", kind] {
            for action in ["add", "update", "delete"] {
                metrics::triggered_by(triggered_by, action);
            }
        }

        Arc::new(Self {
            kind: kind.to_string(),
            reconcile_queue: WorkQueue::new(controller.clone()),
            status_queue: WorkQueue::new(format!("{controller}_status")),
            controller,
            controller_id: controller_id.to_string(),
            syncer,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn reconcile_queue(&self) -> &Arc<WorkQueue> {
        &self.reconcile_queue
    }

    pub fn status_queue(&self) -> &Arc<WorkQueue> {
        &self.status_queue
    }

    /// Handler for the workload stream.
    pub fn workload_handler(self: &Arc<Self>) -> WorkloadEventHandler {
        WorkloadEventHandler(Arc::clone(self))
    }

    /// Handler for the StatefulSet stream.
    pub fn statefulset_handler(self: &Arc<Self>) -> StatefulSetEventHandler {
        StatefulSetEventHandler(Arc::clone(self))
    }

    // ── workload events ──

    pub fn on_workload_add<W: Resource>(&self, obj: &W) {
        if !is_managed_by_controller(obj, &self.controller_id) {
            return;
        }

        let key = meta_namespace_key(obj);
        debug!(%key, kind = %self.kind, "workload added");
        metrics::triggered_by(&self.kind, "add").inc();
        self.reconcile_queue.add(&key);
    }

    pub fn on_workload_update<W: Resource>(&self, old: &W, new: &W) {
        if !is_managed_by_controller(new, &self.controller_id) {
            return;
        }

        // Once the cleanup finalizer is gone there's nothing left to do.
        if !accessor::has_finalizer(new, STATUS_CLEANUP_FINALIZER) && deletion_in_progress(new) {
            return;
        }

        if !has_state_changed(old, new) {
            return;
        }

        let key = meta_namespace_key(new);
        debug!(%key, kind = %self.kind, "workload updated");
        metrics::triggered_by(&self.kind, "update").inc();
        self.reconcile_queue.add(&key);
    }

    pub fn on_workload_delete<W: Resource>(&self, obj: &W) {
        if !is_managed_by_controller(obj, &self.controller_id) {
            return;
        }

        let key = meta_namespace_key(obj);
        debug!(%key, kind = %self.kind, "workload deleted");
        metrics::triggered_by(&self.kind, "delete").inc();
        self.reconcile_queue.add(&key);
    }

    // ── StatefulSet events ──

    pub fn on_statefulset_add(&self, sts: &StatefulSet) {
        let Some(key) = self.syncer.resolve(sts) else {
            return;
        };

        debug!(%key, statefulset = %sts.name_any(), "StatefulSet added");
        metrics::triggered_by("StatefulSet", "add").inc();
        self.enqueue_for_reconciliation(&key);
    }

    pub fn on_statefulset_update(&self, old: &StatefulSet, new: &StatefulSet) {
        if deletion_in_progress(new) {
            return;
        }

        if !has_object_changed(old, new) {
            return;
        }

        let Some(key) = self.syncer.resolve(new) else {
            return;
        };

        debug!(%key, statefulset = %new.name_any(), "StatefulSet updated");
        metrics::triggered_by("StatefulSet", "update").inc();

        if !has_state_changed(old, new) {
            // Only the StatefulSet status moved: refreshing the workload
            // status is enough.
            self.enqueue_for_status(&key);
            return;
        }

        self.enqueue_for_reconciliation(&key);
    }

    pub fn on_statefulset_delete(&self, sts: &StatefulSet) {
        let Some(key) = self.syncer.resolve(sts) else {
            return;
        };

        debug!(%key, statefulset = %sts.name_any(), "StatefulSet deleted");
        metrics::triggered_by("StatefulSet", "delete").inc();
        self.enqueue_for_reconciliation(&key);
    }

    /// Asks for a full reconciliation of the workload.
    pub fn enqueue_for_reconciliation(&self, key: &str) {
        self.reconcile_queue.add(key);
    }

    /// Asks for a status refresh of the workload.
    pub fn enqueue_for_status(&self, key: &str) {
        self.status_queue.add(key);
    }

    // ── workers ──

    /// Spawns the workers of both queues.
    pub fn run(self: &Arc<Self>) {
        let reconciler = Arc::clone(self);
        let reconcile_worker = tokio::spawn(async move {
            while reconciler.process_next_reconcile_item().await {}
            debug!(queue = %reconciler.reconcile_queue.name(), "worker stopped");
        });

        let reconciler = Arc::clone(self);
        let status_worker = tokio::spawn(async move {
            while reconciler.process_next_status_item().await {}
            debug!(queue = %reconciler.status_queue.name(), "worker stopped");
        });

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(reconcile_worker);
        workers.push(status_worker);
        info!(kind = %self.kind, "Started reconciliation workers");
    }

    /// Shuts both queues down and waits for the workers to exit. Keys already
    /// queued are processed first.
    pub async fn stop(&self) {
        self.reconcile_queue.shut_down();
        self.status_queue.shut_down();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "reconciliation worker failed");
            }
        }
        info!(kind = %self.kind, "Stopped reconciliation workers");
    }

    /// Processes one key of the reconcile queue. Returns false once the
    /// queue is shut down.
    pub async fn process_next_reconcile_item(&self) -> bool {
        let Some(key) = self.reconcile_queue.get().await else {
            return false;
        };

        metrics::inc_reconcile_operation(&self.controller);
        let start = Instant::now();
        let result = self.syncer.sync(&key).await;
        metrics::observe_reconcile_duration_seconds(
            &self.controller,
            start.elapsed().as_secs_f64(),
        );

        match result {
            Ok(()) => self.reconcile_queue.forget(&key),
            Err(err) => {
                metrics::inc_reconcile_error(&self.controller, err.metric_label());

                if err.is_retriable() {
                    error!(%key, error = %err, "sync failed");
                    self.reconcile_queue.add_rate_limited(&key);
                } else {
                    error!(%key, error = %err, "sync failed with a non-retriable error");
                    self.reconcile_queue.forget(&key);
                    if let Err(e) = self.syncer.report_terminal_error(&key, &err).await {
                        warn!(%key, error = %e, "failed to report the error");
                    }
                }
            }
        }

        // The status is refreshed after every reconciliation.
        self.status_queue.add(&key);
        self.reconcile_queue.done(&key);
        true
    }

    /// Processes one key of the status queue. Returns false once the queue
    /// is shut down.
    pub async fn process_next_status_item(&self) -> bool {
        let Some(key) = self.status_queue.get().await else {
            return false;
        };

        metrics::inc_status_update(&self.controller);
        match self.syncer.update_status(&key).await {
            Ok(()) => self.status_queue.forget(&key),
            Err(err) => {
                metrics::inc_status_update_error(&self.controller);
                error!(%key, error = %err, "status update failed");
                self.status_queue.add_rate_limited(&key);
            }
        }

        self.status_queue.done(&key);
        true
    }
}

/// Forwards workload events to the reconciler.
#[derive(Clone)]
pub struct WorkloadEventHandler(Arc<ResourceReconciler>);

impl<W: Resource> EventHandler<W> for WorkloadEventHandler {
    fn on_add(&self, obj: &W) {
        self.0.on_workload_add(obj);
    }

    fn on_update(&self, old: &W, new: &W) {
        self.0.on_workload_update(old, new);
    }

    fn on_delete(&self, obj: &W) {
        self.0.on_workload_delete(obj);
    }
}

/// Forwards StatefulSet events to the reconciler.
#[derive(Clone)]
pub struct StatefulSetEventHandler(Arc<ResourceReconciler>);

impl EventHandler<StatefulSet> for StatefulSetEventHandler {
    fn on_add(&self, obj: &StatefulSet) {
        self.0.on_statefulset_add(obj);
    }

    fn on_update(&self, old: &StatefulSet, new: &StatefulSet) {
        self.0.on_statefulset_update(old, new);
    }

    fn on_delete(&self, obj: &StatefulSet) {
        self.0.on_statefulset_delete(obj);
    }
}
