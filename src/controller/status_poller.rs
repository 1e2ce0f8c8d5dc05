//! Periodic status refresh of unavailable workloads
//!
//! Some transitions never produce a StatefulSet event, e.g. a pod stuck in
//! `ContainerCreating` whose message changes. The poller sweeps the known
//! workloads at a fixed period and queues a status refresh for those which
//! aren't fully available.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::accessor::ReconcileKey;
use super::conditions::{is_condition_true, CONDITION_TYPE_AVAILABLE};
use crate::crd::Condition;

/// Source of workloads for the status poller.
pub trait StatusReconciler: Send + Sync {
    /// Key and current status conditions of every known workload.
    fn iterate(&self) -> Vec<(ReconcileKey, Vec<Condition>)>;

    /// Queues a status refresh for the workload.
    fn refresh_status_for(&self, key: &str);
}

/// One sweep: refreshes every workload whose Available condition isn't True.
/// Returns the number of refreshes requested.
pub fn poll_once(sr: &dyn StatusReconciler) -> usize {
    let mut refreshed = 0;
    for (key, conditions) in sr.iterate() {
        if is_condition_true(&conditions, CONDITION_TYPE_AVAILABLE) {
            continue;
        }
        debug!(%key, "workload not available, refreshing status");
        sr.refresh_status_for(&key);
        refreshed += 1;
    }
    refreshed
}

/// Runs [`poll_once`] every `period` until `shutdown` flips to true.
pub async fn status_poller(
    sr: &dyn StatusReconciler,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), "Starting status poller");

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(sr);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Status poller stopped");
}
