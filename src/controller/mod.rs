//! Controller module for MetricsServer reconciliation
//!
//! This module contains the generic reconciliation engine (queues, event
//! filtering, status polling), the building blocks it drives (bindings,
//! finalizers, sharded secrets, StatefulSet reporting and repair) and the
//! MetricsServer-specific syncer wiring them to the cluster.

pub mod accessor;
pub mod conditions;
pub mod config_resource;
pub mod event_source;
pub mod finalizers;
pub mod kube_backend;
pub mod metrics;
mod operator;
pub mod pods;
pub mod queue;
pub mod resource_reconciler;
pub mod resources;
pub mod selector;
pub mod sharded_secret;
pub mod statefulset_repair;
pub mod statefulset_reporter;
pub mod status_poller;
pub mod syncer;

#[cfg(test)]
pub(crate) mod fakes;

pub use accessor::ReconcileKey;
pub use operator::{run_operator, OperatorState};
pub use resource_reconciler::{EventHandler, ResourceReconciler, Syncer};
