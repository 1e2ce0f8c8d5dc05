//! metrics-operator: Kubernetes operator for MetricsServer workloads
//!
//! This crate reconciles MetricsServer custom resources into StatefulSets,
//! packs the rule files of the RuleGroups they select into sharded Secrets,
//! and reports workload bindings back into the RuleGroup status.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod server;

pub use crate::error::{Error, Result};
