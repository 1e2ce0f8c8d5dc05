//! Custom Resource Definitions for the metrics operator
//!
//! `MetricsServer` is the managed workload, `RuleGroup` the configuration
//! resource it selects.

mod metrics_server;
mod rule_group;
pub mod types;

pub use metrics_server::{MetricsServer, MetricsServerSpec, MetricsServerStatus};
pub use rule_group::{RuleGroup, RuleGroupSpec, RuleGroupStatus};
pub use types::*;
