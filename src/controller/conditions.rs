//! Condition management helpers following Kubernetes API conventions

use crate::crd::{Condition, ConditionStatus};

/// Standard condition types
pub const CONDITION_TYPE_AVAILABLE: &str = "Available";
pub const CONDITION_TYPE_RECONCILED: &str = "Reconciled";
/// Per-binding condition stored on configuration resources
pub const CONDITION_TYPE_ACCEPTED: &str = "Accepted";

/// Reasons
pub const REASON_NO_POD_READY: &str = "NoPodReady";
pub const REASON_SOME_PODS_NOT_READY: &str = "SomePodsNotReady";
pub const REASON_INVALID_CONFIGURATION: &str = "InvalidConfiguration";

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Merges `updates` into `existing`.
///
/// Conditions keep their position in the list and new types are appended.
/// When the status of a condition doesn't change, its previous
/// `last_transition_time` is preserved.
pub fn update_conditions(existing: &[Condition], updates: &[Condition]) -> Vec<Condition> {
    let mut merged: Vec<Condition> = existing.to_vec();

    for update in updates {
        match merged.iter_mut().find(|c| c.type_ == update.type_) {
            Some(current) => {
                let transition_time = if current.status == update.status {
                    current.last_transition_time.clone()
                } else {
                    update.last_transition_time.clone()
                };
                *current = update.clone();
                current.last_transition_time = transition_time;
            }
            None => merged.push(update.clone()),
        }
    }

    merged
}

/// Compares two binding condition lists.
///
/// The order of the conditions and their transition times are ignored.
pub fn equal_config_resource_conditions(a: &[Condition], b: &[Condition]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let normalize = |conditions: &[Condition]| {
        let mut out: Vec<Condition> = conditions
            .iter()
            .cloned()
            .map(|mut c| {
                c.last_transition_time = String::new();
                c
            })
            .collect();
        out.sort_by(|x, y| x.type_.cmp(&y.type_));
        out
    };

    normalize(a) == normalize(b)
}
