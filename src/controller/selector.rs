//! Label selector helpers
//!
//! kube lists objects with a selector *string*; the caches need to evaluate
//! the same selector locally. Both go through the same validation so an
//! invalid selector fails the same way on either path.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

fn requirement_values(req: &LabelSelectorRequirement) -> &[String] {
    req.values.as_deref().unwrap_or_default()
}

fn validate_requirement(req: &LabelSelectorRequirement) -> Result<()> {
    match req.operator.as_str() {
        "In" | "NotIn" if requirement_values(req).is_empty() => Err(Error::ConfigError(format!(
            "selector requirement on {:?}: operator {} needs at least one value",
            req.key, req.operator
        ))),
        "Exists" | "DoesNotExist" if !requirement_values(req).is_empty() => {
            Err(Error::ConfigError(format!(
                "selector requirement on {:?}: operator {} takes no values",
                req.key, req.operator
            )))
        }
        "In" | "NotIn" | "Exists" | "DoesNotExist" => Ok(()),
        other => Err(Error::ConfigError(format!(
            "selector requirement on {:?}: unknown operator {other:?}",
            req.key
        ))),
    }
}

/// Renders a selector in the label-selector string syntax accepted by the API server.
///
/// An empty selector renders as "" and matches everything.
pub fn selector_to_string(selector: &LabelSelector) -> Result<String> {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (k, v) in labels {
            parts.push(format!("{k}={v}"));
        }
    }

    for req in selector.match_expressions.iter().flatten() {
        validate_requirement(req)?;
        let part = match req.operator.as_str() {
            "In" => format!("{} in ({})", req.key, requirement_values(req).join(",")),
            "NotIn" => format!("{} notin ({})", req.key, requirement_values(req).join(",")),
            "Exists" => req.key.clone(),
            _ => format!("!{}", req.key),
        };
        parts.push(part);
    }

    Ok(parts.join(","))
}

/// Evaluates a selector against a label set.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }

    for req in selector.match_expressions.iter().flatten() {
        validate_requirement(req)?;
        let value = labels.get(&req.key);
        let values = requirement_values(req);
        let matched = match req.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.map_or(true, |v| !values.contains(v)),
            "Exists" => value.is_some(),
            _ => value.is_none(),
        };
        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}
