//! Object identity and metadata helpers
//!
//! Every queue, cache and binding in the operator identifies objects by a
//! `namespace/name` key computed here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};

/// Identity of a managed workload: `namespace/name`, or `name` when cluster-scoped.
pub type ReconcileKey = String;

/// Returns the `namespace/name` key of an object.
pub fn meta_namespace_key<K: Resource>(obj: &K) -> ReconcileKey {
    object_key(obj.meta().namespace.as_deref(), &obj.name_any())
}

pub fn object_key(namespace: Option<&str>, name: &str) -> ReconcileKey {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Splits a key back into its namespace and name.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns).filter(|ns| !ns.is_empty()), *name)),
        _ => Err(Error::ConfigError(format!("unexpected key format: {key:?}"))),
    }
}

/// True once a deletion has been requested for the object.
pub fn deletion_in_progress<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Value of an annotation, or "" when missing.
pub fn annotation<'a, K: Resource>(obj: &'a K, name: &str) -> &'a str {
    obj.annotations().get(name).map(String::as_str).unwrap_or("")
}

pub fn generation<K: Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}

/// The owner reference flagged as controller, if any.
pub fn controller_owner<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
}
