//! Finalizer handling for workload cleanup
//!
//! When the status of configuration resources is enabled, every workload
//! carries the status-cleanup finalizer. On deletion the workload's bindings
//! are removed first; the finalizer is only dropped once that succeeded, so a
//! failed cleanup keeps the object around until the next retry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, TestOperation};
use jsonptr::Pointer;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::accessor::meta_namespace_key;
use crate::error::Result;

/// Applies JSON patches to the metadata of objects of kind `K`.
#[async_trait]
pub trait MetadataClient<K>: Send + Sync {
    async fn patch_metadata(&self, namespace: &str, name: &str, patch: &Patch) -> Result<()>;
}

/// Patch adding `finalizer`, empty when already present.
pub fn finalizer_add_patch(finalizers: &[String], finalizer: &str) -> Patch {
    if finalizers.iter().any(|f| f == finalizer) {
        return Patch::default();
    }

    let op = if finalizers.is_empty() {
        AddOperation {
            path: Pointer::new(["metadata", "finalizers"]),
            value: Value::Array(vec![Value::String(finalizer.to_string())]),
        }
    } else {
        AddOperation {
            path: Pointer::new(["metadata", "finalizers", "-"]),
            value: Value::String(finalizer.to_string()),
        }
    };
    Patch(vec![PatchOperation::Add(op)])
}

/// Patch removing `finalizer`, empty when absent.
///
/// The removal is guarded by a test on the same index, so a concurrent
/// change of the finalizer list rejects the patch instead of removing
/// someone else's finalizer.
pub fn finalizer_remove_patch(finalizers: &[String], finalizer: &str) -> Patch {
    let Some(i) = finalizers.iter().position(|f| f == finalizer) else {
        return Patch::default();
    };

    let path = Pointer::new(["metadata", "finalizers", i.to_string().as_str()]);
    Patch(vec![
        PatchOperation::Test(TestOperation {
            path: path.clone(),
            value: Value::String(finalizer.to_string()),
        }),
        PatchOperation::Remove(RemoveOperation { path }),
    ])
}

pub struct FinalizerSyncer<K> {
    client: Arc<dyn MetadataClient<K>>,
    finalizer: String,
    enabled: bool,
}

impl<K: Resource> FinalizerSyncer<K> {
    pub fn new(client: Arc<dyn MetadataClient<K>>, finalizer: &str, enabled: bool) -> Self {
        Self {
            client,
            finalizer: finalizer.to_string(),
            enabled,
        }
    }

    /// Sets or clears the finalizer depending on the object's lifecycle.
    ///
    /// While the object lives, the finalizer is added if missing. Once
    /// deletion is in progress, `status_cleanup` runs and the finalizer is
    /// removed only if it succeeded.
    ///
    /// Returns true when the finalizer list was modified.
    #[instrument(skip_all, fields(key = %meta_namespace_key(obj), deletion_in_progress = deletion_in_progress))]
    pub async fn sync<F, Fut>(
        &self,
        obj: &K,
        deletion_in_progress: bool,
        status_cleanup: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        if !self.enabled {
            return Ok(false);
        }

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        if !deletion_in_progress {
            let patch = finalizer_add_patch(obj.finalizers(), &self.finalizer);
            if patch.is_empty() {
                return Ok(false);
            }
            self.client.patch_metadata(&namespace, &name, &patch).await?;
            info!(finalizer = %self.finalizer, "Added finalizer");
            return Ok(true);
        }

        let patch = finalizer_remove_patch(obj.finalizers(), &self.finalizer);
        if patch.is_empty() {
            debug!("Finalizer already removed");
            return Ok(false);
        }

        status_cleanup().await?;

        self.client.patch_metadata(&namespace, &name, &patch).await?;
        info!(finalizer = %self.finalizer, "Removed finalizer");
        Ok(true)
    }
}
