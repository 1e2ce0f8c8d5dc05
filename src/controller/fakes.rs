//! In-memory implementations of the cluster-facing traits, for unit tests.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use json_patch::Patch;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;

use super::accessor::{meta_namespace_key, object_key};
use super::config_resource::{ConfigurationObject, StatusClient};
use super::finalizers::MetadataClient;
use super::pods::PodClient;
use super::resources::StatefulSetClient;
use super::sharded_secret::SecretStore;
use super::syncer::WorkloadStatusClient;
use crate::crd::MetricsServer;
use crate::error::{Error, Result};

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake: {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

fn resource_version(obj: &Value) -> u64 {
    obj.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

fn bump_resource_version(obj: &mut Value, previous: u64) {
    obj["metadata"]["resourceVersion"] = Value::String((previous + 1).to_string());
}

// ── status subresource ──

/// Stores configuration resources as JSON and applies patches atomically.
pub struct FakeStatusStore<C> {
    objects: Mutex<BTreeMap<String, Value>>,
    patches: AtomicUsize,
    replaces: AtomicUsize,
    _kind: PhantomData<fn() -> C>,
}

impl<C: ConfigurationObject> FakeStatusStore<C> {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            patches: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
            _kind: PhantomData,
        }
    }

    pub fn insert(&self, obj: &C) {
        let mut value = serde_json::to_value(obj).unwrap();
        if resource_version(&value) == 0 {
            bump_resource_version(&mut value, 0);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(meta_namespace_key(obj), value);
    }

    pub fn get(&self, key: &str) -> C {
        let objects = self.objects.lock().unwrap();
        serde_json::from_value(objects[key].clone()).unwrap()
    }

    pub fn patch_calls(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: ConfigurationObject> StatusClient<C> for FakeStatusStore<C> {
    async fn replace_status(&self, obj: &C) -> Result<()> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let key = meta_namespace_key(obj);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound"))?;

        let new = serde_json::to_value(obj)?;
        let current = resource_version(stored);
        if resource_version(&new) != current {
            return Err(api_error(409, "Conflict"));
        }

        stored["status"] = new.get("status").cloned().unwrap_or(Value::Null);
        bump_resource_version(stored, current);
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, patch: &Patch) -> Result<()> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&object_key(Some(namespace), name))
            .ok_or_else(|| api_error(404, "NotFound"))?;

        let mut doc = stored.clone();
        json_patch::patch(&mut doc, patch).map_err(|e| Error::PatchRejected(e.to_string()))?;

        let current = resource_version(stored);
        *stored = doc;
        bump_resource_version(stored, current);
        Ok(())
    }
}

// ── metadata ──

#[derive(Default)]
pub struct FakeMetadataClient {
    patches: Mutex<Vec<(String, Patch)>>,
}

impl FakeMetadataClient {
    pub fn calls(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    pub fn patches(&self) -> Vec<(String, Patch)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl<K> MetadataClient<K> for FakeMetadataClient {
    async fn patch_metadata(&self, namespace: &str, name: &str, patch: &Patch) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((object_key(Some(namespace), name), patch.clone()));
        Ok(())
    }
}

// ── secrets ──

#[derive(Default)]
pub struct FakeSecretStore {
    secrets: Mutex<BTreeMap<String, Secret>>,
}

impl FakeSecretStore {
    pub fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&object_key(Some(namespace), name))
            .cloned()
    }

    /// Names of the stored secrets, sorted.
    pub fn names(&self) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .values()
            .map(|s| s.name_any())
            .collect()
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn create_or_update(&self, secret: &Secret) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(meta_namespace_key(secret), secret.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .remove(&object_key(Some(namespace), name))
            .is_some())
    }
}

// ── pods ──

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodAction {
    Evict(String),
    Delete(String),
}

/// Holds a fixed set of pods. Evicted and deleted pods disappear from later lists.
#[derive(Default)]
pub struct FakePodClient {
    pods: Mutex<Vec<Pod>>,
    actions: Mutex<Vec<PodAction>>,
    lists: AtomicUsize,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakePodClient {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    /// Every list sleeps for `delay`, so overlapping callers show up in
    /// [`Self::max_concurrent_lists`].
    pub fn with_delay(pods: Vec<Pod>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(pods)
        }
    }

    /// Highest number of list calls seen running at the same time.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<PodAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn remove(&self, name: &str) {
        self.pods.lock().unwrap().retain(|p| p.name_any() != name);
    }
}

#[async_trait]
impl PodClient for FakePodClient {
    async fn list(&self, namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn evict(&self, _namespace: &str, name: &str) -> Result<()> {
        self.actions.lock().unwrap().push(PodAction::Evict(name.to_string()));
        self.remove(name);
        Ok(())
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.actions.lock().unwrap().push(PodAction::Delete(name.to_string()));
        self.remove(name);
        Ok(())
    }
}

// ── workload writes ──

#[derive(Default)]
pub struct FakeStatefulSetClient {
    applied: Mutex<Vec<StatefulSet>>,
}

impl FakeStatefulSetClient {
    pub fn applied(&self) -> Vec<StatefulSet> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatefulSetClient for FakeStatefulSetClient {
    async fn apply(&self, sts: &StatefulSet) -> Result<()> {
        self.applied.lock().unwrap().push(sts.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWorkloadStatusClient {
    updates: Mutex<Vec<MetricsServer>>,
}

impl FakeWorkloadStatusClient {
    pub fn updates(&self) -> Vec<MetricsServer> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkloadStatusClient for FakeWorkloadStatusClient {
    async fn update_status(&self, ms: &MetricsServer) -> Result<()> {
        self.updates.lock().unwrap().push(ms.clone());
        Ok(())
    }
}
