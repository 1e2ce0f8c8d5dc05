//! API-server implementations of the cluster-facing traits

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tracing::{debug, instrument, warn};

use super::config_resource::StatusClient;
use super::finalizers::MetadataClient;
use super::pods::PodClient;
use super::resources::StatefulSetClient;
use super::sharded_secret::SecretStore;
use super::syncer::WorkloadStatusClient;
use crate::config::FIELD_MANAGER;
use crate::crd::MetricsServer;
use crate::error::{is_api_status, Error, Result};

/// Attempts of a secret write before giving up on conflicts
const SECRET_WRITE_ATTEMPTS: usize = 5;

fn namespaced<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    Api::namespaced(client.clone(), namespace)
}

// ── secrets ──

#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn try_create_or_update(&self, api: &Api<Secret>, secret: &Secret) -> kube::Result<()> {
        let name = secret.name_any();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let Some(existing) = api.get_opt(&name).await? else {
            api.create(&pp, secret).await?;
            debug!(secret = %name, "Secret created");
            return Ok(());
        };

        if existing.data == secret.data
            && existing.labels() == secret.labels()
            && existing.owner_references() == secret.owner_references()
        {
            return Ok(());
        }

        let mut desired = secret.clone();
        desired.metadata.resource_version = existing.metadata.resource_version.clone();
        api.replace(&name, &pp, &desired).await?;
        debug!(secret = %name, "Secret updated");
        Ok(())
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    #[instrument(skip(self, secret), fields(name = %secret.name_any(), namespace = secret.namespace()))]
    async fn create_or_update(&self, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = namespaced(&self.client, &secret.namespace().unwrap_or_default());

        let mut attempt = 1;
        loop {
            match self.try_create_or_update(&api, secret).await {
                Ok(()) => return Ok(()),
                Err(e) if is_api_status(&e, 409) && attempt < SECRET_WRITE_ATTEMPTS => {
                    warn!(attempt, "conflict writing secret, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = namespaced(&self.client, namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_api_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ── pods ──

#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = namespaced(&self.client, namespace);
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }

    #[instrument(skip(self))]
    async fn evict(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = namespaced(&self.client, namespace);
        api.evict(name, &EvictParams::default()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = namespaced(&self.client, namespace);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}

// ── statefulsets ──

#[derive(Clone)]
pub struct KubeStatefulSetClient {
    client: Client,
}

impl KubeStatefulSetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatefulSetClient for KubeStatefulSetClient {
    async fn apply(&self, sts: &StatefulSet) -> Result<()> {
        let api: Api<StatefulSet> = namespaced(&self.client, &sts.namespace().unwrap_or_default());
        api.patch(
            &sts.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(sts),
        )
        .await?;
        Ok(())
    }
}

// ── status and metadata ──

/// Status and metadata writes for namespaced custom resources of kind `K`.
pub struct KubeObjectClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeObjectClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeObjectClient<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        namespaced(&self.client, namespace)
    }

    async fn json_patch(&self, namespace: &str, name: &str, patch: &json_patch::Patch, status: bool) -> Result<()> {
        let patch: Patch<()> = Patch::Json(patch.clone());
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let api = self.api(namespace);
        let result = if status {
            api.patch_status(name, &pp, &patch).await
        } else {
            api.patch(name, &pp, &patch).await
        };
        result.map_err(Error::from_patch_error)?;
        Ok(())
    }
}

#[async_trait]
impl<K> StatusClient<K> for KubeObjectClient<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn replace_status(&self, obj: &K) -> Result<()> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&obj.namespace().unwrap_or_default())
            .replace_status(&obj.name_any(), &pp, serde_json::to_vec(obj)?)
            .await?;
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, patch: &json_patch::Patch) -> Result<()> {
        self.json_patch(namespace, name, patch, true).await
    }
}

#[async_trait]
impl<K> MetadataClient<K> for KubeObjectClient<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn patch_metadata(&self, namespace: &str, name: &str, patch: &json_patch::Patch) -> Result<()> {
        self.json_patch(namespace, name, patch, false).await
    }
}

#[async_trait]
impl WorkloadStatusClient for KubeObjectClient<MetricsServer> {
    async fn update_status(&self, ms: &MetricsServer) -> Result<()> {
        let patch = json!({ "status": ms.status });
        self.api(&ms.namespace().unwrap_or_default())
            .patch_status(&ms.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
