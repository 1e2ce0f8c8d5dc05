//! Secret data sharded across several Secrets
//!
//! A single Secret can't exceed 1 MiB. Rule files of a MetricsServer may be
//! bigger, so the data is packed into as many `<template>-<i>` Secrets as
//! needed and mounted back together through a projected volume.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ProjectedVolumeSource, Secret, SecretProjection, Volume, VolumeProjection,
};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::error::Result;

/// Maximum size of a Secret accepted by the API server
pub const MAX_SECRET_SIZE: usize = 1024 * 1024;

/// Data bytes a single shard may hold. Lower than [`MAX_SECRET_SIZE`] to
/// leave room for the object metadata.
pub const MAX_SHARD_BYTES: usize = MAX_SECRET_SIZE - 50_000;

/// Storage backing the shards.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Creates the secret, or updates it in place when it already exists.
    async fn create_or_update(&self, secret: &Secret) -> Result<()>;

    /// Deletes a secret. Returns false when it doesn't exist.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
}

#[derive(Clone, Debug)]
pub struct ShardedSecret {
    template: Secret,
    data: BTreeMap<String, Vec<u8>>,
    max_shard_bytes: usize,
    shards: Vec<Secret>,
}

impl ShardedSecret {
    /// `template` provides the name prefix, namespace, labels and owner
    /// references of every shard; its own data is ignored.
    pub fn new(template: Secret, data: BTreeMap<String, Vec<u8>>) -> Self {
        Self::with_max_shard_bytes(template, data, MAX_SHARD_BYTES)
    }

    pub fn with_max_shard_bytes(
        template: Secret,
        data: BTreeMap<String, Vec<u8>>,
        max_shard_bytes: usize,
    ) -> Self {
        Self {
            template,
            data,
            max_shard_bytes,
            shards: Vec::new(),
        }
    }

    fn secret_name_at(&self, index: usize) -> String {
        format!("{}-{index}", self.template.name_any())
    }

    fn new_secret_at(&self, index: usize) -> Secret {
        let mut secret = self.template.clone();
        secret.metadata.name = Some(self.secret_name_at(index));
        secret.metadata.resource_version = None;
        secret.data = Some(BTreeMap::new());
        secret.string_data = None;
        secret
    }

    /// Packs the data into shards, replacing the previous result.
    ///
    /// Keys are visited in sorted order so the same data always yields the
    /// same shards. A key/value pair bigger than the shard size gets a shard
    /// of its own. There is always at least one shard, possibly empty.
    pub fn shard(&mut self) -> &[Secret] {
        let mut shards = Vec::new();
        let mut current = self.new_secret_at(0);
        let mut current_size = 0;

        for (key, value) in &self.data {
            let size = key.len() + value.len();
            if current_size > 0 && current_size + size > self.max_shard_bytes {
                shards.push(current);
                current = self.new_secret_at(shards.len());
                current_size = 0;
            }

            current_size += size;
            current
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(key.clone(), ByteString(value.clone()));
        }
        shards.push(current);

        self.shards = shards;
        &self.shards
    }

    /// Writes every shard and deletes the shards left over from a bigger
    /// data set.
    #[instrument(skip(self, store), fields(secret = %self.template.name_any()))]
    pub async fn update_secrets(&mut self, store: &dyn SecretStore) -> Result<()> {
        self.shard();

        for secret in &self.shards {
            store.create_or_update(secret).await?;
        }
        debug!(shards = self.shards.len(), "Secret shards written");

        self.cleanup_excess_secret_shards(store, self.shards.len()).await
    }

    /// Deletes `<template>-<first>`, `<template>-<first+1>`, ... until one is missing.
    pub async fn cleanup_excess_secret_shards(
        &self,
        store: &dyn SecretStore,
        first: usize,
    ) -> Result<()> {
        let namespace = self.template.namespace().unwrap_or_default();
        for index in first.. {
            let name = self.secret_name_at(index);
            if !store.delete(&namespace, &name).await? {
                break;
            }
            info!(secret = %name, "Deleted excess secret shard");
        }
        Ok(())
    }

    /// Shards computed by the last call to [`ShardedSecret::shard`].
    pub fn shards(&self) -> &[Secret] {
        &self.shards
    }

    /// Changes whenever the number of shards does, so the pod template
    /// rolls when shards come and go.
    pub fn hash(&self) -> u64 {
        self.shards.len() as u64
    }

    /// Projected volume mounting every shard. Only meaningful after
    /// [`ShardedSecret::update_secrets`].
    pub fn volume(&self, name: &str) -> Volume {
        let sources = (0..self.shards.len())
            .map(|i| VolumeProjection {
                secret: Some(SecretProjection {
                    name: Some(self.secret_name_at(i)),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        Volume {
            name: name.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(sources),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Shards `data` according to `template` and writes the result.
pub async fn reconcile_sharded_secret(
    store: &dyn SecretStore,
    template: Secret,
    data: BTreeMap<String, Vec<u8>>,
) -> Result<ShardedSecret> {
    let mut sharded = ShardedSecret::new(template, data);
    sharded.update_secrets(store).await?;
    Ok(sharded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fakes::FakeSecretStore;
    use kube::api::ObjectMeta;

    fn template() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("main-rulefiles".to_string()),
                namespace: Some("monitoring".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn data(entries: &[(&str, usize)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, size)| (k.to_string(), vec![b'x'; *size]))
            .collect()
    }

    fn shard_keys(shards: &[Secret]) -> Vec<Vec<String>> {
        shards
            .iter()
            .map(|s| s.data.clone().unwrap_or_default().into_keys().collect())
            .collect()
    }

    fn shard_size(secret: &Secret) -> usize {
        secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| k.len() + v.0.len())
            .sum()
    }

    #[test]
    fn test_two_big_entries_need_two_shards() {
        let mut sharded = ShardedSecret::with_max_shard_bytes(
            template(),
            data(&[("a", 40_000), ("b", 40_000)]),
            50_000,
        );
        let shards = sharded.shard();
        assert_eq!(shard_keys(shards), vec![vec!["a"], vec!["b"]]);
        assert_eq!(shards[0].name_any(), "main-rulefiles-0");
        assert_eq!(shards[1].name_any(), "main-rulefiles-1");
    }

    #[test]
    fn test_small_entries_share_a_shard() {
        let mut sharded =
            ShardedSecret::with_max_shard_bytes(template(), data(&[("a", 10), ("b", 10)]), 50_000);
        assert_eq!(shard_keys(sharded.shard()), vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_empty_data_yields_one_shard() {
        let mut sharded = ShardedSecret::new(template(), BTreeMap::new());
        let shards = sharded.shard();
        assert_eq!(shards.len(), 1);
        assert!(shards[0].data.as_ref().is_some_and(|d| d.is_empty()));
    }

    #[test]
    fn test_oversized_entry_gets_its_own_shard() {
        let mut sharded = ShardedSecret::with_max_shard_bytes(
            template(),
            data(&[("a", 60_000), ("b", 10), ("c", 10)]),
            50_000,
        );
        assert_eq!(shard_keys(sharded.shard()), vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn test_sharding_is_deterministic_and_bounded() {
        let entries: Vec<(String, usize)> = (0..50)
            .map(|i| (format!("rule-{:02}", (i * 37) % 50), 1_000 + (i * 613) % 9_000))
            .collect();
        let as_refs: Vec<(&str, usize)> = entries.iter().map(|(k, s)| (k.as_str(), *s)).collect();
        let mut reversed = as_refs.clone();
        reversed.reverse();

        let mut first = ShardedSecret::with_max_shard_bytes(template(), data(&as_refs), 20_000);
        let mut second = ShardedSecret::with_max_shard_bytes(template(), data(&reversed), 20_000);
        let a = first.shard().to_vec();
        let b = second.shard().to_vec();

        assert_eq!(a, b);
        assert!(a.len() > 1);
        assert!(a.iter().all(|s| shard_size(s) <= 20_000));
    }

    #[test]
    fn test_volume_projects_every_shard() {
        let mut sharded = ShardedSecret::with_max_shard_bytes(
            template(),
            data(&[("a", 40_000), ("b", 40_000)]),
            50_000,
        );
        sharded.shard();
        let volume = sharded.volume("rules");
        let sources = volume.projected.unwrap().sources.unwrap();
        let names: Vec<String> = sources
            .into_iter()
            .filter_map(|s| s.secret.and_then(|s| s.name))
            .collect();
        assert_eq!(names, vec!["main-rulefiles-0", "main-rulefiles-1"]);
        assert_eq!(sharded.hash(), 2);
    }

    #[tokio::test]
    async fn test_update_secrets_removes_excess_shards() {
        let store = FakeSecretStore::default();

        let mut big = ShardedSecret::with_max_shard_bytes(
            template(),
            data(&[("a", 40_000), ("b", 40_000), ("c", 40_000)]),
            50_000,
        );
        big.update_secrets(&store).await.unwrap();
        assert_eq!(
            store.names(),
            vec!["main-rulefiles-0", "main-rulefiles-1", "main-rulefiles-2"]
        );

        let mut small =
            ShardedSecret::with_max_shard_bytes(template(), data(&[("a", 10)]), 50_000);
        small.update_secrets(&store).await.unwrap();
        assert_eq!(store.names(), vec!["main-rulefiles-0"]);
        let stored = store.get("monitoring", "main-rulefiles-0").unwrap();
        assert_eq!(stored.data.unwrap().len(), 1);
    }
}
