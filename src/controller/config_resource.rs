//! Workload bindings in the status of configuration resources
//!
//! A configuration resource (e.g. a RuleGroup) can be selected by many
//! workloads at once, and every one of them writes its own binding into the
//! shared `status.bindings` array. There's no lock: the first binding is
//! written with a full status replace guarded by the resource version, and
//! every later change is a JSON patch whose `test` operations pin the array
//! index it targets. A writer that loses the race gets its patch rejected and
//! retries against fresh state through the reconcile error path.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation};
use jsonptr::Pointer;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::accessor::{meta_namespace_key, ReconcileKey};
use super::conditions::{equal_config_resource_conditions, CONDITION_TYPE_ACCEPTED};
use crate::crd::{Condition, ConditionStatus, RuleGroup, RuleGroupStatus, WorkloadBinding};
use crate::error::{Error, Result};

/// Writes to the status subresource of configuration resources of kind `C`.
///
/// Implementations must apply a patch atomically: if any `test` operation
/// fails, nothing is written and [`Error::PatchRejected`] is returned.
#[async_trait]
pub trait StatusClient<C>: Send + Sync {
    /// Replaces the status of `obj`. Fails with a conflict when the stored
    /// resource version differs from the one carried by `obj`.
    async fn replace_status(&self, obj: &C) -> Result<()>;

    async fn patch_status(&self, namespace: &str, name: &str, patch: &Patch) -> Result<()>;
}

/// A configuration resource which records workload bindings in its status.
pub trait ConfigurationObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn bindings(&self) -> &[WorkloadBinding];

    fn set_bindings(&mut self, bindings: Vec<WorkloadBinding>);
}

impl ConfigurationObject for RuleGroup {
    fn bindings(&self) -> &[WorkloadBinding] {
        self.status
            .as_ref()
            .map(|s| s.bindings.as_slice())
            .unwrap_or_default()
    }

    fn set_bindings(&mut self, bindings: Vec<WorkloadBinding>) {
        self.status
            .get_or_insert_with(RuleGroupStatus::default)
            .bindings = bindings;
    }
}

/// A selected configuration resource along with its validation outcome.
#[derive(Debug)]
pub struct TypedConfigurationResource<C> {
    pub resource: Arc<C>,
    /// Selection or validation error; `None` when the resource is valid.
    pub error: Option<Error>,
    /// Reason of the rejection, empty when accepted.
    pub reason: String,
    /// Generation of the resource spec which was validated.
    pub generation: i64,
}

impl<C> TypedConfigurationResource<C> {
    pub fn new(resource: Arc<C>, error: Option<Error>, reason: &str, generation: i64) -> Self {
        Self {
            resource,
            error,
            reason: reason.to_string(),
            generation,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// The binding conditions reported for this resource: a single `Accepted` condition.
    pub fn conditions(&self) -> Vec<Condition> {
        let (status, message) = match &self.error {
            None => (ConditionStatus::True, String::new()),
            Some(err) => (ConditionStatus::False, err.to_string()),
        };
        vec![
            Condition::new(CONDITION_TYPE_ACCEPTED, status, &self.reason, &message)
                .with_observed_generation(self.generation),
        ]
    }
}

/// Configuration resources selected by a workload, keyed by `namespace/name`.
#[derive(Debug)]
pub struct ResourcesSelection<C>(BTreeMap<ReconcileKey, TypedConfigurationResource<C>>);

impl<C> Default for ResourcesSelection<C> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<C> ResourcesSelection<C> {
    pub fn insert(&mut self, key: ReconcileKey, resource: TypedConfigurationResource<C>) {
        self.0.insert(key, resource);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&TypedConfigurationResource<C>> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReconcileKey, &TypedConfigurationResource<C>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Only the resources which passed validation.
    pub fn valid_resources(&self) -> BTreeMap<&str, &Arc<C>> {
        self.0
            .iter()
            .filter(|(_, r)| r.is_valid())
            .map(|(k, r)| (k.as_str(), &r.resource))
            .collect()
    }
}

/// Identity of the workload writing bindings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub group: String,
    /// Plural resource name
    pub resource: String,
}

impl WorkloadRef {
    pub fn of<W: Resource<DynamicType = ()>>(workload: &W) -> Self {
        Self {
            namespace: workload.namespace().unwrap_or_default(),
            name: workload.name_any(),
            group: W::group(&()).to_string(),
            resource: W::plural(&()).to_string(),
        }
    }
}

/// Maintains one workload's binding in configuration resources of kind `C`.
pub struct ConfigResourceSyncer<C> {
    workload: WorkloadRef,
    client: Arc<dyn StatusClient<C>>,
}

impl<C: ConfigurationObject> ConfigResourceSyncer<C> {
    pub fn new(workload: WorkloadRef, client: Arc<dyn StatusClient<C>>) -> Self {
        Self { workload, client }
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    /// Index of the workload's binding, if any.
    pub fn get_binding_index(&self, bindings: &[WorkloadBinding]) -> Option<usize> {
        bindings.iter().position(|b| {
            b.namespace == self.workload.namespace
                && b.name == self.workload.name
                && b.group == self.workload.group
                && b.resource == self.workload.resource
        })
    }

    fn new_binding(&self, conditions: &[Condition]) -> WorkloadBinding {
        WorkloadBinding {
            namespace: self.workload.namespace.clone(),
            name: self.workload.name.clone(),
            group: self.workload.group.clone(),
            resource: self.workload.resource.clone(),
            conditions: conditions.to_vec(),
        }
    }

    /// Operations asserting that the binding at index `i` still belongs to the workload.
    fn test_binding_exists(&self, i: usize) -> Vec<PatchOperation> {
        let index = i.to_string();
        [
            ("name", &self.workload.name),
            ("namespace", &self.workload.namespace),
            ("resource", &self.workload.resource),
            ("group", &self.workload.group),
        ]
        .into_iter()
        .map(|(field, value)| {
            PatchOperation::Test(TestOperation {
                path: Pointer::new(["status", "bindings", index.as_str(), field]),
                value: Value::String(value.clone()),
            })
        })
        .collect()
    }

    /// Patch creating or refreshing the binding. Empty when already up to date.
    pub fn update_binding_patch(
        &self,
        bindings: &[WorkloadBinding],
        conditions: &[Condition],
    ) -> Result<Patch> {
        let Some(i) = self.get_binding_index(bindings) else {
            return Ok(Patch(vec![PatchOperation::Add(AddOperation {
                path: Pointer::new(["status", "bindings", "-"]),
                value: serde_json::to_value(self.new_binding(conditions))?,
            })]));
        };

        if equal_config_resource_conditions(&bindings[i].conditions, conditions) {
            return Ok(Patch::default());
        }

        let mut ops = self.test_binding_exists(i);
        ops.push(PatchOperation::Replace(ReplaceOperation {
            path: Pointer::new(["status", "bindings", i.to_string().as_str(), "conditions"]),
            value: serde_json::to_value(conditions)?,
        }));
        Ok(Patch(ops))
    }

    /// Patch removing the binding. Empty when there's no binding.
    pub fn remove_binding_patch(&self, bindings: &[WorkloadBinding]) -> Patch {
        let Some(i) = self.get_binding_index(bindings) else {
            return Patch::default();
        };

        let mut ops = self.test_binding_exists(i);
        ops.push(PatchOperation::Remove(RemoveOperation {
            path: Pointer::new(["status", "bindings", i.to_string().as_str()]),
        }));
        Patch(ops)
    }

    /// Writes the workload's binding with the given conditions.
    ///
    /// No-op when the binding is already up to date.
    #[instrument(skip(self, config, conditions), fields(config = %meta_namespace_key(config), workload = %self.workload.name))]
    pub async fn update_binding(&self, config: &C, conditions: &[Condition]) -> Result<()> {
        let bindings = config.bindings();

        if bindings.is_empty() {
            // A full replace carries the resource version, so two workloads
            // racing to write the first binding can't overwrite each other.
            let mut obj = config.clone();
            obj.set_bindings(vec![self.new_binding(conditions)]);
            self.client.replace_status(&obj).await?;
            info!("Added first workload binding");
            return Ok(());
        }

        let patch = self.update_binding_patch(bindings, conditions)?;
        if patch.is_empty() {
            debug!("Workload binding is up to date");
            return Ok(());
        }

        self.client
            .patch_status(&config.namespace().unwrap_or_default(), &config.name_any(), &patch)
            .await?;
        info!("Updated workload binding");
        Ok(())
    }

    /// Removes the workload's binding. No-op when there's none.
    #[instrument(skip(self, config), fields(config = %meta_namespace_key(config), workload = %self.workload.name))]
    pub async fn remove_binding(&self, config: &C) -> Result<()> {
        let patch = self.remove_binding_patch(config.bindings());
        if patch.is_empty() {
            return Ok(());
        }

        self.client
            .patch_status(&config.namespace().unwrap_or_default(), &config.name_any(), &patch)
            .await?;
        info!("Removed workload binding");
        Ok(())
    }

    /// Removes the workload's binding from every resource of `all` which
    /// isn't part of `selection`. Stops at the first error.
    pub async fn cleanup_bindings<'a, I>(&self, all: I, selection: &ResourcesSelection<C>) -> Result<()>
    where
        I: IntoIterator<Item = &'a Arc<C>>,
    {
        for config in all {
            let key = meta_namespace_key(config.as_ref());
            if selection.contains_key(&key) {
                continue;
            }
            self.remove_binding(config).await?;
        }
        Ok(())
    }
}
