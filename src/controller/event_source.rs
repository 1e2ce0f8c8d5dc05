//! Object caches fed by kube watchers
//!
//! An [`Informer`] keeps a local copy of every object of one kind in a kube
//! reflector store and turns the watcher stream into add/update/delete
//! notifications for its [`EventHandler`]s. A relist (the `Init` .. `InitDone`
//! sequence) is diffed against the store, so handlers see updates and
//! deletions missed while the watch was down instead of a raw replay.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};

use futures::{pin_mut, FutureExt, Stream, StreamExt};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::accessor::{meta_namespace_key, split_meta_namespace_key, ReconcileKey};
use super::resource_reconciler::EventHandler;
use crate::error::{Error, Result};

/// Local copy of the objects of one kind, addressed by `namespace/name`.
///
/// Reads go to the reflector [`Store`]; the matching writer is only driven
/// by the owning informer (and by tests seeding the cache).
pub struct ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Mutex<reflector::store::Writer<K>>,
}

impl<K> Default for ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let (store, writer) = reflector::store();
        Self {
            store,
            writer: Mutex::new(writer),
        }
    }
}

impl<K> ObjectCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Applies one watcher event. `InitApply` objects stay buffered until
    /// `InitDone` swaps them in.
    pub fn apply(&self, event: &Event<K>) {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply_watcher_event(event);
    }

    /// Inserts or replaces an object, returning the previous version.
    pub fn insert(&self, obj: K) -> Option<Arc<K>> {
        let old = self.store.get(&ObjectRef::from_obj(&obj));
        self.apply(&Event::Apply(obj));
        old
    }

    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        let old = self.get(key)?;
        self.apply(&Event::Delete((*old).clone()));
        Some(old)
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.store.get(&object_ref(key)?)
    }

    /// Every cached object, in key order.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.snapshot().into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Reader handle onto the same objects.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Whether the first complete list reached the store.
    pub fn has_synced(&self) -> bool {
        matches!(self.store.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    /// Resolves once the first complete list reached the store.
    pub async fn wait_until_ready(&self) {
        // The writer lives as long as self, so this can't fail.
        let _ = self.store.wait_until_ready().await;
    }

    fn snapshot(&self) -> BTreeMap<ReconcileKey, Arc<K>> {
        self.store
            .state()
            .into_iter()
            .map(|obj| (meta_namespace_key(obj.as_ref()), obj))
            .collect()
    }
}

fn object_ref<K>(key: &str) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let (namespace, name) = split_meta_namespace_key(key).ok()?;
    let obj_ref = ObjectRef::new(name);
    Some(match namespace {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    })
}

pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: String,
    cache: Arc<ObjectCache<K>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &str) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            cache: Arc::new(ObjectCache::default()),
            handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn cache(&self) -> &Arc<ObjectCache<K>> {
        &self.cache
    }

    pub fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }

    /// Resolves once the first list has been loaded into the cache.
    pub async fn wait_for_sync(&self) {
        self.cache.wait_until_ready().await
    }

    /// Registers a handler. It first receives an add for every cached object.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for obj in self.cache.list() {
            handler.on_add(&obj);
        }
        handlers.push(handler);
    }

    /// Applies one watcher event to the cache and notifies the handlers.
    pub fn handle(&self, event: Event<K>) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());

        match &event {
            Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.cache.store.get(&obj_ref);
                self.cache.apply(&event);
                let Some(new) = self.cache.store.get(&obj_ref) else {
                    return;
                };
                for h in handlers.iter() {
                    match &old {
                        Some(old) => h.on_update(old, &new),
                        None => h.on_add(&new),
                    }
                }
            }
            Event::Delete(obj) => {
                let old = self.cache.store.get(&ObjectRef::from_obj(obj));
                self.cache.apply(&event);
                let obj = old.unwrap_or_else(|| Arc::new(obj.clone()));
                for h in handlers.iter() {
                    h.on_delete(&obj);
                }
            }
            Event::Init => {
                debug!(kind = %self.kind, "relist started");
                self.cache.apply(&event);
            }
            Event::InitApply(_) => self.cache.apply(&event),
            Event::InitDone => {
                let first_sync = !self.cache.has_synced();
                let previous = self.cache.snapshot();
                self.cache.apply(&event);
                let fresh = self.cache.snapshot();

                for (key, new) in &fresh {
                    for h in handlers.iter() {
                        match previous.get(key) {
                            Some(old) => h.on_update(old, new),
                            None => h.on_add(new),
                        }
                    }
                }
                for (key, old) in &previous {
                    if !fresh.contains_key(key) {
                        for h in handlers.iter() {
                            h.on_delete(old);
                        }
                    }
                }

                if first_sync {
                    info!(kind = %self.kind, objects = fresh.len(), "Cache synced");
                }
            }
        }
    }

    /// Watches `api` until `shutdown` flips to true. Watch errors are retried
    /// with backoff; the stream ending on its own is an error, the cache
    /// stops following the cluster from then on.
    pub async fn run(&self, api: Api<K>, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(kind = %self.kind, "Starting informer");
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        self.consume(stream, shutdown).await
    }

    /// Feeds `stream` into the cache until shutdown or the end of the stream.
    pub async fn consume<S>(&self, stream: S, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>>,
    {
        pin_mut!(stream);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!(kind = %self.kind, error = %e, "watch failed"),
                    None => {
                        warn!(kind = %self.kind, "watch stream ended");
                        return Err(Error::WatchStreamEnded(self.kind.clone()));
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(kind = %self.kind, "Informer stopped");
        Ok(())
    }
}
