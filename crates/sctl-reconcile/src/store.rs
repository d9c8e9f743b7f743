//! # Source Store
//!
//! Where declared sources are read from and status is written back to.
//! In a cluster this is the API server; [`InMemorySourceStore`] serves
//! local mode (sources loaded from a manifest) and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use sctl_core::{ObjectRef, ResourceKind, SourceObject, SourceStatus};

use crate::error::StoreError;

/// Capacity of the change-notification channel.
const WATCH_CAPACITY: usize = 1024;

/// Access to declared sources and their status.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Current state of `id`, or `None` if it does not exist.
    async fn get(&self, id: &ObjectRef) -> Result<Option<SourceObject>, StoreError>;

    /// Identities of every object of `kind`.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObjectRef>, StoreError>;

    /// Replace the status of `id`.
    async fn publish_status(&self, id: &ObjectRef, status: SourceStatus) -> Result<(), StoreError>;

    /// Notifications of objects whose spec or existence changed.
    fn subscribe(&self) -> broadcast::Receiver<ObjectRef>;
}

/// Process-local source store.
pub struct InMemorySourceStore {
    objects: RwLock<BTreeMap<ObjectRef, SourceObject>>,
    changes: broadcast::Sender<ObjectRef>,
}

impl Default for InMemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySourceStore {
    /// An empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Create or update an object from its declaration.
    ///
    /// A changed spec bumps the generation; status is preserved.
    pub fn apply(&self, object: SourceObject) {
        let id = object.id.clone();
        let changed = {
            let mut objects = self.objects.write();
            match objects.get_mut(&id) {
                Some(existing) if existing.spec == object.spec => false,
                Some(existing) => {
                    existing.spec = object.spec;
                    existing.generation += 1;
                    existing.deletion_requested = false;
                    true
                }
                None => {
                    objects.insert(id.clone(), object);
                    true
                }
            }
        };
        if changed {
            self.notify(id);
        }
    }

    /// Mark `id` for deletion; it stays readable until [`Self::remove`].
    pub fn request_deletion(&self, id: &ObjectRef) {
        let found = match self.objects.write().get_mut(id) {
            Some(obj) => {
                obj.deletion_requested = true;
                true
            }
            None => false,
        };
        if found {
            self.notify(id.clone());
        }
    }

    /// Remove `id` entirely.
    pub fn remove(&self, id: &ObjectRef) -> Option<SourceObject> {
        let removed = self.objects.write().remove(id);
        if removed.is_some() {
            self.notify(id.clone());
        }
        removed
    }

    /// Snapshot of one object.
    pub fn snapshot(&self, id: &ObjectRef) -> Option<SourceObject> {
        self.objects.read().get(id).cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn notify(&self, id: ObjectRef) {
        // No receivers is fine: nothing is watching yet.
        let _ = self.changes.send(id);
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn get(&self, id: &ObjectRef) -> Result<Option<SourceObject>, StoreError> {
        Ok(self.snapshot(id))
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObjectRef>, StoreError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|id| id.kind() == kind)
            .cloned()
            .collect())
    }

    async fn publish_status(&self, id: &ObjectRef, status: SourceStatus) -> Result<(), StoreError> {
        let mut objects = self.objects.write();
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        obj.status = status;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectRef> {
        self.changes.subscribe()
    }
}
