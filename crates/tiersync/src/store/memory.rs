//! In-process object store.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ObjectStore, RemoteObject, StorageTier, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    tier: StorageTier,
    content_type: String,
}

/// A mutation applied to a `MemoryStore`, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put { key: String, size: u64, tier: StorageTier },
    Copy { source: String, dest: String, tier: StorageTier },
    Delete { key: String },
}

#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
    ops: Mutex<Vec<StoreOp>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording an operation.
    pub fn insert(&self, key: &str, body: Vec<u8>, tier: StorageTier) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                tier,
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, StorageTier)> {
        self.objects
            .get(key)
            .map(|o| (o.body.clone(), o.tier))
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|o| o.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn record(&self, op: StoreOp) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let mut objects: Vec<RemoteObject> = self
            .objects
            .iter()
            .filter(|o| o.key().starts_with(prefix))
            .map(|o| RemoteObject {
                key: o.key().clone(),
                size: o.body.len() as u64,
                storage_class: Some(o.tier.as_str().to_string()),
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        tier: StorageTier,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.record(StoreOp::Put {
            key: key.to_string(),
            size: body.len() as u64,
            tier,
        });
        self.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                tier,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn copy(
        &self,
        source_key: &str,
        dest_key: &str,
        tier: StorageTier,
    ) -> Result<(), StoreError> {
        let source = self
            .objects
            .get(source_key)
            .map(|o| o.value().clone())
            .ok_or_else(|| StoreError::NotFound(source_key.to_string()))?;
        self.record(StoreOp::Copy {
            source: source_key.to_string(),
            dest: dest_key.to_string(),
            tier,
        });
        self.objects
            .insert(dest_key.to_string(), StoredObject { tier, ..source });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.record(StoreOp::Delete {
            key: key.to_string(),
        });
        self.objects.remove(key);
        Ok(())
    }
}
