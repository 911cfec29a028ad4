//! In-memory metadata store for development and tests.

use crate::ObjectMetaStore;
use crate::store::{MetaStoreError, MetaStoreResult};
use mirrorpool_common::{AccountId, ObjectId, ObjectMetadata, ReplicationState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Metadata store holding everything in process memory
#[derive(Default)]
pub struct MemoryMetaStore {
    objects: RwLock<HashMap<ObjectId, ObjectMetadata>>,
    usage: RwLock<HashMap<AccountId, u64>>,
    fail_writes: AtomicBool,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn check_writable(&self) -> MetaStoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl ObjectMetaStore for MemoryMetaStore {
    fn get(&self, object_id: &ObjectId) -> MetaStoreResult<Option<ObjectMetadata>> {
        Ok(self.objects.read().get(object_id).cloned())
    }

    fn put(&self, meta: &ObjectMetadata) -> MetaStoreResult<()> {
        self.check_writable()?;
        self.objects.write().insert(meta.object_id, meta.clone());
        Ok(())
    }

    fn delete(&self, object_id: &ObjectId) -> MetaStoreResult<()> {
        self.check_writable()?;
        self.objects.write().remove(object_id);
        Ok(())
    }

    fn list_by_state(&self, state: ReplicationState) -> MetaStoreResult<Vec<ObjectMetadata>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|meta| meta.replication_state == state)
            .cloned()
            .collect())
    }

    fn put_account_usage(&self, account_id: &AccountId, used_bytes: u64) -> MetaStoreResult<()> {
        self.check_writable()?;
        self.usage.write().insert(account_id.clone(), used_bytes);
        Ok(())
    }

    fn load_account_usage(&self) -> MetaStoreResult<HashMap<AccountId, u64>> {
        Ok(self.usage.read().clone())
    }
}
