//! mirrorpool Metadata Store - durable object records
//!
//! This crate defines the [`ObjectMetaStore`] interface consumed by the
//! upload, replication and read paths, with an in-memory implementation and
//! a redb-backed one.

pub mod memory;
pub mod store;
pub mod tables;

use mirrorpool_common::{AccountId, ObjectId, ObjectMetadata, ReplicationState};
use std::collections::HashMap;

// Re-exports
pub use memory::MemoryMetaStore;
pub use store::{MetaStoreError, MetaStoreResult, RedbMetaStore};

/// Durable get/put for object metadata and per-account quota usage
pub trait ObjectMetaStore: Send + Sync {
    fn get(&self, object_id: &ObjectId) -> MetaStoreResult<Option<ObjectMetadata>>;

    fn put(&self, meta: &ObjectMetadata) -> MetaStoreResult<()>;

    fn delete(&self, object_id: &ObjectId) -> MetaStoreResult<()>;

    /// All objects currently in `state`
    fn list_by_state(&self, state: ReplicationState) -> MetaStoreResult<Vec<ObjectMetadata>>;

    /// Persist the used bytes of an account's quota
    fn put_account_usage(&self, account_id: &AccountId, used_bytes: u64) -> MetaStoreResult<()>;

    fn load_account_usage(&self) -> MetaStoreResult<HashMap<AccountId, u64>>;
}
