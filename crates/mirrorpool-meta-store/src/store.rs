//! Persistent metadata store backed by redb.
//!
//! Every write is its own write transaction followed by a commit, so a
//! returned `Ok` means the record is durable.

use crate::ObjectMetaStore;
use crate::tables;
use mirrorpool_common::{AccountId, ObjectId, ObjectMetadata, ReplicationState};
use redb::{Database, ReadableTable};
use std::collections::HashMap;
use std::path::Path;
use tracing::error;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for mirrorpool_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::MetadataStore(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct RedbMetaStore {
    db: Database,
}

impl RedbMetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::OBJECTS)?;
            let _t = write_txn.open_table(tables::ACCOUNT_USAGE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn load_objects(&self) -> MetaStoreResult<Vec<ObjectMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::OBJECTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<ObjectMetadata>(entry.1.value()) {
                Ok(meta) => result.push(meta),
                Err(e) => error!("Failed to decode object '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}

impl ObjectMetaStore for RedbMetaStore {
    fn get(&self, object_id: &ObjectId) -> MetaStoreResult<Option<ObjectMetadata>> {
        let key = object_id.to_string();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::OBJECTS)?;
        match table.get(key.as_str())? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, meta: &ObjectMetadata) -> MetaStoreResult<()> {
        let key = meta.object_id.to_string();
        let bytes = bincode::serialize(meta)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::OBJECTS)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, object_id: &ObjectId) -> MetaStoreResult<()> {
        let key = object_id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::OBJECTS)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_by_state(&self, state: ReplicationState) -> MetaStoreResult<Vec<ObjectMetadata>> {
        Ok(self
            .load_objects()?
            .into_iter()
            .filter(|meta| meta.replication_state == state)
            .collect())
    }

    fn put_account_usage(&self, account_id: &AccountId, used_bytes: u64) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ACCOUNT_USAGE)?;
            table.insert(account_id.as_str(), used_bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_account_usage(&self) -> MetaStoreResult<HashMap<AccountId, u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ACCOUNT_USAGE)?;
        let mut result = HashMap::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match AccountId::new(key.as_str()) {
                Ok(id) => {
                    result.insert(id, entry.1.value());
                }
                Err(e) => error!("Skipping usage row for invalid account '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}
