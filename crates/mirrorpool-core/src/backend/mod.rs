//! Storage backend clients
//!
//! [`PrimaryStore`] talks to the pool accounts and [`SecondaryStore`] to the
//! backup backend. Both report [`BackendError`], whose variant tells callers
//! whether a retry can help.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use mirrorpool_common::{AccountEndpoint, ObjectId};

pub use fs::{FsPrimaryStore, FsSecondaryStore};
pub use memory::{MemoryPrimaryStore, MemorySecondaryStore};

/// Stream of object bytes
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Error type for backend operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("permanent backend failure: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound(e.to_string()),
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                Self::Permanent(e.to_string())
            }
            _ => Self::Transient(e.to_string()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Client for the primary-storage accounts
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Cheap reachability check used by the health monitor
    async fn probe(&self, account: &AccountEndpoint) -> BackendResult<()>;

    /// Start storing `object_id`; returns the locator for later calls
    async fn begin(&self, account: &AccountEndpoint, object_id: ObjectId) -> BackendResult<String>;

    /// Append `data` at `offset`, which equals the bytes written so far
    async fn write_chunk(
        &self,
        account: &AccountEndpoint,
        locator: &str,
        offset: u64,
        data: Bytes,
    ) -> BackendResult<()>;

    /// Make the written object readable
    async fn complete(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()>;

    /// Discard a partially written object
    async fn abort(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()>;

    async fn open_read(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<ByteStream>;
}

/// Client for the backup backend
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Store the object; returns its backup locator
    ///
    /// Storing the same object twice must be harmless, since replication is
    /// retried at least once on transient faults.
    async fn put(&self, object_id: ObjectId, size_bytes: u64, data: ByteStream)
    -> BackendResult<String>;

    async fn get(&self, locator: &str) -> BackendResult<ByteStream>;
}

/// Drain a stream into memory
pub async fn collect(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
    use futures::StreamExt;

    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Reject locators that could escape a backend's namespace
pub(crate) fn check_locator(locator: &str) -> BackendResult<()> {
    if locator.is_empty()
        || locator.contains('/')
        || locator.contains('\\')
        || locator.starts_with('.')
    {
        return Err(BackendError::Permanent(format!("invalid locator {locator:?}")));
    }
    Ok(())
}
