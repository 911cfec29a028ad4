//! Filesystem backends
//!
//! Each primary account's endpoint names a directory (optionally prefixed
//! with `file://`). Objects are written to `<id>.part` and renamed into place
//! on completion, so readers never see a partial object.

use super::{BackendError, BackendResult, ByteStream, PrimaryStore, SecondaryStore, check_locator};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mirrorpool_common::{AccountEndpoint, ObjectId};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const PART_SUFFIX: &str = ".part";

fn account_root(account: &AccountEndpoint) -> PathBuf {
    let endpoint = account.endpoint.as_str();
    PathBuf::from(endpoint.strip_prefix("file://").unwrap_or(endpoint))
}

fn part_path(root: &Path, locator: &str) -> PathBuf {
    root.join(format!("{locator}{PART_SUFFIX}"))
}

async fn open_stream(path: &Path) -> BackendResult<ByteStream> {
    let file = fs::File::open(path).await?;
    Ok(ReaderStream::new(file).boxed())
}

/// Primary store writing each account's objects under its own directory
#[derive(Debug, Default, Clone)]
pub struct FsPrimaryStore;

impl FsPrimaryStore {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PrimaryStore for FsPrimaryStore {
    async fn probe(&self, account: &AccountEndpoint) -> BackendResult<()> {
        let root = account_root(account);
        fs::create_dir_all(&root).await?;
        let metadata = fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(BackendError::Permanent(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(())
    }

    async fn begin(&self, account: &AccountEndpoint, object_id: ObjectId) -> BackendResult<String> {
        let root = account_root(account);
        fs::create_dir_all(&root).await?;
        let locator = object_id.to_string();
        fs::File::create(part_path(&root, &locator)).await?;
        Ok(locator)
    }

    async fn write_chunk(
        &self,
        account: &AccountEndpoint,
        locator: &str,
        offset: u64,
        data: Bytes,
    ) -> BackendResult<()> {
        check_locator(locator)?;
        let path = part_path(&account_root(account), locator);
        let mut file = OpenOptions::new().append(true).open(&path).await?;

        let current = file.metadata().await?.len();
        if current != offset {
            return Err(BackendError::Permanent(format!(
                "write at {offset} but {} holds {current} bytes",
                path.display()
            )));
        }
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn complete(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()> {
        check_locator(locator)?;
        let root = account_root(account);
        let file = OpenOptions::new()
            .write(true)
            .open(part_path(&root, locator))
            .await?;
        file.sync_all().await?;
        fs::rename(part_path(&root, locator), root.join(locator)).await?;
        Ok(())
    }

    async fn abort(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()> {
        check_locator(locator)?;
        match fs::remove_file(part_path(&account_root(account), locator)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<ByteStream> {
        check_locator(locator)?;
        open_stream(&account_root(account).join(locator)).await
    }
}

/// Backup store writing objects under a single directory
#[derive(Debug, Clone)]
pub struct FsSecondaryStore {
    root: PathBuf,
}

impl FsSecondaryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecondaryStore for FsSecondaryStore {
    async fn put(
        &self,
        object_id: ObjectId,
        size_bytes: u64,
        mut data: ByteStream,
    ) -> BackendResult<String> {
        fs::create_dir_all(&self.root).await?;
        let locator = object_id.to_string();
        let tmp = part_path(&self.root, &locator);

        let mut file = fs::File::create(&tmp).await?;
        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|e| BackendError::Transient(format!("source stream: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        if written != size_bytes {
            drop(file);
            let _ = fs::remove_file(&tmp).await;
            return Err(BackendError::Transient(format!(
                "short stream: {written} of {size_bytes} bytes"
            )));
        }
        file.sync_all().await?;
        fs::rename(&tmp, self.root.join(&locator)).await?;

        debug!("Stored backup of {} ({} bytes)", object_id, written);
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> BackendResult<ByteStream> {
        check_locator(locator)?;
        open_stream(&self.root.join(locator)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::collect;
    use mirrorpool_common::AccountId;

    fn endpoint(root: &Path) -> AccountEndpoint {
        AccountEndpoint {
            account_id: AccountId::new("local").unwrap(),
            endpoint: format!("file://{}", root.display()),
            secret: None,
        }
    }

    #[tokio::test]
    async fn test_primary_roundtrip_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let account = endpoint(&dir.path().join("acct"));
        let store = FsPrimaryStore::new();
        store.probe(&account).await.unwrap();

        let locator = store.begin(&account, ObjectId::new()).await.unwrap();
        store
            .write_chunk(&account, &locator, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let err = store
            .write_chunk(&account, &locator, 1, Bytes::from_static(b"zz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Permanent(_)));

        assert!(matches!(
            store.open_read(&account, &locator).await,
            Err(BackendError::NotFound(_))
        ));
        store.complete(&account, &locator).await.unwrap();
        let data = collect(store.open_read(&account, &locator).await.unwrap())
            .await
            .unwrap();
        assert_eq!(data, b"abc");

        let other = store.begin(&account, ObjectId::new()).await.unwrap();
        store.abort(&account, &other).await.unwrap();
        store.abort(&account, &other).await.unwrap();
    }

    #[tokio::test]
    async fn test_secondary_put_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSecondaryStore::new(dir.path().join("backup"));
        let id = ObjectId::new();

        for _ in 0..2 {
            let stream = futures::stream::iter(vec![
                Ok(Bytes::from_static(b"hello ")),
                Ok(Bytes::from_static(b"backup")),
            ])
            .boxed();
            let locator = store.put(id, 12, stream).await.unwrap();
            assert_eq!(locator, id.to_string());
        }

        let data = collect(store.get(&id.to_string()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(data, b"hello backup");
        assert!(store.get("../escape").await.is_err());
    }
}
