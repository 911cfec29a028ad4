//! Read routing with backup fallback
//!
//! A read goes to the object's primary account first. On any primary fault,
//! and only when the object has a backup copy, exactly one attempt is made
//! against the secondary backend. There are no further retries, and no
//! switch of source once the first chunk has been returned.

use crate::backend::{ByteStream, PrimaryStore, SecondaryStore};
use crate::metrics::ServiceMetrics;
use crate::pool::AccountPool;
use futures::StreamExt;
use mirrorpool_common::{Error, HealthState, ObjectId, ObjectMetadata, Result};
use mirrorpool_meta_store::ObjectMetaStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Which backend is serving a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Primary,
    Secondary,
}

impl ReadSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// An opened object read
pub struct ObjectRead {
    pub meta: ObjectMetadata,
    pub source: ReadSource,
    pub stream: ByteStream,
}

impl std::fmt::Debug for ObjectRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRead")
            .field("meta", &self.meta)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub struct ReadRouter {
    meta: Arc<dyn ObjectMetaStore>,
    pool: Arc<AccountPool>,
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    metrics: Arc<ServiceMetrics>,
    source_timeout: Duration,
}

impl ReadRouter {
    pub fn new(
        meta: Arc<dyn ObjectMetaStore>,
        pool: Arc<AccountPool>,
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<dyn SecondaryStore>,
        metrics: Arc<ServiceMetrics>,
        source_timeout: Duration,
    ) -> Self {
        Self {
            meta,
            pool,
            primary,
            secondary,
            metrics,
            source_timeout,
        }
    }

    /// Open `object_id` for streaming
    ///
    /// Fallback only covers faults up to the first chunk. Once that chunk is
    /// handed back the source is fixed, and a later stream error reaches the
    /// caller as-is; the caller restarts the read to try again.
    pub async fn read(&self, object_id: ObjectId) -> Result<ObjectRead> {
        let meta = self
            .meta
            .get(&object_id)?
            .ok_or(Error::ObjectNotFound(object_id))?;

        let primary_fault = match self.open_primary(&meta).await {
            Ok(stream) => {
                self.metrics.record_read_primary();
                return Ok(ObjectRead {
                    meta,
                    source: ReadSource::Primary,
                    stream,
                });
            }
            Err(reason) => reason,
        };

        let Some(backup_locator) = meta.backup_locator.clone() else {
            self.metrics.record_read_failed();
            return Err(Error::ReadFailed {
                primary: primary_fault,
                secondary: None,
            });
        };

        warn!(
            "Primary read of {} failed ({}), reading backup",
            object_id, primary_fault
        );
        match self.open_secondary(&backup_locator).await {
            Ok(stream) => {
                self.metrics.record_read_fallback();
                Ok(ObjectRead {
                    meta,
                    source: ReadSource::Secondary,
                    stream,
                })
            }
            Err(secondary_fault) => {
                error!(
                    "Read of {} failed on both sources: primary: {}; secondary: {}",
                    object_id, primary_fault, secondary_fault
                );
                self.metrics.record_read_failed();
                Err(Error::ReadFailed {
                    primary: primary_fault,
                    secondary: Some(secondary_fault),
                })
            }
        }
    }

    async fn open_primary(&self, meta: &ObjectMetadata) -> std::result::Result<ByteStream, String> {
        let account_id = &meta.primary_account_id;
        if meta.backup_locator.is_some()
            && self.pool.health_state(account_id) == Some(HealthState::Unavailable)
        {
            return Err(format!("account {account_id} is unavailable"));
        }
        let endpoint = self
            .pool
            .endpoint(account_id)
            .ok_or_else(|| format!("account {account_id} is not configured"))?;

        let opened = tokio::time::timeout(
            self.source_timeout,
            self.primary.open_read(&endpoint, &meta.primary_locator),
        )
        .await;
        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.pool.record_failure(account_id);
                }
                return Err(format!("account {account_id}: {e}"));
            }
            Err(_) => {
                self.pool.record_failure(account_id);
                return Err(format!(
                    "account {account_id}: no response within {:?}",
                    self.source_timeout
                ));
            }
        };

        match self.first_chunk(stream).await {
            Ok(stream) => Ok(stream),
            Err(reason) => {
                self.pool.record_failure(account_id);
                Err(format!("account {account_id}: {reason}"))
            }
        }
    }

    async fn open_secondary(&self, locator: &str) -> std::result::Result<ByteStream, String> {
        let stream = match tokio::time::timeout(self.source_timeout, self.secondary.get(locator)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("no response within {:?}", self.source_timeout)),
        };
        self.first_chunk(stream).await
    }

    /// Wait for the first chunk so a source that opens but cannot deliver
    /// still counts as failed before anything reaches the caller
    async fn first_chunk(&self, mut stream: ByteStream) -> std::result::Result<ByteStream, String> {
        match tokio::time::timeout(self.source_timeout, stream.next()).await {
            Ok(Some(Ok(first))) => {
                Ok(futures::stream::once(async move { Ok(first) })
                    .chain(stream)
                    .boxed())
            }
            Ok(Some(Err(e))) => Err(e.to_string()),
            Ok(None) => Ok(futures::stream::empty().boxed()),
            Err(_) => Err(format!("no data within {:?}", self.source_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryPrimaryStore, MemorySecondaryStore, collect};
    use bytes::Bytes;
    use mirrorpool_common::config::{AccountConfig, PoolConfig};
    use mirrorpool_common::{AccountId, OwnerId};
    use mirrorpool_meta_store::MemoryMetaStore;

    struct Harness {
        router: ReadRouter,
        meta: Arc<MemoryMetaStore>,
        pool: Arc<AccountPool>,
        primary: Arc<MemoryPrimaryStore>,
        secondary: Arc<MemorySecondaryStore>,
        metrics: Arc<ServiceMetrics>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(ServiceMetrics::new());
        let pool = Arc::new(
            AccountPool::new(
                &PoolConfig {
                    accounts: vec![AccountConfig {
                        id: "a".to_string(),
                        endpoint: "memory://a".to_string(),
                        secret: None,
                        quota_bytes: 1 << 20,
                    }],
                    ..PoolConfig::default()
                },
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let meta = Arc::new(MemoryMetaStore::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let router = ReadRouter::new(
            meta.clone(),
            Arc::clone(&pool),
            primary.clone(),
            secondary.clone(),
            Arc::clone(&metrics),
            Duration::from_secs(1),
        );
        Harness {
            router,
            meta,
            pool,
            primary,
            secondary,
            metrics,
        }
    }

    /// Store `data` on the primary and, when `backup` is set, on the secondary
    async fn stored(h: &Harness, data: &'static [u8], backup: bool) -> ObjectId {
        let object_id = ObjectId::new();
        let endpoint = h.pool.endpoint(&AccountId::new("a").unwrap()).unwrap();
        let locator = h.primary.begin(&endpoint, object_id).await.unwrap();
        h.primary
            .write_chunk(&endpoint, &locator, 0, Bytes::from_static(data))
            .await
            .unwrap();
        h.primary.complete(&endpoint, &locator).await.unwrap();

        let mut meta = ObjectMetadata::new_pending(
            object_id,
            OwnerId::new("alice").unwrap(),
            endpoint.account_id,
            locator,
            data.len() as u64,
        );
        if backup {
            let stream = futures::stream::iter(vec![Ok(Bytes::from_static(data))]).boxed();
            let backup_locator = h
                .secondary
                .put(object_id, data.len() as u64, stream)
                .await
                .unwrap();
            meta.mark_complete(backup_locator);
        }
        h.meta.put(&meta).unwrap();
        object_id
    }

    #[tokio::test]
    async fn test_reads_primary() {
        let h = harness();
        let id = stored(&h, b"primary bytes", true).await;

        let read = h.router.read(id).await.unwrap();
        assert_eq!(read.source, ReadSource::Primary);
        assert_eq!(collect(read.stream).await.unwrap(), b"primary bytes");
        assert_eq!(h.secondary.gets(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_once() {
        let h = harness();
        let id = stored(&h, b"from backup", true).await;
        h.primary.set_read_failing(true);

        let read = h.router.read(id).await.unwrap();
        assert_eq!(read.source, ReadSource::Secondary);
        assert_eq!(collect(read.stream).await.unwrap(), b"from backup");
        assert_eq!(h.secondary.gets(), 1);
        assert_eq!(h.metrics.reads_fallback(), 1);
    }

    #[tokio::test]
    async fn test_fault_after_first_chunk_does_not_fall_back() {
        let h = harness();
        let id = stored(&h, b"partial", true).await;
        h.primary.set_read_cut_short(true);

        let read = h.router.read(id).await.unwrap();
        assert_eq!(read.source, ReadSource::Primary);
        assert!(collect(read.stream).await.is_err());
        assert_eq!(h.secondary.gets(), 0);
        assert_eq!(h.metrics.reads_fallback(), 0);
    }

    #[tokio::test]
    async fn test_both_fail_names_both_sources() {
        let h = harness();
        let id = stored(&h, b"lost", true).await;
        h.primary.set_read_failing(true);
        h.secondary.set_get_failing(true);

        match h.router.read(id).await {
            Err(Error::ReadFailed { primary, secondary }) => {
                assert!(primary.contains("account a"));
                assert!(secondary.unwrap().contains("unreachable"));
            }
            other => panic!("expected ReadFailed, got {other:?}"),
        }
        assert_eq!(h.primary.reads_opened(), 1);
        assert_eq!(h.secondary.gets(), 1);
    }

    #[tokio::test]
    async fn test_no_backup_means_no_fallback() {
        let h = harness();
        let id = stored(&h, b"solo", false).await;
        h.primary.set_read_failing(true);

        assert!(matches!(
            h.router.read(id).await,
            Err(Error::ReadFailed {
                secondary: None,
                ..
            })
        ));
        assert_eq!(h.secondary.gets(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_primary_is_skipped() {
        let h = harness();
        let id = stored(&h, b"skip", true).await;
        let account = AccountId::new("a").unwrap();
        for _ in 0..3 {
            h.pool.record_probe(&account, false);
        }

        let read = h.router.read(id).await.unwrap();
        assert_eq!(read.source, ReadSource::Secondary);
        assert_eq!(h.primary.reads_opened(), 0);
    }

    #[tokio::test]
    async fn test_primary_failures_feed_health() {
        let h = harness();
        let id = stored(&h, b"x", false).await;
        h.primary.set_read_failing(true);
        let _ = h.router.read(id).await;
        assert_eq!(
            h.pool.health_state(&AccountId::new("a").unwrap()),
            Some(HealthState::Degraded)
        );
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let h = harness();
        assert!(matches!(
            h.router.read(ObjectId::new()).await,
            Err(Error::ObjectNotFound(_))
        ));
    }
}
