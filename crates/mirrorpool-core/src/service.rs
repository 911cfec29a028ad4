//! Storage service lifecycle
//!
//! [`StorageService`] wires the components together from explicit
//! dependencies, owns the background tasks, and drains on shutdown.

use crate::admission::AdmissionController;
use crate::backend::{PrimaryStore, SecondaryStore};
use crate::budget::BudgetTracker;
use crate::health::HealthMonitor;
use crate::metrics::{ServiceMetrics, write_metric};
use crate::pool::AccountPool;
use crate::read::{ObjectRead, ReadRouter};
use crate::replication::{ReplicationQueue, ReplicationWorkers};
use crate::session::{InitiatedUpload, UploadChannel, UploadCoordinator, UploadProgress};
use bytes::Bytes;
use mirrorpool_common::{
    AccountRecord, Config, HealthState, ObjectId, ObjectMetadata, OwnerId, ReplicationState,
    Result,
};
use mirrorpool_meta_store::ObjectMetaStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External collaborators the service is built from
pub struct ServiceDeps {
    pub primary: Arc<dyn PrimaryStore>,
    pub secondary: Arc<dyn SecondaryStore>,
    pub meta: Arc<dyn ObjectMetaStore>,
    pub budget: Arc<dyn BudgetTracker>,
}

/// Operator view of the service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub accounts: Vec<AccountRecord>,
    pub active_uploads: usize,
    pub reserved_memory_bytes: u64,
    pub replication_backlog: usize,
    pub failed_replications: Vec<ObjectId>,
    pub draining: bool,
}

pub struct StorageService {
    config: Config,
    metrics: Arc<ServiceMetrics>,
    admission: Arc<AdmissionController>,
    pool: Arc<AccountPool>,
    uploads: UploadCoordinator,
    reads: ReadRouter,
    replication: Arc<ReplicationQueue>,
    meta: Arc<dyn ObjectMetaStore>,
    background: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl StorageService {
    /// Build every component and start the background tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: Config, deps: ServiceDeps) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ServiceMetrics::new());

        let pool = Arc::new(AccountPool::new(&config.pool, Arc::clone(&metrics))?);
        pool.restore_usage(&deps.meta.load_account_usage()?);

        let admission = Arc::new(AdmissionController::new(
            config.admission.clone(),
            deps.budget,
            Arc::clone(&metrics),
        ));

        let replication = Arc::new(ReplicationQueue::new());
        let workers = Arc::new(ReplicationWorkers::new(
            Arc::clone(&replication),
            Arc::clone(&deps.meta),
            Arc::clone(&pool),
            Arc::clone(&deps.primary),
            Arc::clone(&deps.secondary),
            Arc::clone(&metrics),
            config.replication.clone(),
        ));
        workers.recover()?;

        let uploads = UploadCoordinator::new(
            Arc::clone(&admission),
            Arc::clone(&pool),
            Arc::clone(&deps.primary),
            Arc::clone(&deps.meta),
            Arc::clone(&replication),
            Arc::clone(&metrics),
            config.upload.clone(),
        );
        let reads = ReadRouter::new(
            Arc::clone(&deps.meta),
            Arc::clone(&pool),
            Arc::clone(&deps.primary),
            deps.secondary,
            Arc::clone(&metrics),
            config.read.source_timeout(),
        );

        let background = CancellationToken::new();
        let mut tasks = workers.spawn(&background);
        let monitor = HealthMonitor::new(
            Arc::clone(&pool),
            deps.primary,
            config.pool.probe_interval(),
            config.pool.probe_timeout(),
        );
        tasks.spawn(monitor.run(background.clone()));

        info!(
            "Storage service started: {} accounts, {} replication workers",
            config.pool.accounts.len(),
            workers.worker_count()
        );
        Ok(Self {
            config,
            metrics,
            admission,
            pool,
            uploads,
            reads,
            replication,
            meta: deps.meta,
            background,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub async fn initiate_upload(
        &self,
        owner_id: &OwnerId,
        declared_size_bytes: u64,
    ) -> Result<InitiatedUpload> {
        self.uploads
            .initiate_upload(owner_id, declared_size_bytes)
            .await
    }

    pub async fn upload_chunk(&self, object_id: ObjectId, offset: u64, data: Bytes) -> Result<u64> {
        self.uploads.upload_chunk(object_id, offset, data).await
    }

    pub async fn complete_upload(&self, object_id: ObjectId) -> Result<ObjectMetadata> {
        self.uploads.complete_upload(object_id).await
    }

    pub async fn cancel_upload(&self, object_id: ObjectId) -> Result<()> {
        self.uploads.cancel_upload(object_id).await
    }

    pub fn upload_channel(&self, object_id: ObjectId) -> Result<UploadChannel> {
        self.uploads.channel(object_id)
    }

    pub fn upload_progress(&self, object_id: ObjectId) -> Result<UploadProgress> {
        self.uploads.upload_progress(object_id)
    }

    pub async fn stream_download(&self, object_id: ObjectId) -> Result<ObjectRead> {
        self.reads.read(object_id).await
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        let failed_replications = self
            .meta
            .list_by_state(ReplicationState::Failed)?
            .into_iter()
            .map(|meta| meta.object_id)
            .collect();
        Ok(ServiceStatus {
            accounts: self.pool.snapshot(),
            active_uploads: self.admission.active_count(),
            reserved_memory_bytes: self.admission.reserved_bytes(),
            replication_backlog: self.replication.backlog(),
            failed_replications,
            draining: self.admission.is_draining(),
        })
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Counters plus live gauges in Prometheus text format
    pub fn export_metrics(&self) -> String {
        let mut output = self.metrics.export_prometheus();

        write_metric(
            &mut output,
            "mirrorpool_active_uploads",
            "Upload sessions holding an admission slot",
            "gauge",
            self.admission.active_count() as u64,
        );
        write_metric(
            &mut output,
            "mirrorpool_reserved_memory_bytes",
            "Memory reserved by active uploads",
            "gauge",
            self.admission.reserved_bytes(),
        );
        write_metric(
            &mut output,
            "mirrorpool_replication_backlog",
            "Objects queued, backing off or being replicated",
            "gauge",
            self.replication.backlog() as u64,
        );

        let accounts = self.pool.snapshot();
        let _ = writeln!(
            output,
            "# HELP mirrorpool_account_health Account health (2 healthy, 1 degraded, 0 unavailable)"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_account_health gauge");
        for record in &accounts {
            let value = match record.health_state {
                HealthState::Healthy => 2,
                HealthState::Degraded => 1,
                HealthState::Unavailable => 0,
            };
            let _ = writeln!(
                output,
                "mirrorpool_account_health{{account=\"{}\"}} {value}",
                record.account_id
            );
        }
        let _ = writeln!(
            output,
            "# HELP mirrorpool_account_sessions Open upload sessions per account"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_account_sessions gauge");
        for record in &accounts {
            let _ = writeln!(
                output,
                "mirrorpool_account_sessions{{account=\"{}\"}} {}",
                record.account_id, record.active_session_count
            );
        }
        let _ = writeln!(
            output,
            "# HELP mirrorpool_account_used_bytes Quota used per account"
        );
        let _ = writeln!(output, "# TYPE mirrorpool_account_used_bytes gauge");
        for record in &accounts {
            let _ = writeln!(
                output,
                "mirrorpool_account_used_bytes{{account=\"{}\"}} {}",
                record.account_id, record.quota_used_bytes
            );
        }

        output
    }

    /// Reject new uploads, wait for open ones, then stop background work
    ///
    /// Sessions still open after the drain timeout are cancelled through
    /// their normal release path.
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown.drain_timeout();
        info!(
            "Draining {} active uploads (timeout {:?})",
            self.admission.active_count(),
            timeout
        );
        self.admission.begin_drain();

        if !self.admission.wait_idle(timeout).await {
            warn!(
                "Drain timed out with {} uploads active, cancelling them",
                self.admission.active_count()
            );
            self.uploads.cancel_all().await;
        }

        self.background.cancel();
        self.replication.close();
        let tasks = self.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Background task failed: {}", e);
                }
            }
        }
        info!("Storage service stopped");
    }
}
