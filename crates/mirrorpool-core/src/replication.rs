//! Asynchronous replication to the secondary backend
//!
//! Completed uploads enqueue a [`ReplicationTask`]. A small fixed set of
//! workers copies each object from its primary account to the secondary
//! backend and moves its metadata through `InProgress` to `Complete` or
//! `Failed`. Transient failures are retried with capped exponential backoff
//! up to `max_attempts`; nothing here ever reports back to the uploader.

use crate::backend::{BackendError, PrimaryStore, SecondaryStore};
use crate::metrics::ServiceMetrics;
use crate::pool::AccountPool;
use chrono::Utc;
use mirrorpool_common::config::{MAX_REPLICATION_WORKERS, ReplicationConfig};
use mirrorpool_common::{Error, ObjectMetadata, ReplicationState, ReplicationTask, Result};
use mirrorpool_meta_store::ObjectMetaStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<ReplicationTask>,
    /// Retries waiting out their backoff
    delayed: usize,
    in_flight: usize,
    closed: bool,
}

/// Unbounded FIFO of replication tasks
///
/// Pushing never blocks, so enqueueing from the upload path cannot stall a
/// caller. Bounding happens on the consumer side through the worker count.
#[derive(Default)]
pub struct ReplicationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task; false once the queue is closed
    pub fn push(&self, task: ReplicationTask) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                debug!("Replication queue closed, dropping task for {}", task.object_id);
                return false;
            }
            state.tasks.push_back(task);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next task; `None` once the queue is closed
    pub async fn pop(&self) -> Option<ReplicationTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(task) = state.tasks.pop_front() {
                    state.in_flight += 1;
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Re-enqueue `task` after `delay`, unless cancelled first
    fn push_after(self: &Arc<Self>, task: ReplicationTask, delay: Duration, cancel: &CancellationToken) {
        self.state.lock().delayed += 1;
        let queue = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let elapsed = tokio::select! {
                () = cancel.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            };
            queue.state.lock().delayed -= 1;
            if elapsed {
                queue.push(task);
            }
        });
    }

    /// Stop accepting tasks and wake every waiting worker
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Tasks waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects with replication still owed: queued, backing off, or being copied
    pub fn backlog(&self) -> usize {
        let state = self.state.lock();
        state.tasks.len() + state.delayed + state.in_flight
    }
}

/// What processing one task did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Completed,
    /// Scheduled again as this attempt
    Retrying(u32),
    Failed,
    /// Nothing to do (unknown, already complete or already failed)
    Skipped,
}

enum CopyFailure {
    Transient(String),
    Permanent(String),
}

impl From<BackendError> for CopyFailure {
    fn from(e: BackendError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Permanent(e.to_string())
        }
    }
}

/// Fixed-size replication worker pool
pub struct ReplicationWorkers {
    queue: Arc<ReplicationQueue>,
    meta: Arc<dyn ObjectMetaStore>,
    pool: Arc<AccountPool>,
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    metrics: Arc<ServiceMetrics>,
    config: ReplicationConfig,
}

impl ReplicationWorkers {
    pub fn new(
        queue: Arc<ReplicationQueue>,
        meta: Arc<dyn ObjectMetaStore>,
        pool: Arc<AccountPool>,
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<dyn SecondaryStore>,
        metrics: Arc<ServiceMetrics>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            queue,
            meta,
            pool,
            primary,
            secondary,
            metrics,
            config,
        }
    }

    /// Workers actually started, whatever the configuration asks for
    pub fn worker_count(&self) -> usize {
        self.config.workers.clamp(1, MAX_REPLICATION_WORKERS)
    }

    /// Re-enqueue objects a previous run left `Pending` or `InProgress`
    pub fn recover(&self) -> Result<usize> {
        let mut outstanding = self.meta.list_by_state(ReplicationState::Pending)?;
        outstanding.extend(self.meta.list_by_state(ReplicationState::InProgress)?);
        outstanding.sort_by_key(|meta| meta.created_at);

        let count = outstanding.len();
        for meta in outstanding {
            self.queue.push(ReplicationTask {
                object_id: meta.object_id,
                attempt: meta.replication_attempts.saturating_add(1),
                enqueued_at: Utc::now(),
            });
        }
        if count > 0 {
            info!("Re-enqueued {} objects with outstanding replication", count);
        }
        Ok(count)
    }

    /// Start the workers; they stop when `cancel` fires or the queue closes
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();
        let count = self.worker_count();
        for worker_id in 0..count {
            let workers = Arc::clone(self);
            let cancel = cancel.clone();
            set.spawn(async move { workers.worker_loop(worker_id, cancel).await });
        }
        info!("Started {} replication workers", count);
        set
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                task = self.queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // An interrupted copy leaves the object InProgress for recovery
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.queue.finish();
                    break;
                }
                _ = self.process(task, &cancel) => self.queue.finish(),
            }
        }
        debug!("Replication worker {} stopped", worker_id);
    }

    /// Run one attempt for `task` and record its result
    pub async fn process(&self, task: ReplicationTask, cancel: &CancellationToken) -> ReplicationOutcome {
        let mut meta = match self.meta.get(&task.object_id) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!("Replication task for unknown object {}", task.object_id);
                return ReplicationOutcome::Skipped;
            }
            Err(e) => {
                return self.retry_or_fail(None, &task, format!("metadata read: {e}"), cancel);
            }
        };
        if !meta.replication_state.is_outstanding() {
            return ReplicationOutcome::Skipped;
        }

        meta.mark_in_progress(task.attempt);
        if let Err(e) = self.meta.put(&meta) {
            return self.retry_or_fail(Some(&mut meta), &task, format!("metadata write: {e}"), cancel);
        }

        match self.copy(&meta).await {
            Ok(locator) => {
                meta.mark_complete(locator);
                if let Err(e) = self.meta.put(&meta) {
                    return self.retry_or_fail(Some(&mut meta), &task, format!("metadata write: {e}"), cancel);
                }
                self.metrics.record_replication_completed();
                info!(
                    "Replicated {} ({} bytes) on attempt {}",
                    meta.object_id, meta.size_bytes, task.attempt
                );
                ReplicationOutcome::Completed
            }
            Err(CopyFailure::Transient(reason)) => {
                self.retry_or_fail(Some(&mut meta), &task, reason, cancel)
            }
            Err(CopyFailure::Permanent(reason)) => self.fail(Some(&mut meta), &task, &reason),
        }
    }

    async fn copy(&self, meta: &ObjectMetadata) -> std::result::Result<String, CopyFailure> {
        let endpoint = self.pool.endpoint(&meta.primary_account_id).ok_or_else(|| {
            CopyFailure::Permanent(format!(
                "primary account {} is no longer configured",
                meta.primary_account_id
            ))
        })?;
        let stream = self
            .primary
            .open_read(&endpoint, &meta.primary_locator)
            .await?;
        let locator = self
            .secondary
            .put(meta.object_id, meta.size_bytes, stream)
            .await?;
        Ok(locator)
    }

    fn retry_or_fail(
        &self,
        meta: Option<&mut ObjectMetadata>,
        task: &ReplicationTask,
        reason: String,
        cancel: &CancellationToken,
    ) -> ReplicationOutcome {
        if task.attempt >= self.config.max_attempts {
            return self.fail(meta, task, &reason);
        }

        if let Some(meta) = meta {
            meta.mark_retrying(reason.as_str());
            if let Err(e) = self.meta.put(meta) {
                // Stays InProgress; picked up again on restart
                error!("Failed to record retry of {}: {}", task.object_id, e);
            }
        }

        let next = task.next_attempt();
        let delay = self.config.backoff_for(task.attempt);
        warn!(
            "Replication of {} failed on attempt {}/{}: {}; retrying in {:?}",
            task.object_id, task.attempt, self.config.max_attempts, reason, delay
        );
        self.metrics.record_replication_retry();
        let attempt = next.attempt;
        self.queue.push_after(next, delay, cancel);
        ReplicationOutcome::Retrying(attempt)
    }

    fn fail(
        &self,
        meta: Option<&mut ObjectMetadata>,
        task: &ReplicationTask,
        reason: &str,
    ) -> ReplicationOutcome {
        let fault = Error::ReplicationFault(format!(
            "{} abandoned after {} attempts: {reason}",
            task.object_id, task.attempt
        ));
        error!("{}", fault);
        if let Some(meta) = meta {
            meta.mark_failed(reason);
            if let Err(e) = self.meta.put(meta) {
                error!("Failed to record replication failure of {}: {}", task.object_id, e);
            }
        }
        self.metrics.record_replication_failed();
        ReplicationOutcome::Failed
    }
}
