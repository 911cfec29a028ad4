//! Upload session coordinator
//!
//! Each admitted upload gets a driver task that owns the session's
//! [`AdmissionPermit`] and [`AccountLease`]. Callers talk to the driver over
//! a command channel; the driver applies chunks in order, completes the
//! object, and ends on completion, a fatal fault, cancellation or an idle
//! timeout. Every one of those ends leaves the driver by the same path: the
//! driver is dropped, and dropping it removes the session entry, closes the
//! account session and releases the admission slot, in that order.

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::backend::{BackendError, PrimaryStore};
use crate::metrics::{ServiceMetrics, UploadOutcome};
use crate::pool::{AccountLease, AccountPool};
use crate::replication::ReplicationQueue;
use bytes::Bytes;
use mirrorpool_common::config::UploadConfig;
use mirrorpool_common::{
    AccountId, Error, ObjectId, ObjectMetadata, OwnerId, ReplicationTask, Result,
};
use mirrorpool_meta_store::ObjectMetaStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Returned to the caller when an upload is admitted
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedUpload {
    pub object_id: ObjectId,
    pub account_id: AccountId,
    pub account_endpoint: String,
}

/// Transfer progress of an open upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub object_id: ObjectId,
    pub owner_id: OwnerId,
    pub account_id: AccountId,
    pub received_bytes: u64,
    pub declared_size_bytes: u64,
}

enum Command {
    Write {
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<u64>>,
    },
    Complete {
        reply: oneshot::Sender<Result<ObjectMetadata>>,
    },
}

#[derive(Clone)]
struct SessionHandle {
    owner_id: OwnerId,
    account_id: AccountId,
    declared_size_bytes: u64,
    received: Arc<AtomicU64>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    /// Closes when the driver has been dropped
    done: watch::Receiver<()>,
}

type SessionMap = Arc<Mutex<HashMap<ObjectId, SessionHandle>>>;

/// Removes the session entry when dropped
struct SessionEntry {
    sessions: SessionMap,
    object_id: ObjectId,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.object_id);
    }
}

/// Coordinates chunked uploads from admission to replication hand-off
pub struct UploadCoordinator {
    admission: Arc<AdmissionController>,
    pool: Arc<AccountPool>,
    store: Arc<dyn PrimaryStore>,
    meta: Arc<dyn ObjectMetaStore>,
    replication: Arc<ReplicationQueue>,
    metrics: Arc<ServiceMetrics>,
    config: UploadConfig,
    sessions: SessionMap,
    /// Parent of every session's cancellation token
    shutdown: CancellationToken,
}

impl UploadCoordinator {
    pub fn new(
        admission: Arc<AdmissionController>,
        pool: Arc<AccountPool>,
        store: Arc<dyn PrimaryStore>,
        meta: Arc<dyn ObjectMetaStore>,
        replication: Arc<ReplicationQueue>,
        metrics: Arc<ServiceMetrics>,
        config: UploadConfig,
    ) -> Self {
        Self {
            admission,
            pool,
            store,
            meta,
            replication,
            metrics,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Admit an upload, pick its account and open the session
    pub async fn initiate_upload(
        &self,
        owner_id: &OwnerId,
        declared_size_bytes: u64,
    ) -> Result<InitiatedUpload> {
        let object_id = ObjectId::new();
        let permit = self
            .admission
            .acquire_permit(
                owner_id,
                object_id,
                declared_size_bytes,
                self.admission.acquire_wait(),
            )
            .await?;
        let lease = self.pool.select_account(declared_size_bytes)?;

        let locator = self
            .store
            .begin(lease.endpoint(), object_id)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    lease.record_failure();
                }
                Error::transfer(format!(
                    "failed to open {object_id} on account {}: {e}",
                    lease.account_id()
                ))
            })?;

        let initiated = InitiatedUpload {
            object_id,
            account_id: lease.account_id().clone(),
            account_endpoint: lease.endpoint().endpoint.clone(),
        };
        self.open_session(owner_id, declared_size_bytes, locator, permit, lease);

        info!(
            "Upload {} for {} admitted on account {} ({} bytes)",
            object_id, owner_id, initiated.account_id, declared_size_bytes
        );
        Ok(initiated)
    }

    fn open_session(
        &self,
        owner_id: &OwnerId,
        declared_size_bytes: u64,
        locator: String,
        permit: AdmissionPermit,
        lease: AccountLease,
    ) {
        let object_id = permit.object_id();
        let (commands_tx, commands_rx) = mpsc::channel(self.config.chunk_queue_depth);
        let (done_tx, done_rx) = watch::channel(());
        let cancel = self.shutdown.child_token();
        let received = Arc::new(AtomicU64::new(0));

        self.sessions.lock().insert(
            object_id,
            SessionHandle {
                owner_id: owner_id.clone(),
                account_id: lease.account_id().clone(),
                declared_size_bytes,
                received: Arc::clone(&received),
                commands: commands_tx,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let driver = SessionDriver {
            object_id,
            owner_id: owner_id.clone(),
            declared_size_bytes,
            locator,
            received,
            store: Arc::clone(&self.store),
            meta: Arc::clone(&self.meta),
            replication: Arc::clone(&self.replication),
            metrics: Arc::clone(&self.metrics),
            max_chunk_size: self.config.max_chunk_size,
            idle_timeout: self.config.idle_timeout(),
            _entry: SessionEntry {
                sessions: Arc::clone(&self.sessions),
                object_id,
            },
            lease,
            _permit: permit,
            _done: done_tx,
        };
        tokio::spawn(driver.run(commands_rx, cancel));
    }

    fn handle(&self, object_id: &ObjectId) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .get(object_id)
            .cloned()
            .ok_or(Error::UploadNotFound(*object_id))
    }

    /// Write `data` at `offset`; returns the bytes received so far
    pub async fn upload_chunk(&self, object_id: ObjectId, offset: u64, data: Bytes) -> Result<u64> {
        let handle = self.handle(&object_id)?;
        send_write(&handle.commands, object_id, offset, data).await
    }

    /// Finish the upload once every declared byte has arrived
    pub async fn complete_upload(&self, object_id: ObjectId) -> Result<ObjectMetadata> {
        let handle = self.handle(&object_id)?;
        send_complete(&handle.commands, object_id).await
    }

    /// Cancel the upload and wait until its resources are released
    pub async fn cancel_upload(&self, object_id: ObjectId) -> Result<()> {
        let mut handle = self.handle(&object_id)?;
        handle.cancel.cancel();
        // Errors once the driver, and with it every guard, is gone
        while handle.done.changed().await.is_ok() {}
        Ok(())
    }

    /// Attach a channel that cancels the upload if dropped before completion
    pub fn channel(&self, object_id: ObjectId) -> Result<UploadChannel> {
        let handle = self.handle(&object_id)?;
        Ok(UploadChannel {
            object_id,
            commands: handle.commands,
            cancel: handle.cancel,
            finished: false,
        })
    }

    pub fn upload_progress(&self, object_id: ObjectId) -> Result<UploadProgress> {
        let handle = self.handle(&object_id)?;
        Ok(UploadProgress {
            object_id,
            owner_id: handle.owner_id,
            account_id: handle.account_id,
            received_bytes: handle.received.load(Ordering::SeqCst),
            declared_size_bytes: handle.declared_size_bytes,
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Cancel every open session and wait for all of them to release
    pub async fn cancel_all(&self) {
        self.shutdown.cancel();
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        for mut handle in handles {
            while handle.done.changed().await.is_ok() {}
        }
    }
}

async fn send_write(
    commands: &mpsc::Sender<Command>,
    object_id: ObjectId,
    offset: u64,
    data: Bytes,
) -> Result<u64> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Write {
            offset,
            data,
            reply,
        })
        .await
        .map_err(|_| Error::UploadCancelled(object_id))?;
    response.await.map_err(|_| Error::UploadCancelled(object_id))?
}

async fn send_complete(
    commands: &mpsc::Sender<Command>,
    object_id: ObjectId,
) -> Result<ObjectMetadata> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Complete { reply })
        .await
        .map_err(|_| Error::UploadCancelled(object_id))?;
    response.await.map_err(|_| Error::UploadCancelled(object_id))?
}

/// A caller's connection to one upload
///
/// Dropping it without calling [`UploadChannel::complete`] counts as a
/// disconnect and cancels the upload.
pub struct UploadChannel {
    object_id: ObjectId,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    finished: bool,
}

impl UploadChannel {
    pub const fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub async fn send_chunk(&self, offset: u64, data: Bytes) -> Result<u64> {
        send_write(&self.commands, self.object_id, offset, data).await
    }

    pub async fn complete(mut self) -> Result<ObjectMetadata> {
        self.finished = true;
        send_complete(&self.commands, self.object_id).await
    }
}

impl Drop for UploadChannel {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Upload channel for {} dropped, cancelling", self.object_id);
            self.cancel.cancel();
        }
    }
}

enum SessionEnd {
    Completed,
    Cancelled,
    Failed(String),
}

/// Result of one command: whether the session survives an error
enum StepError {
    Recoverable(Error),
    Fatal(Error),
}

struct SessionDriver {
    object_id: ObjectId,
    owner_id: OwnerId,
    declared_size_bytes: u64,
    locator: String,
    received: Arc<AtomicU64>,
    store: Arc<dyn PrimaryStore>,
    meta: Arc<dyn ObjectMetaStore>,
    replication: Arc<ReplicationQueue>,
    metrics: Arc<ServiceMetrics>,
    max_chunk_size: usize,
    idle_timeout: Duration,
    // Dropped in declaration order
    _entry: SessionEntry,
    lease: AccountLease,
    _permit: AdmissionPermit,
    _done: watch::Sender<()>,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let end = self.drive(&mut commands, &cancel).await;
        commands.close();

        match end {
            SessionEnd::Completed => {
                self.metrics
                    .record_upload(UploadOutcome::Completed, self.declared_size_bytes);
            }
            SessionEnd::Cancelled => {
                info!(
                    "Upload {} cancelled after {} bytes",
                    self.object_id,
                    self.received.load(Ordering::SeqCst)
                );
                self.discard().await;
                self.metrics.record_upload(UploadOutcome::Cancelled, 0);
            }
            SessionEnd::Failed(reason) => {
                warn!("Upload {} failed: {}", self.object_id, reason);
                self.discard().await;
                self.metrics.record_upload(UploadOutcome::Failed, 0);
            }
        }
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => return SessionEnd::Cancelled,
                },
                () = tokio::time::sleep(self.idle_timeout) => {
                    return SessionEnd::Failed(format!("idle for {:?}", self.idle_timeout));
                }
            };

            match command {
                Command::Write {
                    offset,
                    data,
                    reply,
                } => {
                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            let _ = reply.send(Err(Error::UploadCancelled(self.object_id)));
                            return SessionEnd::Cancelled;
                        }
                        result = self.write(offset, data) => result,
                    };
                    match result {
                        Ok(received) => {
                            let _ = reply.send(Ok(received));
                        }
                        Err(StepError::Recoverable(e)) => {
                            let _ = reply.send(Err(e));
                        }
                        Err(StepError::Fatal(e)) => {
                            let reason = e.to_string();
                            let _ = reply.send(Err(e));
                            return SessionEnd::Failed(reason);
                        }
                    }
                }
                Command::Complete { reply } => match self.complete().await {
                    Ok(meta) => {
                        let _ = reply.send(Ok(meta));
                        return SessionEnd::Completed;
                    }
                    Err(StepError::Recoverable(e)) => {
                        let _ = reply.send(Err(e));
                    }
                    Err(StepError::Fatal(e)) => {
                        let reason = e.to_string();
                        let _ = reply.send(Err(e));
                        return SessionEnd::Failed(reason);
                    }
                },
            }
        }
    }

    async fn write(&self, offset: u64, data: Bytes) -> std::result::Result<u64, StepError> {
        let received = self.received.load(Ordering::SeqCst);
        if data.is_empty() {
            return Err(StepError::Recoverable(Error::invalid_request("empty chunk")));
        }
        if data.len() > self.max_chunk_size {
            return Err(StepError::Recoverable(Error::invalid_request(format!(
                "chunk of {} bytes exceeds the limit of {}",
                data.len(),
                self.max_chunk_size
            ))));
        }
        if offset != received {
            return Err(StepError::Recoverable(Error::invalid_request(format!(
                "chunk offset {offset} does not match received bytes {received}"
            ))));
        }
        let len = data.len() as u64;
        if received + len > self.declared_size_bytes {
            return Err(StepError::Recoverable(Error::invalid_request(format!(
                "chunk ends at {} past the declared size {}",
                received + len,
                self.declared_size_bytes
            ))));
        }

        self.store
            .write_chunk(self.lease.endpoint(), &self.locator, offset, data)
            .await
            .map_err(|e| self.backend_fault("write", e))?;

        let total = received + len;
        self.received.store(total, Ordering::SeqCst);
        Ok(total)
    }

    async fn complete(&mut self) -> std::result::Result<ObjectMetadata, StepError> {
        let received = self.received.load(Ordering::SeqCst);
        if received != self.declared_size_bytes {
            return Err(StepError::Recoverable(Error::invalid_request(format!(
                "received {received} of {} declared bytes",
                self.declared_size_bytes
            ))));
        }

        self.store
            .complete(self.lease.endpoint(), &self.locator)
            .await
            .map_err(|e| self.backend_fault("complete", e))?;

        let meta = ObjectMetadata::new_pending(
            self.object_id,
            self.owner_id.clone(),
            self.lease.account_id().clone(),
            self.locator.clone(),
            self.declared_size_bytes,
        );
        self.meta
            .put(&meta)
            .map_err(|e| StepError::Fatal(e.into()))?;

        let used = self.lease.commit(self.declared_size_bytes);
        if let Err(e) = self.meta.put_account_usage(self.lease.account_id(), used) {
            warn!(
                "Failed to persist usage of account {}: {}",
                self.lease.account_id(),
                e
            );
        }

        if !self.replication.push(ReplicationTask::new(self.object_id)) {
            // Left Pending; re-enqueued on the next start
            debug!("Replication of {} deferred: queue closed", self.object_id);
        }
        info!(
            "Upload {} complete on account {} ({} bytes)",
            self.object_id,
            self.lease.account_id(),
            self.declared_size_bytes
        );
        Ok(meta)
    }

    fn backend_fault(&self, step: &str, e: BackendError) -> StepError {
        let fault = Error::transfer(format!(
            "{step} of {} on account {} failed: {e}",
            self.object_id,
            self.lease.account_id()
        ));
        if e.is_transient() {
            self.lease.record_failure();
            StepError::Recoverable(fault)
        } else {
            StepError::Fatal(fault)
        }
    }

    /// Best-effort removal of the partial object
    async fn discard(&self) {
        if let Err(e) = self.store.abort(self.lease.endpoint(), &self.locator).await {
            warn!("Failed to discard partial upload {}: {}", self.object_id, e);
        }
    }
}
