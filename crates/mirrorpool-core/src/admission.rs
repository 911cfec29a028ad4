//! Upload admission control
//!
//! Gates the start of an upload on three limits: a global concurrent-session
//! cap, a per-owner cap, and a memory budget against which each upload
//! reserves an estimate derived from its declared size. A declared size
//! whose estimate exceeds the largest budget the tracker can ever report is
//! an invalid request, not a denial: waiting would never admit it.
//!
//! A refusal is an [`AdmissionDecision::Denied`]. A failure to *evaluate*
//! the limits (budget tracker error, invariant violation) is an
//! `Error::Internal` and is never reported as a denial.
//!
//! The active-slot set lives here and nowhere else. Slots are removed through
//! [`AdmissionController::release`], normally from the [`AdmissionPermit`]
//! drop, which makes release part of every exit path of an upload.

use crate::budget::{BudgetError, BudgetTracker};
use crate::metrics::{DenialKind, ServiceMetrics};
use chrono::Utc;
use mirrorpool_common::config::AdmissionConfig;
use mirrorpool_common::{CapacityScope, Error, ObjectId, OwnerId, Result, UploadSlot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Why an admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    GlobalCapacity { limit: usize },
    OwnerCapacity { limit: usize },
    MemoryBudget { requested: u64, available: u64 },
    ShuttingDown,
}

impl DenyReason {
    /// Whether waiting for a release can turn this into a grant
    pub const fn may_clear(&self) -> bool {
        !matches!(self, Self::ShuttingDown)
    }

    pub const fn kind(&self) -> DenialKind {
        match self {
            Self::GlobalCapacity { .. } => DenialKind::GlobalCapacity,
            Self::OwnerCapacity { .. } => DenialKind::OwnerCapacity,
            Self::MemoryBudget { .. } => DenialKind::MemoryBudget,
            Self::ShuttingDown => DenialKind::ShuttingDown,
        }
    }

    pub const fn into_error(self) -> Error {
        match self {
            Self::GlobalCapacity { limit } => Error::CapacityExhausted {
                scope: CapacityScope::Global,
                limit,
            },
            Self::OwnerCapacity { limit } => Error::CapacityExhausted {
                scope: CapacityScope::Owner,
                limit,
            },
            Self::MemoryBudget {
                requested,
                available,
            } => Error::ResourceBudgetExceeded {
                requested,
                available,
            },
            Self::ShuttingDown => Error::ShuttingDown,
        }
    }
}

/// Outcome of a single admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Granted(UploadSlot),
    Denied(DenyReason),
}

/// Lifetime counters for slot bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub granted: u64,
    pub released: u64,
}

#[derive(Default)]
struct AdmissionState {
    slots: HashMap<ObjectId, UploadSlot>,
    per_owner: HashMap<OwnerId, usize>,
    reserved_bytes: u64,
    draining: bool,
    counts: SlotCounts,
}

/// Admission controller for upload sessions
pub struct AdmissionController {
    config: AdmissionConfig,
    budget: Arc<dyn BudgetTracker>,
    state: Mutex<AdmissionState>,
    /// Signalled whenever a slot is released or draining starts
    changed: Notify,
    metrics: Arc<ServiceMetrics>,
}

impl AdmissionController {
    pub fn new(
        config: AdmissionConfig,
        budget: Arc<dyn BudgetTracker>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        info!(
            "Admission: {} global / {} per owner, budget source {}",
            config.max_concurrent_uploads,
            config.max_uploads_per_owner,
            budget.name()
        );
        Self {
            config,
            budget,
            state: Mutex::new(AdmissionState::default()),
            changed: Notify::new(),
            metrics,
        }
    }

    /// How long callers wait for capacity before reporting busy
    pub const fn acquire_wait(&self) -> Duration {
        self.config.acquire_wait()
    }

    /// Memory estimate for an upload of `declared_size_bytes`
    pub fn estimate_memory(&self, declared_size_bytes: u64) -> u64 {
        self.config.estimate_memory(declared_size_bytes)
    }

    /// Reject sizes the admission math must never see
    pub fn validate_declared_size(&self, declared_size_bytes: u64) -> Result<()> {
        if declared_size_bytes == 0 {
            return Err(Error::invalid_request("declared size must be positive"));
        }
        if declared_size_bytes > self.config.max_declared_size_bytes {
            return Err(Error::invalid_request(format!(
                "declared size {declared_size_bytes} exceeds the maximum of {} bytes",
                self.config.max_declared_size_bytes
            )));
        }
        Ok(())
    }

    /// Try to admit an upload without waiting
    pub fn acquire(
        &self,
        owner_id: &OwnerId,
        object_id: ObjectId,
        declared_size_bytes: u64,
    ) -> Result<AdmissionDecision> {
        let decision = self.decide(owner_id, object_id, declared_size_bytes);
        self.record(&decision);
        decision
    }

    /// Admit an upload, waiting up to `wait` for capacity to free up
    ///
    /// Returns a permit that releases the slot when dropped. A denial that
    /// persists until the deadline is returned as its typed error.
    pub async fn acquire_permit(
        self: &Arc<Self>,
        owner_id: &OwnerId,
        object_id: ObjectId,
        declared_size_bytes: u64,
        wait: Duration,
    ) -> Result<AdmissionPermit> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = self.decide(owner_id, object_id, declared_size_bytes);
            match decision {
                Ok(AdmissionDecision::Granted(slot)) => {
                    self.metrics.record_admission_granted();
                    return Ok(AdmissionPermit {
                        controller: Arc::clone(self),
                        slot,
                    });
                }
                Ok(AdmissionDecision::Denied(reason)) => {
                    let now = Instant::now();
                    if !reason.may_clear() || now >= deadline {
                        self.metrics.record_admission_denied(reason.kind());
                        return Err(reason.into_error());
                    }
                    debug!("Admission for {} waiting: {:?}", object_id, reason);
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
                Err(e) => {
                    if e.is_internal() {
                        error!("Admission fault: {}", e);
                        self.metrics.record_internal_fault();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Remove the slot for `object_id`; returns false if it was already gone
    pub fn release(&self, object_id: &ObjectId) -> bool {
        let released = {
            let mut state = self.state.lock();
            match state.slots.remove(object_id) {
                Some(slot) => {
                    if let Some(count) = state.per_owner.get_mut(&slot.owner_id) {
                        *count -= 1;
                        if *count == 0 {
                            state.per_owner.remove(&slot.owner_id);
                        }
                    }
                    state.reserved_bytes = state
                        .reserved_bytes
                        .saturating_sub(slot.estimated_memory_bytes);
                    state.counts.released += 1;
                    true
                }
                None => false,
            }
        };
        if released {
            self.changed.notify_waiters();
        }
        released
    }

    /// Stop admitting new uploads
    pub fn begin_drain(&self) {
        self.state.lock().draining = true;
        self.changed.notify_waiters();
        info!("Admission draining: new uploads are rejected");
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Wait until no slots remain; false if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_count() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn active_for_owner(&self, owner_id: &OwnerId) -> usize {
        self.state
            .lock()
            .per_owner
            .get(owner_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved_bytes
    }

    pub fn slot(&self, object_id: &ObjectId) -> Option<UploadSlot> {
        self.state.lock().slots.get(object_id).cloned()
    }

    pub fn slot_counts(&self) -> SlotCounts {
        self.state.lock().counts
    }

    fn decide(
        &self,
        owner_id: &OwnerId,
        object_id: ObjectId,
        declared_size_bytes: u64,
    ) -> Result<AdmissionDecision> {
        self.validate_declared_size(declared_size_bytes)?;
        let estimate = self.estimate_memory(declared_size_bytes);

        let budget_fault = |e: BudgetError| {
            Error::internal(format!("budget tracker '{}' failed: {e}", self.budget.name()))
        };
        let ceiling = self.budget.ceiling().map_err(budget_fault)?;
        if estimate > ceiling {
            return Err(Error::invalid_request(format!(
                "declared size {declared_size_bytes} needs {estimate} bytes of memory, \
                 more than the whole budget of {ceiling} bytes"
            )));
        }
        let margin = self.budget.available_margin().map_err(budget_fault)?;

        let mut state = self.state.lock();
        if state.draining {
            return Ok(AdmissionDecision::Denied(DenyReason::ShuttingDown));
        }
        if state.slots.contains_key(&object_id) {
            return Err(Error::internal(format!(
                "upload slot for {object_id} already exists"
            )));
        }
        if state.slots.len() >= self.config.max_concurrent_uploads {
            return Ok(AdmissionDecision::Denied(DenyReason::GlobalCapacity {
                limit: self.config.max_concurrent_uploads,
            }));
        }
        let owner_active = state.per_owner.get(owner_id).copied().unwrap_or(0);
        if owner_active >= self.config.max_uploads_per_owner {
            return Ok(AdmissionDecision::Denied(DenyReason::OwnerCapacity {
                limit: self.config.max_uploads_per_owner,
            }));
        }
        let projected = state.reserved_bytes.saturating_add(estimate);
        if projected > margin {
            return Ok(AdmissionDecision::Denied(DenyReason::MemoryBudget {
                requested: estimate,
                available: margin.saturating_sub(state.reserved_bytes),
            }));
        }

        let slot = UploadSlot {
            owner_id: owner_id.clone(),
            object_id,
            declared_size_bytes,
            started_at: Utc::now(),
            estimated_memory_bytes: estimate,
        };
        state.slots.insert(object_id, slot.clone());
        *state.per_owner.entry(owner_id.clone()).or_insert(0) += 1;
        state.reserved_bytes = projected;
        state.counts.granted += 1;
        Ok(AdmissionDecision::Granted(slot))
    }

    fn record(&self, decision: &Result<AdmissionDecision>) {
        match decision {
            Ok(AdmissionDecision::Granted(_)) => self.metrics.record_admission_granted(),
            Ok(AdmissionDecision::Denied(reason)) => {
                debug!("Admission denied: {:?}", reason);
                self.metrics.record_admission_denied(reason.kind());
            }
            Err(e) if e.is_internal() => {
                error!("Admission fault: {}", e);
                self.metrics.record_internal_fault();
            }
            Err(_) => {}
        }
    }
}

/// An admitted upload slot, released when dropped
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    slot: UploadSlot,
}

impl AdmissionPermit {
    pub fn slot(&self) -> &UploadSlot {
        &self.slot
    }

    pub fn object_id(&self) -> ObjectId {
        self.slot.object_id
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(&self.slot.object_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetError, FixedBudget};

    struct FailingBudget;

    impl BudgetTracker for FailingBudget {
        fn name(&self) -> &str {
            "failing"
        }

        fn available_margin(&self) -> std::result::Result<u64, BudgetError> {
            Err(BudgetError::Probe("injected".to_string()))
        }
    }

    fn config(global: usize, per_owner: usize) -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent_uploads: global,
            max_uploads_per_owner: per_owner,
            memory_estimate_fraction: 0.5,
            max_declared_size_bytes: 1_000_000,
            ..AdmissionConfig::default()
        }
    }

    fn controller(global: usize, per_owner: usize, budget: u64) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            config(global, per_owner),
            Arc::new(FixedBudget::new(budget)),
            Arc::new(ServiceMetrics::new()),
        ))
    }

    fn owner(name: &str) -> OwnerId {
        OwnerId::new(name).unwrap()
    }

    #[test]
    fn test_global_capacity_scenario() {
        let admission = controller(2, 10, u64::MAX);
        let first = ObjectId::new();
        let second = ObjectId::new();
        let third = ObjectId::new();

        assert!(matches!(
            admission.acquire(&owner("a"), first, 10).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        assert!(matches!(
            admission.acquire(&owner("b"), second, 10).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        let denied = admission.acquire(&owner("c"), third, 10).unwrap();
        assert_eq!(
            denied,
            AdmissionDecision::Denied(DenyReason::GlobalCapacity { limit: 2 })
        );
        assert!(matches!(
            DenyReason::GlobalCapacity { limit: 2 }.into_error(),
            Error::CapacityExhausted {
                scope: CapacityScope::Global,
                ..
            }
        ));

        assert!(admission.release(&first));
        assert!(matches!(
            admission.acquire(&owner("c"), third, 10).unwrap(),
            AdmissionDecision::Granted(_)
        ));
    }

    #[test]
    fn test_per_owner_capacity() {
        let admission = controller(10, 1, u64::MAX);
        let alice = owner("alice");
        assert!(matches!(
            admission.acquire(&alice, ObjectId::new(), 10).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        assert_eq!(
            admission.acquire(&alice, ObjectId::new(), 10).unwrap(),
            AdmissionDecision::Denied(DenyReason::OwnerCapacity { limit: 1 })
        );
        assert!(matches!(
            admission.acquire(&owner("bob"), ObjectId::new(), 10).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        assert_eq!(admission.active_for_owner(&alice), 1);
    }

    #[test]
    fn test_memory_budget() {
        // fraction 0.5: a 100-byte upload reserves 50 bytes
        let admission = controller(10, 10, 120);
        let first = ObjectId::new();
        assert!(matches!(
            admission.acquire(&owner("a"), first, 100).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        assert!(matches!(
            admission.acquire(&owner("b"), ObjectId::new(), 100).unwrap(),
            AdmissionDecision::Granted(_)
        ));
        assert_eq!(admission.reserved_bytes(), 100);
        assert_eq!(
            admission.acquire(&owner("c"), ObjectId::new(), 100).unwrap(),
            AdmissionDecision::Denied(DenyReason::MemoryBudget {
                requested: 50,
                available: 20
            })
        );
        admission.release(&first);
        assert_eq!(admission.reserved_bytes(), 50);
    }

    #[test]
    fn test_budget_fault_is_internal_not_denial() {
        let metrics = Arc::new(ServiceMetrics::new());
        let admission = AdmissionController::new(
            config(2, 2),
            Arc::new(FailingBudget),
            Arc::clone(&metrics),
        );

        let result = admission.acquire(&owner("a"), ObjectId::new(), 10);
        match result {
            Err(Error::Internal(msg)) => assert!(msg.contains("failing")),
            other => panic!("expected internal fault, got {other:?}"),
        }
        assert_eq!(admission.active_count(), 0);
        assert_eq!(metrics.internal_faults(), 1);
        for kind in DenialKind::ALL {
            assert_eq!(metrics.admissions_denied(kind), 0);
        }
    }

    #[test]
    fn test_pathological_sizes_rejected() {
        let admission = controller(2, 2, u64::MAX);
        assert!(matches!(
            admission.acquire(&owner("a"), ObjectId::new(), 0),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            admission.acquire(&owner("a"), ObjectId::new(), u64::MAX),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(admission.active_count(), 0);
    }

    #[tokio::test]
    async fn test_size_beyond_whole_budget_fails_fast() {
        // fraction 0.5 against a 100-byte budget: 201 bytes can never fit
        let admission = controller(4, 4, 100);
        assert!(matches!(
            admission.acquire(&owner("a"), ObjectId::new(), 200).unwrap(),
            AdmissionDecision::Granted(_)
        ));

        let started = Instant::now();
        let err = admission
            .acquire_permit(&owner("b"), ObjectId::new(), 201, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, Error::InvalidRequest(_)), "got {err:?}");
        assert!(!err.is_retryable());
        assert_eq!(err.http_status_code(), 400);
        assert_eq!(admission.active_count(), 1);
    }

    #[test]
    fn test_size_within_budget_but_busy_is_retryable() {
        let admission = controller(4, 4, 100);
        admission.acquire(&owner("a"), ObjectId::new(), 150).unwrap();
        let denied = admission.acquire(&owner("b"), ObjectId::new(), 100).unwrap();
        let AdmissionDecision::Denied(reason) = denied else {
            panic!("expected a denial, got {denied:?}");
        };
        assert!(reason.into_error().is_retryable());
    }

    #[test]
    fn test_duplicate_slot_is_internal() {
        let admission = controller(2, 2, u64::MAX);
        let id = ObjectId::new();
        admission.acquire(&owner("a"), id, 10).unwrap();
        assert!(matches!(
            admission.acquire(&owner("a"), id, 10),
            Err(Error::Internal(_))
        ));
        assert_eq!(admission.active_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let admission = controller(2, 2, u64::MAX);
        let id = ObjectId::new();
        admission.acquire(&owner("a"), id, 10).unwrap();
        assert!(admission.release(&id));
        assert!(!admission.release(&id));
        assert_eq!(
            admission.slot_counts(),
            SlotCounts {
                granted: 1,
                released: 1
            }
        );
    }

    #[tokio::test]
    async fn test_permit_drop_releases() {
        let admission = controller(1, 1, u64::MAX);
        let id = ObjectId::new();
        {
            let permit = admission
                .acquire_permit(&owner("a"), id, 10, Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(permit.object_id(), id);
            assert!(admission.slot(&id).is_some());
        }
        assert!(admission.slot(&id).is_none());
        assert_eq!(admission.active_count(), 0);
    }

    #[tokio::test]
    async fn test_permit_waits_for_release() {
        let admission = controller(1, 1, u64::MAX);
        let held = admission
            .acquire_permit(&owner("a"), ObjectId::new(), 10, Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move {
                admission
                    .acquire_permit(&owner("b"), ObjectId::new(), 10, Duration::from_secs(5))
                    .await
                    .map(|permit| permit.object_id())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_permit_times_out_as_capacity_error() {
        let admission = controller(1, 1, u64::MAX);
        let _held = admission
            .acquire_permit(&owner("a"), ObjectId::new(), 10, Duration::ZERO)
            .await
            .unwrap();

        let err = admission
            .acquire_permit(&owner("b"), ObjectId::new(), 10, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExhausted {
                scope: CapacityScope::Global,
                limit: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_drain_rejects_and_waits_idle() {
        let admission = controller(2, 2, u64::MAX);
        let permit = admission
            .acquire_permit(&owner("a"), ObjectId::new(), 10, Duration::ZERO)
            .await
            .unwrap();

        admission.begin_drain();
        let err = admission
            .acquire_permit(&owner("b"), ObjectId::new(), 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));

        assert!(!admission.wait_idle(Duration::from_millis(20)).await);
        drop(permit);
        assert!(admission.wait_idle(Duration::from_secs(1)).await);
    }
}
