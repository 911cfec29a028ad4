//! mirrorpool Core - storage orchestration
//!
//! Coordinates scarce resources for concurrent uploads and keeps a backup
//! copy of every stored object.
//!
//! # Architecture
//!
//! ```text
//! caller ──► AdmissionController ──► AccountPool ──► UploadCoordinator
//!               (slots, memory)      (health, quota)    (chunked transfer)
//!                                          ▲                   │
//!                                    HealthMonitor             ▼
//!                                                      ReplicationQueue ──► ReplicationWorkers ──► secondary
//!
//! caller ──► ReadRouter ──► primary account, then secondary once
//! ```

pub mod admission;
pub mod backend;
pub mod budget;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod read;
pub mod replication;
pub mod service;
pub mod session;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionPermit, DenyReason};
pub use backend::{
    BackendError, ByteStream, FsPrimaryStore, FsSecondaryStore, MemoryPrimaryStore,
    MemorySecondaryStore, PrimaryStore, SecondaryStore,
};
pub use budget::{BudgetError, BudgetTracker, FixedBudget, SystemMemoryBudget, budget_from_config};
pub use health::HealthMonitor;
pub use metrics::ServiceMetrics;
pub use pool::{AccountLease, AccountPool};
pub use read::{ObjectRead, ReadRouter, ReadSource};
pub use replication::{ReplicationOutcome, ReplicationQueue, ReplicationWorkers};
pub use service::{ServiceDeps, ServiceStatus, StorageService};
pub use session::{InitiatedUpload, UploadChannel, UploadCoordinator, UploadProgress};
