//! Core type definitions for mirrorpool
//!
//! This module defines the identifiers and records shared by the admission,
//! pooling, upload, replication and read paths.

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of owner and account identifiers
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Unique identifier for an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a new random object ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Errors that can occur when creating an identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier must be at most {MAX_IDENTIFIER_LEN} characters")]
    TooLong,
    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
}

fn validate_identifier(value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong);
    }
    if let Some(c) = value.chars().find(|c| c.is_control() || c.is_whitespace()) {
        return Err(IdentifierError::InvalidChar(c));
    }
    Ok(())
}

/// Identity of the caller that owns an upload
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new owner id
    pub fn new(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({:?})", self.0)
    }
}

/// Identifier of a primary-storage account in the pool
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct AccountId(String);

impl AccountId {
    /// Create a new account id
    pub fn new(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({:?})", self.0)
    }
}

/// Operational status of a pool account, driven by periodic probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HealthState {
    #[default]
    Healthy,
    /// Recent failures below the unavailability threshold
    Degraded,
    Unavailable,
}

impl HealthState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection details for a primary-storage account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEndpoint {
    pub account_id: AccountId,
    /// Endpoint handed to callers and backends (URL or root path)
    pub endpoint: String,
    /// Account secret, never logged
    pub secret: Option<String>,
}

impl fmt::Debug for AccountEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountEndpoint")
            .field("account_id", &self.account_id)
            .field("endpoint", &self.endpoint)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Snapshot of a pool account's quota, health and load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: AccountId,
    pub quota_total_bytes: u64,
    pub quota_used_bytes: u64,
    pub health_state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub active_session_count: u32,
}

impl AccountRecord {
    /// Create a healthy record with no usage
    #[must_use]
    pub const fn new(account_id: AccountId, quota_total_bytes: u64) -> Self {
        Self {
            account_id,
            quota_total_bytes,
            quota_used_bytes: 0,
            health_state: HealthState::Healthy,
            last_checked_at: None,
            active_session_count: 0,
        }
    }

    /// Bytes still available under the quota
    #[must_use]
    pub const fn remaining_quota(&self) -> u64 {
        self.quota_total_bytes.saturating_sub(self.quota_used_bytes)
    }

    /// Fraction of the quota in use (1.0 for a zero quota)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self) -> f64 {
        if self.quota_total_bytes == 0 {
            return 1.0;
        }
        self.quota_used_bytes as f64 / self.quota_total_bytes as f64
    }
}

/// Replication progress of an object towards the secondary backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicationState {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ReplicationState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Whether the replication worker still owes work for this state
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a stored object
///
/// `backup_locator` and the replication fields are only changed through the
/// `mark_*` methods, which keep a `Complete` state paired with a locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub object_id: ObjectId,
    pub owner_id: OwnerId,
    pub primary_account_id: AccountId,
    pub primary_locator: String,
    pub backup_locator: Option<String>,
    pub replication_state: ReplicationState,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Replication attempts made so far
    pub replication_attempts: u32,
    pub last_replication_error: Option<String>,
}

impl ObjectMetadata {
    /// Metadata for a freshly completed upload awaiting replication
    #[must_use]
    pub fn new_pending(
        object_id: ObjectId,
        owner_id: OwnerId,
        primary_account_id: AccountId,
        primary_locator: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            object_id,
            owner_id,
            primary_account_id,
            primary_locator: primary_locator.into(),
            backup_locator: None,
            replication_state: ReplicationState::Pending,
            size_bytes,
            created_at: Utc::now(),
            replication_attempts: 0,
            last_replication_error: None,
        }
    }

    pub fn mark_in_progress(&mut self, attempt: u32) {
        self.replication_state = ReplicationState::InProgress;
        self.replication_attempts = attempt;
    }

    /// Record a transient failure; the object goes back to `Pending`
    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        self.replication_state = ReplicationState::Pending;
        self.last_replication_error = Some(error.into());
    }

    pub fn mark_complete(&mut self, backup_locator: impl Into<String>) {
        self.backup_locator = Some(backup_locator.into());
        self.replication_state = ReplicationState::Complete;
        self.last_replication_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.replication_state = ReplicationState::Failed;
        self.last_replication_error = Some(error.into());
    }

    /// `Complete` implies a backup locator is present
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        !matches!(self.replication_state, ReplicationState::Complete) || self.backup_locator.is_some()
    }
}

/// Unit of work for the replication worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub object_id: ObjectId,
    /// 1-based attempt number
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ReplicationTask {
    #[must_use]
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// The follow-up task after a transient failure
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            object_id: self.object_id,
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
        }
    }
}

/// Capacity reserved for one in-flight upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSlot {
    pub owner_id: OwnerId,
    pub object_id: ObjectId,
    pub declared_size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub estimated_memory_bytes: u64,
}
