//! Error types for mirrorpool
//!
//! Each failure category is its own variant. Capacity, budget and pool
//! exhaustion mean "busy", `Internal` means "broken"; nothing in the crate
//! converts one into the other.

use crate::types::{IdentifierError, ObjectId};
use std::fmt;
use thiserror::Error;

/// Common result type for mirrorpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which concurrency limit rejected an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityScope {
    Global,
    Owner,
}

impl fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Owner => f.write_str("per-owner"),
        }
    }
}

/// Why no pool account could take a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolExhaustion {
    /// The pool has no accounts configured
    NoAccounts,
    /// No account is in a selectable health state
    Unhealthy,
    /// Selectable accounts exist but none has enough remaining quota
    Quota,
    /// Eligible accounts are all at their session cap
    Saturated,
}

impl PoolExhaustion {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoAccounts => "no_accounts",
            Self::Unhealthy => "unhealthy",
            Self::Quota => "quota",
            Self::Saturated => "saturated",
        }
    }

    /// Quota exhaustion will not clear by waiting for recovery
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unhealthy | Self::Saturated)
    }
}

impl fmt::Display for PoolExhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoAccounts => "no storage accounts configured",
            Self::Unhealthy => "no healthy storage account",
            Self::Quota => "no storage account with enough remaining quota",
            Self::Saturated => "all eligible storage accounts are at their session limit",
        };
        f.write_str(msg)
    }
}

/// User-visible classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// System busy; the same request may succeed shortly
    TryAgainShortly,
    /// The transfer broke; restart or resume the upload
    RetryUpload,
    /// The request itself is wrong
    BadRequest,
    NotFound,
    /// Generic server error
    ServerError,
}

impl ErrorClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TryAgainShortly => "try_again_shortly",
            Self::RetryUpload => "retry_upload",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
        }
    }

    /// Message shown to end users for this class
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::TryAgainShortly => "The service is busy, try again shortly",
            Self::RetryUpload => "The upload was interrupted, retry the upload",
            Self::BadRequest => "The request is invalid",
            Self::NotFound => "Not found",
            Self::ServerError => "Server error",
        }
    }
}

/// Common error type for mirrorpool
#[derive(Debug, Error)]
pub enum Error {
    // Admission errors
    #[error("{scope} upload capacity exhausted (limit {limit})")]
    CapacityExhausted { scope: CapacityScope, limit: usize },

    #[error("memory budget exceeded: requested {requested} bytes, available {available} bytes")]
    ResourceBudgetExceeded { requested: u64, available: u64 },

    #[error("service is shutting down")]
    ShuttingDown,

    // Pool errors
    #[error("storage pool exhausted: {0}")]
    PoolExhausted(PoolExhaustion),

    // Transfer errors
    #[error("transfer fault: {0}")]
    TransferFault(String),

    #[error("upload cancelled: {0}")]
    UploadCancelled(ObjectId),

    #[error("no such upload: {0}")]
    UploadNotFound(ObjectId),

    // Replication errors (asynchronous path only)
    #[error("replication fault: {0}")]
    ReplicationFault(String),

    // Read errors
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("read failed: primary: {primary}; secondary: {}", .secondary.as_deref().unwrap_or("no backup copy"))]
    ReadFailed {
        primary: String,
        secondary: Option<String>,
    },

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    // Collaborator errors
    #[error("metadata store error: {0}")]
    MetadataStore(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a transfer fault
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFault(msg.into())
    }

    /// Check if the caller may retry the same request after a backoff
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::CapacityExhausted { .. } | Self::ResourceBudgetExceeded { .. } | Self::ShuttingDown => true,
            Self::PoolExhausted(reason) => reason.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is an internal fault
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// User-visible classification
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::CapacityExhausted { .. }
            | Self::ResourceBudgetExceeded { .. }
            | Self::PoolExhausted(_)
            | Self::ShuttingDown => ErrorClass::TryAgainShortly,

            Self::TransferFault(_) | Self::UploadCancelled(_) => ErrorClass::RetryUpload,

            Self::InvalidRequest(_) | Self::InvalidIdentifier(_) => ErrorClass::BadRequest,

            Self::ObjectNotFound(_) | Self::UploadNotFound(_) => ErrorClass::NotFound,

            Self::ReadFailed { .. }
            | Self::ReplicationFault(_)
            | Self::MetadataStore(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorClass::ServerError,
        }
    }

    /// Get HTTP status code for the transport layer
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidRequest(_) | Self::InvalidIdentifier(_) => 400,

            // 404 Not Found
            Self::ObjectNotFound(_) | Self::UploadNotFound(_) => 404,

            // 409 Conflict
            Self::UploadCancelled(_) => 409,

            // 429 Too Many Requests
            Self::CapacityExhausted { .. } | Self::ResourceBudgetExceeded { .. } => 429,

            // 500 Internal Server Error
            Self::Internal(_)
            | Self::MetadataStore(_)
            | Self::Configuration(_)
            | Self::ReplicationFault(_) => 500,

            // 502 Bad Gateway
            Self::TransferFault(_) | Self::ReadFailed { .. } => 502,

            // 503 Service Unavailable
            Self::PoolExhausted(_) | Self::ShuttingDown => 503,
        }
    }

    /// Stable machine-readable error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CapacityExhausted { .. } => "CapacityExhausted",
            Self::ResourceBudgetExceeded { .. } => "ResourceBudgetExceeded",
            Self::ShuttingDown => "ShuttingDown",
            Self::PoolExhausted(_) => "PoolExhausted",
            Self::TransferFault(_) => "TransferFault",
            Self::UploadCancelled(_) => "UploadCancelled",
            Self::UploadNotFound(_) => "NoSuchUpload",
            Self::ReplicationFault(_) => "ReplicationFault",
            Self::ObjectNotFound(_) => "NoSuchObject",
            Self::ReadFailed { .. } => "ReadFailed",
            Self::InvalidRequest(_) | Self::InvalidIdentifier(_) => "InvalidRequest",
            Self::MetadataStore(_) | Self::Configuration(_) | Self::Internal(_) => "InternalError",
        }
    }
}
