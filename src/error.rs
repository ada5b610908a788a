//! Tagged error taxonomy for the sync engine.
//!
//! One enum carries every failure mode the core can produce, each tagged
//! with the stable string code a host can forward to its own transport-level
//! error mapping without depending on this crate's variant names directly.

use thiserror::Error;

use crate::device_registry::DeviceId;

/// Result alias used throughout this crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Structured, tagged error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    #[error("device inactive: {device_id}")]
    DeviceInactive { device_id: DeviceId },

    #[error("device already registered: user={user_id} name={name}")]
    DuplicateDevice { user_id: String, name: String },

    #[error("invalid vector clock: {reason}")]
    InvalidVectorClock { reason: String },

    #[error("stale device counter: device={device_id} got={got} expected_at_least={expected}")]
    StaleDeviceCounter {
        device_id: DeviceId,
        got: u64,
        expected: u64,
    },

    #[error("conflict not found: {conflict_id}")]
    ConflictNotFound { conflict_id: String },

    #[error("conflict already resolved: {conflict_id}")]
    AlreadyResolved { conflict_id: String },

    #[error("manual resolution value required for conflict {conflict_id}")]
    MissingResolution { conflict_id: String },

    #[error("automatic merge failed for conflict {conflict_id}: {conflicting_paths} conflicting path(s)")]
    AutoMergeFailed {
        conflict_id: String,
        conflicting_paths: usize,
    },

    #[error("invalid delta at path {path}: {reason}")]
    InvalidDelta { path: String, reason: String },

    #[error("store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("quota exceeded: {detail}")]
    QuotaExceeded { detail: String },

    #[error("validation error: {detail}")]
    Validation { detail: String },
}

impl SyncError {
    /// Stable language-independent error tag, suitable for bridging to a
    /// transport-layer error code.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            SyncError::DeviceInactive { .. } => "DEVICE_INACTIVE",
            SyncError::DuplicateDevice { .. } => "DUPLICATE_DEVICE",
            SyncError::InvalidVectorClock { .. } => "INVALID_VECTOR_CLOCK",
            SyncError::StaleDeviceCounter { .. } => "STALE_DEVICE_COUNTER",
            SyncError::ConflictNotFound { .. } => "CONFLICT_NOT_FOUND",
            SyncError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            SyncError::MissingResolution { .. } => "MISSING_RESOLUTION",
            SyncError::AutoMergeFailed { .. } => "AUTO_MERGE_FAILED",
            SyncError::InvalidDelta { .. } => "INVALID_DELTA",
            SyncError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            SyncError::Timeout { .. } => "TIMEOUT",
            SyncError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            SyncError::Validation { .. } => "VALIDATION_ERROR",
        }
    }

    /// Whether a caller may safely retry the operation that produced this
    /// error (per the retry policy in the error handling design).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable { .. } | SyncError::Timeout { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::StoreUnavailable {
            source: Box::new(err),
        }
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(err: r2d2::Error) -> Self {
        SyncError::StoreUnavailable {
            source: Box::new(err),
        }
    }
}
