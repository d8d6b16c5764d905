//! Error types for lock and store operations.
//!
//! Contention and lease loss are reported as explicit variants rather than
//! folded into a generic failure, so callers can tell "someone else has it"
//! apart from "the store is down" and from "you no longer own what you think
//! you own".

use std::time::Duration;

use crate::lease::FencingToken;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, LockError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Failures reported by a [`StoreAdapter`](crate::store::StoreAdapter).
///
/// A `false` from a conditional operation is a normal outcome and never shows
/// up here.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time.
    #[error("store unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The store answered with data that could not be decoded.
    #[error("corrupt lease record for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Only transient unavailability is worth another round trip.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Outcomes of lock operations other than success.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The store stayed unreachable for every allowed attempt.
    #[error("store unavailable after {attempts} attempt(s)")]
    StoreUnavailable {
        attempts: usize,
        #[source]
        source: StoreError,
    },

    /// The store reported a fault that retrying cannot fix.
    #[error(transparent)]
    Store(StoreError),

    /// Acquisition timed out under contention.
    #[error("lock {key} still held by another owner after waiting {waited:?}")]
    LockUnavailable { key: String, waited: Duration },

    /// Release found the lease already expired or taken over.
    ///
    /// Any work done under the handle may have overlapped with another holder.
    #[error("lease on {key} with token {token} was already lost")]
    LockAlreadyLost { key: String, token: FencingToken },

    /// Renewal found that another holder owns the key.
    #[error("lease on {key} with token {token} was preempted")]
    Preempted { key: String, token: FencingToken },

    #[error("lock key must not be empty")]
    InvalidKey,

    #[error("invalid lease duration: {0:?}")]
    InvalidLease(Duration),

    /// A guarded resource has already seen a newer holder.
    #[error("stale fencing token {presented}, resource has seen {highest}")]
    StaleToken {
        presented: FencingToken,
        highest: FencingToken,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LockError {
    /// True for the conditions that mean the caller's critical section may no
    /// longer be exclusive.
    #[must_use]
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LockAlreadyLost { .. } | Self::Preempted { .. })
    }
}
