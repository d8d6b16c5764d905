use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::util::deadline_after;

mod handle;
pub(crate) mod manager;
mod renewer;
mod token;

pub use handle::LockHandle;
pub use manager::LockCore;
pub use token::{FencingToken, FencingTokenGenerator};

/// The lease as the backing store keeps it, one per lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub token: FencingToken,
    pub holder_id: String,
    /// Wall-clock estimate written by the holder. The store's own TTL is what
    /// actually ends the lease.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(token: FencingToken, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token,
            holder_id: holder_id.into(),
            expires_at: wall_clock_deadline(ttl),
        }
    }

    /// The same lease with its expiry moved to `ttl` from now.
    pub fn extended(&self, ttl: Duration) -> Self {
        Self {
            expires_at: wall_clock_deadline(ttl),
            ..self.clone()
        }
    }
}

pub(crate) fn wall_clock_deadline(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Where a handle is in its life. Leaves `Held` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    Released,
    /// The lease ran out locally before it could be renewed.
    Expired,
    /// The store no longer carries this handle's token.
    Preempted,
}

/// State shared between a handle, its renewer and the core.
///
/// Only the core and the renewer write `status`; the caller only reads it.
#[derive(Debug)]
pub(crate) struct LeaseState {
    pub(crate) key: String,
    pub(crate) token: FencingToken,
    pub(crate) holder_id: String,
    pub(crate) lease_duration: Duration,
    status: watch::Sender<LeaseStatus>,
    deadline: Mutex<Instant>,
}

impl LeaseState {
    pub(crate) fn new(
        key: String,
        token: FencingToken,
        holder_id: String,
        lease_duration: Duration,
        acquired_at: Instant,
    ) -> Self {
        let (status, _) = watch::channel(LeaseStatus::Held);
        Self {
            key,
            token,
            holder_id,
            lease_duration,
            status,
            deadline: Mutex::new(deadline_after(acquired_at, lease_duration)),
        }
    }

    pub(crate) fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status.subscribe()
    }

    /// Moves out of `Held`. Returns false if some other transition won.
    pub(crate) fn transition(&self, to: LeaseStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == LeaseStatus::Held && to != LeaseStatus::Held {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a successful extension that was issued at `issued_at`.
    ///
    /// Measured from the send time, so the local deadline never trails the
    /// store's.
    pub(crate) fn extend_deadline(&self, issued_at: Instant, ttl: Duration) {
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = deadline_after(issued_at, ttl);
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// The status a lost lease should take: expired if we had already run out
    /// locally, preempted otherwise.
    pub(crate) fn lost_status(&self) -> LeaseStatus {
        if self.deadline_passed() {
            LeaseStatus::Expired
        } else {
            LeaseStatus::Preempted
        }
    }
}
