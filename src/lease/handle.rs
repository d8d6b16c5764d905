use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::renewer::RenewerTask;
use super::{FencingToken, LeaseState, LeaseStatus};

/// One successful acquisition of a lock key.
///
/// Owned by the caller that acquired it and consumed by
/// [`LockCore::release`](crate::LockCore::release). Dropping a handle that is
/// still held stops its renewer and lets the lease lapse at its TTL.
///
/// Validity is a local view. The store can expire the lease before the next
/// renewal tick notices, so long critical sections should check
/// [`is_valid`](Self::is_valid) as they go and pass [`token`](Self::token) to
/// whatever they write.
#[derive(Debug)]
pub struct LockHandle {
    lease: Arc<LeaseState>,
    renewer: Option<RenewerTask>,
    abandoned: bool,
}

impl LockHandle {
    pub(crate) fn new(lease: Arc<LeaseState>, renewer: Option<RenewerTask>) -> Self {
        Self {
            lease,
            renewer,
            abandoned: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub fn token(&self) -> FencingToken {
        self.lease.token
    }

    pub fn holder_id(&self) -> &str {
        &self.lease.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease.lease_duration
    }

    pub fn status(&self) -> LeaseStatus {
        self.lease.status()
    }

    /// Still held, and not past the locally tracked lease deadline.
    pub fn is_valid(&self) -> bool {
        self.status() == LeaseStatus::Held && !self.lease.deadline_passed()
    }

    /// Time left on the lease as last confirmed by the store.
    pub fn remaining(&self) -> Duration {
        self.lease.deadline().saturating_duration_since(Instant::now())
    }

    /// Resolves once the handle stops being held, with the status it moved to.
    pub async fn lost(&self) -> LeaseStatus {
        let mut status = self.lease.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current != LeaseStatus::Held {
                return current;
            }
            if status.changed().await.is_err() {
                return self.lease.status();
            }
        }
    }

    pub(crate) fn lease(&self) -> &Arc<LeaseState> {
        &self.lease
    }

    pub(crate) fn take_renewer(&mut self) -> Option<RenewerTask> {
        self.renewer.take()
    }

    /// Marks a handle whose release could not reach the store, so dropping it
    /// is not reported as a forgotten release.
    pub(crate) fn abandon(&mut self) {
        self.abandoned = true;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.signal();
        }
        if !self.abandoned && self.lease.status() == LeaseStatus::Held {
            tracing::warn!(
                key = %self.lease.key,
                token = %self.lease.token,
                "lock handle dropped while held, lease will lapse at its TTL"
            );
        }
    }
}
