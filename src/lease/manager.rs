use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use super::handle::LockHandle;
use super::renewer::{LeaseRenewer, RenewerTask};
use super::{FencingToken, FencingTokenGenerator, LeaseRecord, LeaseState, LeaseStatus};
use crate::config::{LockConfig, StoreRetryConfig};
use crate::error::{LockError, Result};
use crate::store::StoreAdapter;
use crate::util::deadline_after;
use crate::util::retry::{backoff_with_jitter, with_store_retry};

/// Acquires, renews and releases leases against one backing store.
///
/// The store is the only authority on who holds a key. Nothing in here is a
/// lock table; a `LockCore` can be dropped or the process restarted without
/// affecting exclusivity.
pub struct LockCore<S: StoreAdapter + ?Sized> {
    store: Arc<S>,
    tokens: FencingTokenGenerator<S>,
    config: LockConfig,
    holder_id: String,
}

impl<S: StoreAdapter + ?Sized> Clone for LockCore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tokens: self.tokens.clone(),
            config: self.config.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StoreAdapter + ?Sized + 'static> LockCore<S> {
    pub fn new(store: Arc<S>, config: LockConfig) -> Result<Self> {
        config.validate()?;
        let holder_id = config
            .holder_id
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());
        Ok(Self {
            tokens: FencingTokenGenerator::new(Arc::clone(&store), config.store_retry.clone()),
            store,
            config,
            holder_id,
        })
    }

    pub fn with_default_config(store: Arc<S>) -> Self {
        let config = LockConfig::default();
        Self {
            tokens: FencingTokenGenerator::new(Arc::clone(&store), config.store_retry.clone()),
            store,
            config,
            holder_id: Ulid::new().to_string(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires `key` for `lease_duration`, retrying under contention for up
    /// to `timeout`.
    ///
    /// # Errors
    ///
    /// [`LockError::LockUnavailable`] when the timeout runs out while someone
    /// else holds the key, [`LockError::StoreUnavailable`] when the store
    /// stays unreachable through the bounded retry.
    #[tracing::instrument(level = "debug", skip(self), fields(holder = %self.holder_id))]
    pub async fn acquire(
        &self,
        key: &str,
        lease_duration: Duration,
        timeout: Duration,
    ) -> Result<LockHandle> {
        if key.is_empty() {
            return Err(LockError::InvalidKey);
        }
        validate_lease(lease_duration)?;

        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Some(handle) = self.attempt(key, lease_duration).await? {
                tracing::info!(
                    key,
                    token = %handle.token(),
                    attempt,
                    "lock acquired"
                );
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(key, attempt, "gave up waiting for lock");
                return Err(LockError::LockUnavailable {
                    key: key.to_owned(),
                    waited: now - started,
                });
            }

            let delay = backoff_with_jitter(
                self.config.acquire_backoff_base(),
                self.config.acquire_backoff_max(),
                attempt,
            )
            .min(deadline - now);
            tracing::debug!(
                key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "lock busy, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One acquisition attempt with no waiting.
    pub async fn try_acquire(&self, key: &str, lease_duration: Duration) -> Result<LockHandle> {
        self.acquire(key, lease_duration, Duration::ZERO).await
    }

    /// Extends the lease by its original duration.
    ///
    /// # Errors
    ///
    /// [`LockError::Preempted`] once the store no longer carries the handle's
    /// token. The handle is then permanently invalid.
    pub async fn renew(&self, handle: &LockHandle) -> Result<()> {
        self.renew_with(handle, handle.lease_duration()).await
    }

    pub async fn renew_with(&self, handle: &LockHandle, ttl: Duration) -> Result<()> {
        validate_lease(ttl)?;
        extend_lease(
            self.store.as_ref(),
            &self.config.store_retry,
            handle.lease(),
            ttl,
        )
        .await
    }

    /// Stops the handle's renewer, then deletes the lease if it still carries
    /// the handle's token.
    ///
    /// # Errors
    ///
    /// [`LockError::LockAlreadyLost`] if the lease had expired or been taken
    /// over; whatever ran under the handle may not have been exclusive.
    ///
    /// [`LockError::StoreUnavailable`] if the delete could not be delivered.
    /// The handle is consumed either way and renewal has already stopped, so
    /// the lease lapses at its TTL; until then the key stays held.
    pub async fn release(&self, mut handle: LockHandle) -> Result<()> {
        if let Some(renewer) = handle.take_renewer() {
            renewer.stop().await;
        }

        let lease = Arc::clone(handle.lease());
        let deleted = match with_store_retry(&self.config.store_retry, "compare_and_delete", || {
            self.store.compare_and_delete(&lease.key, lease.token)
        })
        .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                handle.abandon();
                tracing::warn!(
                    key = %lease.key,
                    token = %lease.token,
                    lapses_in_ms = handle.remaining().as_millis() as u64,
                    error = %e,
                    "release not delivered, lease will lapse at its TTL"
                );
                return Err(e);
            }
        };

        if deleted {
            lease.transition(LeaseStatus::Released);
            tracing::info!(key = %lease.key, token = %lease.token, "lock released");
            Ok(())
        } else {
            lease.transition(lease.lost_status());
            tracing::warn!(
                key = %lease.key,
                token = %lease.token,
                "release found the lease already lost"
            );
            Err(LockError::LockAlreadyLost {
                key: lease.key.clone(),
                token: lease.token,
            })
        }
    }

    /// Current lease on `key` as the store sees it. May be stale on return.
    pub async fn inspect(&self, key: &str) -> Result<Option<LeaseRecord>> {
        with_store_retry(&self.config.store_retry, "read", || self.store.read(key)).await
    }

    async fn attempt(&self, key: &str, lease_duration: Duration) -> Result<Option<LockHandle>> {
        let token = self.tokens.next(key).await?;
        let record = LeaseRecord::new(token, self.holder_id.as_str(), lease_duration);
        let issued_at = Instant::now();

        let created = with_store_retry(&self.config.store_retry, "try_create", || {
            self.store.try_create(key, &record, lease_duration)
        })
        .await?;

        if !created && !self.created_by_lost_reply(key, token).await {
            return Ok(None);
        }

        let lease = Arc::new(LeaseState::new(
            key.to_owned(),
            token,
            self.holder_id.clone(),
            lease_duration,
            issued_at,
        ));
        let renewer = if self.config.auto_renew {
            Some(RenewerTask::spawn(
                LeaseRenewer::new(
                    Arc::clone(&self.store),
                    Arc::clone(&lease),
                    self.config.store_retry.clone(),
                ),
                self.config.renew_interval(lease_duration),
            ))
        } else {
            None
        };
        Ok(Some(LockHandle::new(lease, renewer)))
    }

    /// After a refused create, checks whether the record on `key` is ours
    /// anyway: a retried create whose first reply was lost looks like
    /// contention. Tokens are never reused, so a match proves ownership.
    async fn created_by_lost_reply(&self, key: &str, token: FencingToken) -> bool {
        match self.store.read(key).await {
            Ok(Some(current)) if current.token == token => true,
            Ok(Some(current)) => {
                tracing::debug!(
                    key,
                    holder = %current.holder_id,
                    token = %current.token,
                    expires_at = %current.expires_at,
                    "lock held"
                );
                false
            }
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(key, error = %e, "advisory read failed");
                false
            }
        }
    }
}

/// A lease must be non-zero and representable as a deadline on the clock.
fn validate_lease(lease: Duration) -> Result<()> {
    if lease.is_zero() || Instant::now().checked_add(lease).is_none() {
        return Err(LockError::InvalidLease(lease));
    }
    Ok(())
}

/// Extends `lease` on the store, shared by explicit renewal and the renewer.
pub(crate) async fn extend_lease<S: StoreAdapter + ?Sized>(
    store: &S,
    retry: &StoreRetryConfig,
    lease: &LeaseState,
    ttl: Duration,
) -> Result<()> {
    if lease.status() != LeaseStatus::Held {
        return Err(LockError::Preempted {
            key: lease.key.clone(),
            token: lease.token,
        });
    }

    let issued_at = Instant::now();
    let extended = with_store_retry(retry, "compare_and_extend", || {
        store.compare_and_extend(&lease.key, lease.token, ttl)
    })
    .await?;

    if extended {
        lease.extend_deadline(issued_at, ttl);
        tracing::debug!(key = %lease.key, token = %lease.token, "lease renewed");
        Ok(())
    } else {
        lease.transition(lease.lost_status());
        tracing::warn!(key = %lease.key, token = %lease.token, "lease lost on renewal");
        Err(LockError::Preempted {
            key: lease.key.clone(),
            token: lease.token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const LEASE: Duration = Duration::from_millis(1_000);

    fn core(store: &Arc<InMemoryStore>) -> LockCore<InMemoryStore> {
        LockCore::new(store.clone(), LockConfig::default().with_auto_renew(false)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_empty_key_and_zero_lease() {
        let store = Arc::new(InMemoryStore::new());
        let locks = core(&store);

        assert!(matches!(
            locks.acquire("", LEASE, Duration::ZERO).await,
            Err(LockError::InvalidKey)
        ));
        assert!(matches!(
            locks.acquire("k", Duration::ZERO, Duration::ZERO).await,
            Err(LockError::InvalidLease(_))
        ));
        assert_eq!(store.op_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_lease_beyond_the_clock() {
        let store = Arc::new(InMemoryStore::new());
        let locks = core(&store);

        assert!(matches!(
            locks.acquire("k", Duration::MAX, Duration::ZERO).await,
            Err(LockError::InvalidLease(_))
        ));

        let handle = locks.try_acquire("k", LEASE).await.unwrap();
        assert!(matches!(
            locks.renew_with(&handle, Duration::MAX).await,
            Err(LockError::InvalidLease(_))
        ));
        assert!(handle.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_waits_for_the_holder() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);
        let b = core(&store);

        let first = a.acquire("k", LEASE, Duration::MAX).await.unwrap();
        let second = b.acquire("k", LEASE, Duration::MAX).await.unwrap();
        assert!(second.token() > first.token());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_create_reply_is_recognised_as_ours() {
        let store = Arc::new(InMemoryStore::new());
        let locks = core(&store);

        store.lose_next_create_reply();
        let handle = locks.try_acquire("k", LEASE).await.unwrap();

        assert_eq!(handle.token(), FencingToken::new(1));
        assert!(handle.is_valid());
        locks.release(handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_release_lapses_at_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let a = LockCore::with_default_config(store.clone());
        let b = core(&store);

        let lease = Duration::from_secs(30);
        let handle = a.try_acquire("k", lease).await.unwrap();
        let token = handle.token();
        store.partition();
        assert!(matches!(
            a.release(handle).await,
            Err(LockError::StoreUnavailable { .. })
        ));
        store.heal();

        // Still held until the TTL, but no longer renewed.
        assert_eq!(a.inspect("k").await.unwrap().map(|r| r.token), Some(token));
        assert!(b.try_acquire("k", LEASE).await.is_err());

        tokio::time::advance(lease).await;
        let next = b.try_acquire("k", LEASE).await.unwrap();
        assert!(next.token() > token);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_reports_contention() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);
        let b = core(&store);

        let held = a.try_acquire("k", LEASE).await.unwrap();
        let err = b.try_acquire("k", LEASE).await.unwrap_err();
        assert!(matches!(err, LockError::LockUnavailable { .. }));

        a.release(held).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_expiry_within_timeout() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);
        let b = core(&store);

        let first = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        let started = Instant::now();
        let second = b
            .acquire("k", LEASE, Duration::from_secs(3))
            .await
            .unwrap();

        assert!(started.elapsed() >= LEASE);
        assert!(second.token() > first.token());
        assert!(!first.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_and_detects_preemption() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);

        let handle = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        a.renew(&handle).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(handle.is_valid());

        store.evict("k");
        let err = a.renew(&handle).await.unwrap_err();
        assert!(matches!(err, LockError::Preempted { .. }));
        assert_eq!(handle.status(), LeaseStatus::Preempted);
        assert!(!handle.is_valid());

        // Short-circuits without touching the store again.
        let ops = store.op_count();
        assert!(a.renew(&handle).await.is_err());
        assert_eq!(store.op_count(), ops);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_expired_lease_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);

        let handle = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        let lease = Arc::clone(handle.lease());
        tokio::time::advance(LEASE).await;

        let err = a.release(handle).await.unwrap_err();
        assert!(matches!(err, LockError::LockAlreadyLost { .. }));
        assert_eq!(lease.status(), LeaseStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_faults_are_absorbed() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);

        store.fail_next(2);
        let handle = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        assert_eq!(handle.token(), FencingToken::new(1));
        a.release(handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn partitioned_store_surfaces_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        let a = core(&store);

        store.partition();
        let err = a
            .acquire("k", LEASE, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::StoreUnavailable { attempts, .. } if attempts == a.config().store_retry.max_attempts
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn inspect_shows_current_holder() {
        let store = Arc::new(InMemoryStore::new());
        let a = LockCore::new(
            store.clone(),
            LockConfig::default()
                .with_auto_renew(false)
                .with_holder_id("worker-a"),
        )
        .unwrap();

        assert!(a.inspect("k").await.unwrap().is_none());
        let handle = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        let record = a.inspect("k").await.unwrap().unwrap();
        assert_eq!(record.holder_id, "worker-a");
        assert_eq!(record.token, handle.token());
        assert_eq!(handle.holder_id(), "worker-a");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_renewal_outlives_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let a = LockCore::with_default_config(store.clone());
        let b = core(&store);

        let handle = a.acquire("k", LEASE, Duration::ZERO).await.unwrap();
        let err = b
            .acquire("k", LEASE, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::LockUnavailable { .. }));
        assert!(handle.is_valid());

        a.release(handle).await.unwrap();
        assert!(b.try_acquire("k", LEASE).await.is_ok());
    }
}
