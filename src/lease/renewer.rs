use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};

use super::{manager::extend_lease, LeaseState, LeaseStatus};
use crate::config::StoreRetryConfig;
use crate::store::StoreAdapter;
use crate::util::runnable::{run_at_fixed_interval, PeriodicRunnable};

/// Keeps one handle's lease alive until it is released or lost.
pub(crate) struct LeaseRenewer<S: StoreAdapter + ?Sized> {
    store: Arc<S>,
    lease: Arc<LeaseState>,
    retry: StoreRetryConfig,
}

impl<S: StoreAdapter + ?Sized> LeaseRenewer<S> {
    pub(crate) fn new(store: Arc<S>, lease: Arc<LeaseState>, retry: StoreRetryConfig) -> Self {
        Self {
            store,
            lease,
            retry,
        }
    }
}

#[async_trait]
impl<S: StoreAdapter + ?Sized> PeriodicRunnable for LeaseRenewer<S> {
    async fn run_once(&self) -> bool {
        if self.lease.status() != LeaseStatus::Held {
            return false;
        }

        match extend_lease(
            self.store.as_ref(),
            &self.retry,
            &self.lease,
            self.lease.lease_duration,
        )
        .await
        {
            Ok(()) => true,
            // A failed compare-and-extend proves the lease is gone.
            Err(e) if e.is_lease_lost() => false,
            Err(e) => {
                if self.lease.deadline_passed() {
                    self.lease.transition(LeaseStatus::Expired);
                    tracing::warn!(
                        key = %self.lease.key,
                        token = %self.lease.token,
                        error = %e,
                        "could not renew before the lease ran out"
                    );
                    false
                } else {
                    tracing::warn!(
                        key = %self.lease.key,
                        token = %self.lease.token,
                        error = %e,
                        "renewal failed, will retry on next tick"
                    );
                    true
                }
            }
        }
    }

    async fn before_shutdown_complete(&self) {
        tracing::debug!(
            key = %self.lease.key,
            token = %self.lease.token,
            status = ?self.lease.status(),
            "lease renewer stopped"
        );
    }
}

/// The running renewal task of a handle.
#[derive(Debug)]
pub(crate) struct RenewerTask {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RenewerTask {
    pub(crate) fn spawn<S>(renewer: LeaseRenewer<S>, interval: Duration) -> Self
    where
        S: StoreAdapter + ?Sized + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_at_fixed_interval(
            Arc::new(renewer),
            interval,
            shutdown.clone(),
        ));
        Self { shutdown, task }
    }

    /// Asks the task to stop without waiting for it.
    pub(crate) fn signal(&self) {
        self.shutdown.notify_one();
    }

    /// Stops the task and waits for any in-flight renewal to finish.
    pub(crate) async fn stop(self) {
        self.signal();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "lease renewer terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{FencingToken, LeaseRecord};
    use crate::store::InMemoryStore;
    use tokio::time::Instant;

    async fn held(store: &Arc<InMemoryStore>, lease: Duration) -> Arc<LeaseState> {
        let token = FencingToken::new(store.next_sequence("k").await.unwrap());
        let issued_at = Instant::now();
        assert!(store
            .try_create("k", &LeaseRecord::new(token, "me", lease), lease)
            .await
            .unwrap());
        Arc::new(LeaseState::new(
            "k".to_string(),
            token,
            "me".to_string(),
            lease,
            issued_at,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_lease_alive_past_its_duration() {
        let store = Arc::new(InMemoryStore::new());
        let lease = held(&store, Duration::from_millis(300)).await;
        let task = RenewerTask::spawn(
            LeaseRenewer::new(store.clone(), lease.clone(), StoreRetryConfig::default()),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(lease.status(), LeaseStatus::Held);
        assert_eq!(
            store.read("k").await.unwrap().map(|r| r.token),
            Some(lease.token)
        );

        task.stop().await;
        assert_eq!(lease.status(), LeaseStatus::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn marks_preempted_and_stops_when_lease_is_taken() {
        let store = Arc::new(InMemoryStore::new());
        let lease = held(&store, Duration::from_millis(300)).await;
        let task = RenewerTask::spawn(
            LeaseRenewer::new(store.clone(), lease.clone(), StoreRetryConfig::default()),
            Duration::from_millis(100),
        );

        store.evict("k");
        let mut status = lease.subscribe();
        status.changed().await.unwrap();

        assert_eq!(*status.borrow(), LeaseStatus::Preempted);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expires_when_store_stays_down_past_deadline() {
        let store = Arc::new(InMemoryStore::new());
        let lease = held(&store, Duration::from_millis(300)).await;
        let retry = StoreRetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 10,
        };
        let task = RenewerTask::spawn(
            LeaseRenewer::new(store.clone(), lease.clone(), retry),
            Duration::from_millis(100),
        );

        store.partition();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(lease.status(), LeaseStatus::Expired);
        task.stop().await;
    }
}
