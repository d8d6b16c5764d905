//! The atomic primitives the lock needs from its backing store.
//!
//! Every method is one linearizable round trip. Conditional operations report
//! a lost race as `Ok(false)`; only an unreachable or misbehaving store is an
//! `Err`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::lease::{FencingToken, LeaseRecord};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Stores `record` under `key` with the given time-to-live.
    ///
    /// Succeeds only when `key` holds no live lease and `record.token` is
    /// strictly greater than every token previously granted for `key`.
    async fn try_create(&self, key: &str, record: &LeaseRecord, ttl: Duration)
        -> StoreResult<bool>;

    /// Pushes the expiry of the live lease out to `ttl` from now, provided it
    /// still carries `expected`.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: FencingToken,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Deletes the live lease, provided it still carries `expected`.
    async fn compare_and_delete(&self, key: &str, expected: FencingToken) -> StoreResult<bool>;

    /// Point-in-time view of the live lease. Advisory only.
    async fn read(&self, key: &str) -> StoreResult<Option<LeaseRecord>>;

    /// Atomically increments and returns the per-key token sequence.
    ///
    /// The counter outlives every lease on the key.
    async fn next_sequence(&self, key: &str) -> StoreResult<u64>;
}
