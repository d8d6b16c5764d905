//! Lease-based distributed mutual exclusion with fencing tokens.
//!
//! A [`LockCore`] grants [`LockHandle`]s for string keys by creating lease
//! records in a [`StoreAdapter`] that offers linearizable conditional writes
//! with per-key TTL. Every grant carries a [`FencingToken`] drawn from a
//! counter kept in the store, strictly increasing per key, so resources can
//! reject writes from a holder that lost its lease without noticing
//! ([`TokenFence`]).
//!
//! Leases expire unless renewed. By default each handle gets a background
//! renewer ticking at a third of the lease duration; release stops that
//! renewer before deleting the lease, and the delete only succeeds if the
//! stored token is still the handle's own.
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//! use fenced_lock::{InMemoryStore, LockConfig, LockCore};
//!
//! # async fn run() -> fenced_lock::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let locks = LockCore::new(store, LockConfig::default())?;
//!
//! let handle = locks
//!     .acquire("reports/daily", Duration::from_secs(10), Duration::from_secs(2))
//!     .await?;
//! // write to the guarded resource, passing handle.token() along
//! locks.release(handle).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fence;
pub mod lease;
pub mod observability;
pub mod store;

mod util;

pub use config::{LockConfig, StoreRetryConfig};
pub use error::{LockError, Result, StoreError};
pub use fence::TokenFence;
pub use lease::{
    FencingToken, FencingTokenGenerator, LeaseRecord, LeaseStatus, LockCore, LockHandle,
};
pub use store::{InMemoryStore, StoreAdapter};
#[cfg(feature = "redis")]
pub use store::RedisStore;
