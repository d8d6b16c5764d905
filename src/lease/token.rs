use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::StoreRetryConfig;
use crate::error::Result;
use crate::store::StoreAdapter;
use crate::util::retry::with_store_retry;

/// Monotonic token issued with every successful acquisition.
///
/// Resources guarded by the lock compare tokens and refuse anything lower than
/// the highest they have already seen; see [`TokenFence`](crate::TokenFence).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub const fn sequence(self) -> u64 {
        self.0
    }
}

impl From<u64> for FencingToken {
    fn from(sequence: u64) -> Self {
        Self(sequence)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Draws candidate tokens from the store's per-key sequence.
///
/// Nothing is counted in process memory, so a restarted client can never hand
/// out a token it (or anyone else) has already used.
pub struct FencingTokenGenerator<S: StoreAdapter + ?Sized> {
    store: Arc<S>,
    retry: StoreRetryConfig,
}

impl<S: StoreAdapter + ?Sized> Clone for FencingTokenGenerator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
        }
    }
}

impl<S: StoreAdapter + ?Sized> FencingTokenGenerator<S> {
    pub fn new(store: Arc<S>, retry: StoreRetryConfig) -> Self {
        Self { store, retry }
    }

    pub async fn next(&self, key: &str) -> Result<FencingToken> {
        let sequence = with_store_retry(&self.retry, "next_sequence", || {
            self.store.next_sequence(key)
        })
        .await?;
        Ok(FencingToken::new(sequence))
    }
}
