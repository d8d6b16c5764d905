//! Single-process store for tests and embedded use.
//!
//! Expiry runs on tokio's clock, so tests with a paused runtime control lease
//! timing exactly. Fault hooks simulate partitions and flaky round trips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{StoreAdapter, StoreResult};
use crate::error::StoreError;
use crate::lease::{FencingToken, LeaseRecord};
use crate::util::deadline_after;

struct Slot {
    record: LeaseRecord,
    deadline: Instant,
}

#[derive(Default)]
struct Keyspace {
    leases: HashMap<String, Slot>,
    sequences: HashMap<String, u64>,
    granted: HashMap<String, FencingToken>,
}

impl Keyspace {
    /// Returns the live slot for `key`, dropping it first if its TTL ran out.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self
            .leases
            .get(key)
            .map_or(false, |slot| slot.deadline <= now)
        {
            self.leases.remove(key);
        }
        self.leases.get_mut(key)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<Keyspace>,
    partitioned: AtomicBool,
    pending_failures: AtomicUsize,
    lose_create_reply: AtomicBool,
    ops: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every operation as unavailable until [`heal`](Self::heal).
    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
    }

    /// Fails the next `n` operations as unavailable.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Lets the next create apply, then reports it as unavailable, as when
    /// the reply is lost on the way back.
    pub fn lose_next_create_reply(&self) {
        self.lose_create_reply.store(true, Ordering::SeqCst);
    }

    /// Drops the lease on `key` as if its TTL had just run out.
    pub fn evict(&self, key: &str) -> bool {
        self.keyspace().leases.remove(key).is_some()
    }

    /// Number of operations attempted so far, failed ones included.
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, operation: &str) -> StoreResult<()> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(format!(
                "{} failed: store partitioned",
                operation
            )));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::unavailable(format!(
                "{} failed: injected fault",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    async fn try_create(
        &self,
        key: &str,
        record: &LeaseRecord,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.admit("try_create")?;
        let mut keyspace = self.keyspace();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        if matches!(keyspace.granted.get(key), Some(granted) if *granted >= record.token) {
            return Ok(false);
        }

        keyspace.granted.insert(key.to_owned(), record.token);
        keyspace.leases.insert(
            key.to_owned(),
            Slot {
                record: record.clone(),
                deadline: deadline_after(Instant::now(), ttl),
            },
        );
        if self.lose_create_reply.swap(false, Ordering::SeqCst) {
            return Err(StoreError::unavailable("try_create reply lost"));
        }
        Ok(true)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: FencingToken,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.admit("compare_and_extend")?;
        let mut keyspace = self.keyspace();
        match keyspace.live(key) {
            Some(slot) if slot.record.token == expected => {
                slot.deadline = deadline_after(Instant::now(), ttl);
                slot.record = slot.record.extended(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: FencingToken) -> StoreResult<bool> {
        self.admit("compare_and_delete")?;
        let mut keyspace = self.keyspace();
        let owned = keyspace
            .live(key)
            .map_or(false, |slot| slot.record.token == expected);
        if owned {
            keyspace.leases.remove(key);
        }
        Ok(owned)
    }

    async fn read(&self, key: &str) -> StoreResult<Option<LeaseRecord>> {
        self.admit("read")?;
        Ok(self.keyspace().live(key).map(|slot| slot.record.clone()))
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        self.admit("next_sequence")?;
        let mut keyspace = self.keyspace();
        let sequence = keyspace.sequences.entry(key.to_owned()).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }
}
