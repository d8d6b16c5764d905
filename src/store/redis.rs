//! Redis backing store.
//!
//! A lease is a hash (`token`, `holder`, `expires_at`) under `lock:{key}` with
//! a `PEXPIRE` TTL. The token sequence and the highest granted token live next
//! to it under `lock:{key}:seq` and `lock:{key}:granted`; the shared hash tag
//! keeps all three on one cluster slot so each script stays single-shard.
//!
//! Lua numbers are doubles, so token comparisons are exact only below 2^53.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::{aio::MultiplexedConnection, Client, RedisError, Script};

use super::{StoreAdapter, StoreResult};
use crate::error::StoreError;
use crate::lease::{wall_clock_deadline, FencingToken, LeaseRecord};

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
local granted = redis.call('GET', KEYS[2])
if granted and tonumber(granted) >= tonumber(ARGV[1]) then
    return 0
end
redis.call('HSET', KEYS[1], 'token', ARGV[1], 'holder', ARGV[2], 'expires_at', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
redis.call('SET', KEYS[2], ARGV[1])
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    create: Script,
    extend: Script,
    delete: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::unavailable_with_source("invalid redis url", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::unavailable_with_source("redis connect failed", e))?;
        tracing::debug!(url, "connected to redis");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            create: Script::new(CREATE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
        }
    }
}

fn lease_key(key: &str) -> String {
    format!("lock:{{{}}}", key)
}

fn sequence_key(key: &str) -> String {
    format!("lock:{{{}}}:seq", key)
}

fn granted_key(key: &str) -> String {
    format!("lock:{{{}}}:granted", key)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn unavailable(operation: &'static str) -> impl FnOnce(RedisError) -> StoreError {
    move |e| StoreError::unavailable_with_source(format!("redis {} failed", operation), e)
}

fn decode_record(key: &str, fields: HashMap<String, String>) -> StoreResult<Option<LeaseRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::corrupt(key, format!("missing field {}", name)))
    };
    let token = field("token")?
        .parse::<u64>()
        .map_err(|e| StoreError::corrupt(key, format!("bad token: {}", e)))?;
    let holder_id = field("holder")?.clone();
    let expires_at_ms = field("expires_at")?
        .parse::<i64>()
        .map_err(|e| StoreError::corrupt(key, format!("bad expires_at: {}", e)))?;
    let expires_at = Utc
        .timestamp_millis_opt(expires_at_ms)
        .single()
        .ok_or_else(|| StoreError::corrupt(key, "expires_at out of range"))?;

    Ok(Some(LeaseRecord {
        token: FencingToken::new(token),
        holder_id,
        expires_at,
    }))
}

#[async_trait]
impl StoreAdapter for RedisStore {
    async fn try_create(
        &self,
        key: &str,
        record: &LeaseRecord,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .create
            .key(lease_key(key))
            .key(granted_key(key))
            .arg(record.token.sequence())
            .arg(&record.holder_id)
            .arg(record.expires_at.timestamp_millis())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("try_create"))?;
        Ok(created == 1)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: FencingToken,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let expires_at = wall_clock_deadline(ttl);
        let extended: i64 = self
            .extend
            .key(lease_key(key))
            .arg(expected.sequence())
            .arg(expires_at.timestamp_millis())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("compare_and_extend"))?;
        Ok(extended == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: FencingToken) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete
            .key(lease_key(key))
            .arg(expected.sequence())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("compare_and_delete"))?;
        Ok(deleted == 1)
    }

    async fn read(&self, key: &str) -> StoreResult<Option<LeaseRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(lease_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable("read"))?;
        decode_record(key, fields)
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(sequence_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable("next_sequence"))
    }
}
