use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::idempotency::record::StoredRecord;
use crate::observability::get_metrics;

/// Key-value store holding stored records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<()>;

    async fn forget(&self, key: &str) -> Result<bool>;
}

/// Handle to a held lock. `owner` is unique per acquisition so only the holder can release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub owner: String,
}

impl LockToken {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: Uuid::new_v4().to_string(),
        }
    }
}

/// Mutual exclusion shared by every guard instance that talks to the same store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Makes a single attempt to take the lock. `Ok(None)` means someone else holds it.
    async fn acquire(&self, name: &str, lease: Duration) -> Result<Option<LockToken>>;

    async fn release(&self, token: &LockToken) -> Result<()>;
}

/// Scoped lock acquisition.
///
/// Call [`LockGuard::release`] on every normal exit. If the guard is dropped while still
/// holding the lock (handler panic, request cancelled), the release is spawned onto the
/// current runtime; without a runtime the lease expiry frees it.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Retries `acquire` every `retry_interval` until `wait` has elapsed.
    /// A zero `wait` makes exactly one attempt.
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        name: &str,
        lease: Duration,
        wait: Duration,
        retry_interval: Duration,
    ) -> Result<Option<LockGuard>> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(token) = lock.acquire(name, lease).await? {
                return Ok(Some(LockGuard {
                    lock,
                    token: Some(token),
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(retry_interval.min(deadline - now)).await;
        }
    }

    /// Releases the lock. The token stays armed until the store confirms, so a
    /// cancelled or failed release falls back to the deferred release in `Drop`.
    pub async fn release(mut self) {
        let Some(token) = self.token.clone() else {
            return;
        };
        match self.lock.release(&token).await {
            Ok(()) => self.token = None,
            Err(e) => tracing::warn!(lock = %token.name, "Failed to release idempotency lock: {}", e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let lock = Arc::clone(&self.lock);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release(&token).await {
                        tracing::warn!(lock = %token.name, "Deferred lock release failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(lock = %token.name, "No runtime to release lock, waiting for lease expiry");
            }
        }
    }
}

/// How often the in-memory stores drop entries whose deadline has passed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// String-keyed map of values with deadlines.
///
/// Expired entries are invisible to lookups and are swept out on writes at most
/// once per [`SWEEP_INTERVAL`], so keys that are never read again still get freed.
#[derive(Debug)]
struct ExpiringMap<V> {
    entries: HashMap<String, (V, Instant)>,
    next_sweep: Instant,
}

impl<V> Default for ExpiringMap<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_sweep: Instant::now(),
        }
    }
}

impl<V> ExpiringMap<V> {
    fn get(&self, key: &str, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value)
    }

    fn insert(&mut self, key: &str, value: V, expires: Instant, now: Instant) {
        self.sweep(now);
        self.entries.insert(key.to_string(), (value, expires));
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    fn live(&self, now: Instant) -> usize {
        self.entries.values().filter(|(_, expires)| *expires > now).count()
    }

    fn sweep(&mut self, now: Instant) {
        if now < self.next_sweep {
            return;
        }
        self.entries.retain(|_, (_, expires)| *expires > now);
        self.next_sweep = now + SWEEP_INTERVAL;
    }
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct InMemoryResponseCache {
    entries: Mutex<ExpiringMap<StoredRecord>>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().map(|entries| entries.live(now)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, ExpiringMap<StoredRecord>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("in-memory response cache poisoned")))
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        Ok(self.entries()?.get(key, Instant::now()).cloned())
    }

    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        self.entries()?.insert(key, record.clone(), now + ttl, now);
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }
}

/// Process-local lock table with lease expiry.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<ExpiringMap<String>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        let now = Instant::now();
        self.held
            .lock()
            .map(|held| held.get(name, now).is_some())
            .unwrap_or(false)
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, ExpiringMap<String>>> {
        self.held
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("in-memory lock table poisoned")))
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, name: &str, lease: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut held = self.held()?;

        if held.get(name, now).is_some() {
            return Ok(None);
        }

        let token = LockToken::new(name);
        held.insert(name, token.owner.clone(), now + lease, now);
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let mut held = self.held()?;
        if held.entries.get(&token.name).is_some_and(|(owner, _)| *owner == token.owner) {
            held.remove(&token.name);
        }
        Ok(())
    }
}

/// Redis-backed response cache. Records are stored as JSON with `SET EX`.
pub struct RedisResponseCache {
    client: redis::Client,
}

impl RedisResponseCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let start = std::time::Instant::now();
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        get_metrics().record_store_operation("cache_get", start.elapsed().as_secs_f64() * 1000.0, result.is_ok());

        match result.map_err(AppError::Redis)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let start = std::time::Instant::now();
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let result: redis::RedisResult<()> = conn.set_ex(key, json, ttl.as_secs().max(1)).await;
        get_metrics().record_store_operation("cache_put", start.elapsed().as_secs_f64() * 1000.0, result.is_ok());

        result.map_err(AppError::Redis)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let deleted: i64 = conn.del(key).await.map_err(AppError::Redis)?;
        Ok(deleted > 0)
    }
}

// Deletes the lock only while it still belongs to the caller.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed lock using `SET NX PX` with an owner token.
pub struct RedisLock {
    client: redis::Client,
    release_script: redis::Script,
}

impl RedisLock {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, name: &str, lease: Duration) -> Result<Option<LockToken>> {
        let start = std::time::Instant::now();
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let token = LockToken::new(name);
        let lease_ms = lease.as_millis().max(1) as usize;
        let result: redis::RedisResult<Option<String>> = conn
            .set_options(
                name,
                &token.owner,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(lease_ms)),
            )
            .await;
        get_metrics().record_store_operation("lock_acquire", start.elapsed().as_secs_f64() * 1000.0, result.is_ok());

        Ok(result.map_err(AppError::Redis)?.map(|_| token))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let released: i64 = self
            .release_script
            .key(&token.name)
            .arg(&token.owner)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        if released == 0 {
            tracing::debug!(lock = %token.name, "Lock already expired or taken over before release");
        }

        Ok(())
    }
}
