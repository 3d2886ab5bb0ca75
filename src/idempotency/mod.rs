pub mod fingerprint;
pub mod guard;
pub mod identity;
pub mod key;
pub mod record;
pub mod storage;

pub use fingerprint::fingerprint;
pub use guard::{
    IdempotencyConfig, IdempotencyGuard, IdempotencyMetrics, MetricsSnapshot, REPLAYED_HEADER,
};
pub use identity::{
    AnonymousIdentityResolver, ExtensionIdentityResolver, IdentityResolver, RequesterIdentity,
};
pub use key::{cache_key, key_segment, lock_name, validate_key};
pub use record::{StoredHeaderValue, StoredRecord};
pub use storage::{
    DistributedLock, InMemoryLock, InMemoryResponseCache, LockGuard, LockToken, RedisLock,
    RedisResponseCache, ResponseCache,
};

use std::sync::Arc;

use crate::config::{Settings, StoreKind};
use crate::error::Result;

/// Builds a guard from settings, wiring the configured store.
pub fn build_guard(settings: &Settings) -> Result<IdempotencyGuard> {
    let config = IdempotencyConfig::from_settings(&settings.idempotency)?;

    let (cache, lock): (Arc<dyn ResponseCache>, Arc<dyn DistributedLock>) =
        match settings.idempotency.store {
            StoreKind::Memory => (
                Arc::new(InMemoryResponseCache::new()),
                Arc::new(InMemoryLock::new()),
            ),
            StoreKind::Redis => {
                let client = redis::Client::open(settings.redis.url.as_str())?;
                (
                    Arc::new(RedisResponseCache::new(client.clone())),
                    Arc::new(RedisLock::new(client)),
                )
            }
        };

    tracing::info!(
        store = ?settings.idempotency.store,
        header = %config.header,
        ttl_secs = config.ttl.as_secs(),
        "Idempotency guard configured"
    );

    Ok(IdempotencyGuard::new(config, cache, lock))
}
