use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::IdempotencySettings;
use crate::error::{AppError, GuardRejection, Result};
use crate::idempotency::fingerprint::fingerprint;
use crate::idempotency::identity::{ExtensionIdentityResolver, IdentityResolver};
use crate::idempotency::key::{cache_key, lock_name, validate_key};
use crate::idempotency::record::StoredRecord;
use crate::idempotency::storage::{DistributedLock, LockGuard, ResponseCache};
use crate::observability::{get_metrics, mask_key, LatencyTimer};

/// Response header telling the client whether it got a replayed response.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Counters for guard decisions.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub guarded_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub executed_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub fingerprint_mismatches: AtomicU64,
    pub failed_executions: AtomicU64,
    pub unstored_responses: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            guarded_requests: self.guarded_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            fingerprint_mismatches: self.fingerprint_mismatches.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            unstored_responses: self.unstored_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub guarded_requests: u64,
    pub bypassed_requests: u64,
    pub executed_requests: u64,
    pub replayed_requests: u64,
    pub rejected_requests: u64,
    pub lock_conflicts: u64,
    pub fingerprint_mismatches: u64,
    pub failed_executions: u64,
    pub unstored_responses: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.guarded_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.guarded_requests as f64
        }
    }
}

/// Immutable guard configuration, built once and shared by every request.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub header: HeaderName,
    pub ttl: Duration,
    /// Upper-cased method names.
    pub methods: Vec<String>,
    pub min_key_length: usize,
    pub enforce_body_match: bool,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    pub skip_headers: Vec<String>,
    pub max_body_bytes: usize,
    pub max_response_bytes: usize,
}

impl IdempotencyConfig {
    pub fn from_settings(settings: &IdempotencySettings) -> Result<Self> {
        let header = HeaderName::from_bytes(settings.header.trim().as_bytes()).map_err(|e| {
            AppError::Config(format!("invalid idempotency header name {:?}: {}", settings.header, e))
        })?;

        if settings.methods.is_empty() {
            return Err(AppError::Config("idempotency.methods must not be empty".to_string()));
        }
        let methods = settings
            .methods
            .iter()
            .map(|m| {
                let upper = m.trim().to_uppercase();
                Method::from_bytes(upper.as_bytes())
                    .map(|_| upper)
                    .map_err(|e| AppError::Config(format!("invalid HTTP method {:?}: {}", m, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        if settings.ttl_minutes == 0 {
            return Err(AppError::Config("idempotency.ttl_minutes must be positive".to_string()));
        }
        if settings.lock_lease_secs == 0 {
            return Err(AppError::Config("idempotency.lock_lease_secs must be positive".to_string()));
        }
        if settings.lock_wait_ms > 0 && settings.lock_retry_interval_ms == 0 {
            return Err(AppError::Config(
                "idempotency.lock_retry_interval_ms must be positive when lock_wait_ms is set".to_string(),
            ));
        }

        Ok(Self {
            header,
            ttl: Duration::from_secs(settings.ttl_minutes * 60),
            methods,
            min_key_length: settings.min_key_length,
            enforce_body_match: settings.enforce_body_match,
            lock_lease: Duration::from_secs(settings.lock_lease_secs),
            lock_wait: Duration::from_millis(settings.lock_wait_ms),
            lock_retry_interval: Duration::from_millis(settings.lock_retry_interval_ms),
            skip_headers: settings.skip_headers.iter().map(|h| h.to_lowercase()).collect(),
            max_body_bytes: settings.max_body_bytes,
            max_response_bytes: settings.max_response_bytes,
        })
    }

    /// True when the guard applies to this HTTP method.
    pub fn should_process(&self, method: &str) -> bool {
        let method = method.to_uppercase();
        self.methods.iter().any(|m| *m == method)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        let defaults = IdempotencySettings::default();
        Self {
            header: HeaderName::from_static("idempotency-key"),
            ttl: Duration::from_secs(defaults.ttl_minutes * 60),
            methods: defaults.methods,
            min_key_length: defaults.min_key_length,
            enforce_body_match: defaults.enforce_body_match,
            lock_lease: Duration::from_secs(defaults.lock_lease_secs),
            lock_wait: Duration::from_millis(defaults.lock_wait_ms),
            lock_retry_interval: Duration::from_millis(defaults.lock_retry_interval_ms),
            skip_headers: defaults.skip_headers,
            max_body_bytes: defaults.max_body_bytes,
            max_response_bytes: defaults.max_response_bytes,
        }
    }
}

/// Per-request idempotency decision engine.
///
/// Holds no per-key state of its own; exclusion and memoization live entirely in the
/// injected cache and lock, so any number of guards may share them.
#[derive(Clone)]
pub struct IdempotencyGuard {
    config: Arc<IdempotencyConfig>,
    cache: Arc<dyn ResponseCache>,
    lock: Arc<dyn DistributedLock>,
    identity: Arc<dyn IdentityResolver>,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyGuard {
    pub fn new(
        config: IdempotencyConfig,
        cache: Arc<dyn ResponseCache>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            lock,
            identity: Arc::new(ExtensionIdentityResolver),
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn should_process(&self, method: &str) -> bool {
        self.config.should_process(method)
    }

    /// Runs a request through the guard, calling `next` at most once.
    pub async fn handle<F, Fut>(&self, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let method = request.method().as_str().to_string();

        if !self.should_process(&method) {
            return self.bypass("method", request, next).await;
        }

        let raw_key = match request.headers().get(&self.config.header) {
            None => return self.bypass("missing_key", request, next).await,
            Some(value) => value.as_bytes().to_vec(),
        };

        if let Err(rejection) = validate_key(&raw_key, self.config.min_key_length) {
            return self.reject(&method, rejection);
        }

        IdempotencyMetrics::bump(&self.metrics.guarded_requests);

        // Only used for log output.
        let key = String::from_utf8_lossy(&raw_key).into_owned();

        let (parts, body) = request.into_parts();
        let identity = self.identity.current_identity(&parts);
        let cache_key = cache_key(&raw_key, identity.as_deref());

        let body = match axum::body::to_bytes(body, self.config.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(key = %mask_key(&key), "Failed to buffer idempotent request body: {}", e);
                return self.reject(
                    &method,
                    GuardRejection::BodyTooLarge {
                        limit: self.config.max_body_bytes,
                    },
                );
            }
        };
        let fingerprint = fingerprint(&body);
        let request = Request::from_parts(parts, Body::from(body));

        match self.cache.get(&cache_key).await {
            Ok(Some(record)) => return self.replay(&method, &key, &record, &fingerprint),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(key = %mask_key(&key), "Idempotency cache lookup failed: {}", e);
                return self.reject(&method, GuardRejection::StoreUnavailable);
            }
        }

        let timer = LatencyTimer::new();
        let acquired = LockGuard::acquire(
            Arc::clone(&self.lock),
            &lock_name(&cache_key),
            self.config.lock_lease,
            self.config.lock_wait,
            self.config.lock_retry_interval,
        )
        .await;

        let lock = match acquired {
            Ok(Some(lock)) => {
                get_metrics().record_lock_wait(timer.elapsed_ms(), true);
                lock
            }
            Ok(None) => {
                get_metrics().record_lock_wait(timer.elapsed_ms(), false);
                IdempotencyMetrics::bump(&self.metrics.lock_conflicts);
                tracing::info!(key = %mask_key(&key), "Idempotency key is locked by a concurrent request");
                return self.reject(&method, GuardRejection::LockContention);
            }
            Err(e) => {
                tracing::error!(key = %mask_key(&key), "Failed to acquire idempotency lock: {}", e);
                return self.reject(&method, GuardRejection::StoreUnavailable);
            }
        };

        // A concurrent holder may have finished between the first read and the lock.
        match self.cache.get(&cache_key).await {
            Ok(Some(record)) => {
                lock.release().await;
                return self.replay(&method, &key, &record, &fingerprint);
            }
            Ok(None) => {}
            Err(e) => {
                lock.release().await;
                tracing::error!(key = %mask_key(&key), "Idempotency cache re-check failed: {}", e);
                return self.reject(&method, GuardRejection::StoreUnavailable);
            }
        }

        let response = self.execute(&method, &key, &cache_key, fingerprint, request, next).await;
        lock.release().await;
        response
    }

    async fn execute<F, Fut>(
        &self,
        method: &str,
        key: &str,
        cache_key: &str,
        fingerprint: String,
        request: Request,
        next: F,
    ) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let timer = LatencyTimer::new();
        let response = next(request).await;
        get_metrics().record_handler_latency(timer.elapsed_ms());

        if response.status().is_server_error() {
            IdempotencyMetrics::bump(&self.metrics.failed_executions);
            get_metrics().record_decision(method, "failed");
            tracing::warn!(
                key = %mask_key(key),
                status = response.status().as_u16(),
                "Handler failed, response not stored"
            );
            return response;
        }

        let (mut parts, body) = response.into_parts();

        let within_limit = body
            .size_hint()
            .upper()
            .is_some_and(|upper| upper <= self.config.max_response_bytes as u64);
        if !within_limit {
            IdempotencyMetrics::bump(&self.metrics.unstored_responses);
            get_metrics().record_decision(method, "unstored");
            tracing::warn!(
                key = %mask_key(key),
                limit = self.config.max_response_bytes,
                "Handler response is unbounded or too large to store, passing it through"
            );
            parts
                .headers
                .insert(REPLAYED_HEADER, HeaderValue::from_static("false"));
            return Response::from_parts(parts, body);
        }

        let body: Bytes = match axum::body::to_bytes(body, self.config.max_response_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                IdempotencyMetrics::bump(&self.metrics.failed_executions);
                get_metrics().record_decision(method, "failed");
                tracing::error!(key = %mask_key(key), "Failed to read handler response body: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let record = StoredRecord::capture(
            parts.status,
            &parts.headers,
            &body,
            fingerprint,
            &self.config.skip_headers,
        );

        if let Err(e) = self.cache.put(cache_key, &record, self.config.ttl).await {
            tracing::error!(key = %mask_key(key), "Failed to store idempotent response: {}", e);
        } else {
            tracing::debug!(
                key = %mask_key(key),
                status = record.status,
                ttl_secs = self.config.ttl.as_secs(),
                "Stored idempotent response"
            );
        }

        IdempotencyMetrics::bump(&self.metrics.executed_requests);
        get_metrics().record_decision(method, "executed");

        parts
            .headers
            .insert(REPLAYED_HEADER, HeaderValue::from_static("false"));
        Response::from_parts(parts, Body::from(body))
    }

    fn replay(&self, method: &str, key: &str, record: &StoredRecord, fingerprint: &str) -> Response {
        if self.config.enforce_body_match && record.fingerprint != fingerprint {
            IdempotencyMetrics::bump(&self.metrics.fingerprint_mismatches);
            tracing::info!(key = %mask_key(key), "Idempotency key reused with a different body");
            return self.reject(method, GuardRejection::FingerprintMismatch);
        }

        match record.to_response() {
            Ok(mut response) => {
                IdempotencyMetrics::bump(&self.metrics.replayed_requests);
                get_metrics().record_decision(method, "replayed");
                tracing::debug!(key = %mask_key(key), status = record.status, "Replaying stored response");
                response
                    .headers_mut()
                    .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
                response
            }
            Err(e) => {
                tracing::error!(key = %mask_key(key), "Stored idempotent response is unusable: {}", e);
                self.reject(method, GuardRejection::StoreUnavailable)
            }
        }
    }

    async fn bypass<F, Fut>(&self, reason: &str, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        IdempotencyMetrics::bump(&self.metrics.bypassed_requests);
        get_metrics().record_bypass(reason);
        next(request).await
    }

    fn reject(&self, method: &str, rejection: GuardRejection) -> Response {
        IdempotencyMetrics::bump(&self.metrics.rejected_requests);
        get_metrics().record_decision(method, rejection.kind());
        rejection.into_response()
    }
}
