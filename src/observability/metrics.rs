use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Prometheus-facing metrics for the idempotency guard.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// Records how a guarded request was resolved (executed, replayed, rejected, ...).
    pub fn record_decision(&self, method: &str, outcome: &str) {
        counter!("idempotency_decisions_total", "method" => method.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_bypass(&self, reason: &str) {
        counter!("idempotency_bypassed_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn record_lock_wait(&self, duration_ms: f64, acquired: bool) {
        histogram!("idempotency_lock_wait_duration_ms", "acquired" => acquired.to_string()).record(duration_ms);
        if !acquired {
            counter!("idempotency_lock_contention_total").increment(1);
        }
    }

    pub fn record_handler_latency(&self, duration_ms: f64) {
        histogram!("idempotency_handler_duration_ms").record(duration_ms);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_decisions_total", Unit::Count, "Guarded requests by outcome");
    describe_counter!("idempotency_bypassed_total", Unit::Count, "Requests that skipped the guard");
    describe_counter!("idempotency_lock_contention_total", Unit::Count, "Requests refused because the key was locked");
    describe_histogram!("idempotency_lock_wait_duration_ms", Unit::Milliseconds, "Time spent acquiring the idempotency lock");
    describe_histogram!("idempotency_handler_duration_ms", Unit::Milliseconds, "Downstream handler latency for first executions");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Cache and lock store operations");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "Cache and lock store latency");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = get_metrics();
        assert!(metrics.initialized);
        metrics.record_decision("POST", "executed");
        metrics.record_lock_wait(1.5, false);
    }
}
