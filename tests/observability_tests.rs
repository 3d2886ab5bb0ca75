use idempotency_guard::observability::{
    get_metrics, mask_key, mask_sensitive, LatencyTimer, LogConfig, LogFormat,
};

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, LogFormat::Pretty);
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_log_format_from_str() {
    assert_eq!(LogFormat::from("json"), LogFormat::Json);
    assert_eq!(LogFormat::from("COMPACT"), LogFormat::Compact);
    assert_eq!(LogFormat::from("unknown"), LogFormat::Pretty);
}

#[test]
fn test_mask_sensitive_exact_boundary() {
    assert_eq!(mask_sensitive("1234", 2), "****");
}

#[test]
fn test_mask_key_hides_middle() {
    let masked = mask_key("order-2026-10-15-0001");
    assert!(masked.starts_with("orde"));
    assert!(masked.ends_with("0001"));
    assert!(!masked.contains("2026"));
}

#[test]
fn test_latency_timer_monotonic() {
    let timer = LatencyTimer::new();
    let first = timer.elapsed_ms();
    let second = timer.elapsed_ms();
    assert!(second >= first);
}

#[test]
fn test_metrics_recording_without_recorder() {
    let metrics = get_metrics();
    metrics.record_decision("POST", "replayed");
    metrics.record_bypass("method");
    metrics.record_store_operation("cache_get", 0.4, true);
    metrics.record_lock_wait(12.0, true);
    metrics.record_handler_latency(3.2);
}
