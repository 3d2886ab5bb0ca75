use serde::Deserialize;

/// Top-level settings, layered from `config/default`, `config/local` and `APP__*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Which backing store holds stored responses and locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Redis,
}

/// Recognised options for the idempotency guard.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Request header carrying the client key.
    pub header: String,
    /// Lifetime of a stored response, in minutes.
    pub ttl_minutes: u64,
    pub store: StoreKind,
    /// Methods the guard enforces; matched case-insensitively.
    pub methods: Vec<String>,
    /// Minimum key length in bytes. 0 disables the check.
    pub min_key_length: usize,
    pub enforce_body_match: bool,
    pub lock_lease_secs: u64,
    /// How long a contending request keeps retrying the lock before a 409. 0 means one attempt.
    pub lock_wait_ms: u64,
    pub lock_retry_interval_ms: u64,
    /// Response headers never persisted for replay.
    pub skip_headers: Vec<String>,
    pub max_body_bytes: usize,
    /// Largest handler response that is stored. Bigger or unsized bodies are passed through unstored.
    pub max_response_bytes: usize,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header: "Idempotency-Key".to_string(),
            ttl_minutes: 1440,
            store: StoreKind::Memory,
            methods: vec!["POST".to_string(), "PATCH".to_string()],
            min_key_length: 8,
            enforce_body_match: true,
            lock_lease_secs: 30,
            lock_wait_ms: 0,
            lock_retry_interval_ms: 50,
            skip_headers: vec![
                "set-cookie".to_string(),
                "date".to_string(),
                "transfer-encoding".to_string(),
            ],
            max_body_bytes: 2 * 1024 * 1024,
            max_response_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("idempotency.methods")
                    .with_list_parse_key("idempotency.skip_headers")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_defaults() {
        let settings = IdempotencySettings::default();
        assert_eq!(settings.header, "Idempotency-Key");
        assert_eq!(settings.ttl_minutes, 1440);
        assert_eq!(settings.store, StoreKind::Memory);
        assert_eq!(settings.methods, vec!["POST", "PATCH"]);
        assert_eq!(settings.min_key_length, 8);
        assert!(settings.enforce_body_match);
        assert_eq!(settings.lock_lease_secs, 30);
        assert_eq!(settings.lock_wait_ms, 0);
    }

    #[test]
    fn test_partial_section_falls_back_to_defaults() {
        let settings: Settings = config::Config::builder()
            .set_override("idempotency.header", "X-Request-Key")
            .unwrap()
            .set_override("idempotency.store", "redis")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.idempotency.header, "X-Request-Key");
        assert_eq!(settings.idempotency.store, StoreKind::Redis);
        assert_eq!(settings.idempotency.ttl_minutes, 1440);
        assert_eq!(settings.application.port, 8080);
    }
}
