//! Configuration types for the worker.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queues::QueueNames;

/// Which broker substrate to talk to, and how to reach it.
#[derive(Clone, PartialEq, Eq)]
pub enum BrokerConfig {
    /// Native blocking protocol (Substrate A).
    Native {
        host: String,
        port: u16,
        password: Option<String>,
    },
    /// Stateless REST endpoint with bearer-token auth (Substrate B).
    Rest { url: String, token: String },
}

impl BrokerConfig {
    /// Native substrate on `host:port` without a password.
    pub fn native(host: impl Into<String>, port: u16) -> Self {
        Self::Native {
            host: host.into(),
            port,
            password: None,
        }
    }

    /// REST substrate.
    pub fn rest(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::Rest {
            url: url.into(),
            token: token.into(),
        }
    }

    /// Short substrate label for logs.
    pub fn substrate(&self) -> &'static str {
        match self {
            Self::Native { .. } => "native",
            Self::Rest { .. } => "rest",
        }
    }

    /// Endpoint without credentials.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Native { host, port, .. } => format!("{}:{}", host, port),
            Self::Rest { url, .. } => url.clone(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::native("localhost", 6379)
    }
}

// Keeps passwords and tokens out of logs.
impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native { host, port, password } => f
                .debug_struct("Native")
                .field("host", host)
                .field("port", port)
                .field("password", &password.as_ref().map(|_| "***"))
                .finish(),
            Self::Rest { url, .. } => f
                .debug_struct("Rest")
                .field("url", url)
                .field("token", &"***")
                .finish(),
        }
    }
}

/// Shortest accepted blocking-pop timeout. A zero timeout would turn the
/// worker loop into a busy poll.
pub const MIN_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest accepted blocking-pop timeout.
pub const MAX_POP_TIMEOUT: Duration = Duration::from_secs(86400);

/// Configuration for the worker loop and the broker it talks to.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker substrate selection.
    pub broker: BrokerConfig,
    /// Queue and channel names.
    pub queues: QueueNames,
    /// Timeout for each blocking pop on the main queue.
    pub pop_timeout: Duration,
    /// Poll interval of the emulated blocking pop (REST substrate only).
    pub poll_interval: Duration,
    /// Sleep after a loop-level failure before the next cycle.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queues: QueueNames::default(),
            pop_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rest_url = non_empty(&lookup, "UPSTASH_REDIS_REST_URL");
        let rest_token = non_empty(&lookup, "UPSTASH_REDIS_REST_TOKEN");
        let broker = match (rest_url, rest_token) {
            (Some(url), Some(token)) => BrokerConfig::Rest { url, token },
            _ => BrokerConfig::Native {
                host: non_empty(&lookup, "REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_var(&lookup, "REDIS_PORT", 6379u16)?,
                password: non_empty(&lookup, "REDIS_PASSWORD"),
            },
        };

        let mut queues = QueueNames::default();
        if let Some(name) = non_empty(&lookup, "QUEUE_MAIN") {
            queues = queues.with_main(name);
        }
        if let Some(name) = non_empty(&lookup, "QUEUE_PROCESSED") {
            queues = queues.with_processed(name);
        }
        if let Some(name) = non_empty(&lookup, "QUEUE_FAILED") {
            queues = queues.with_failed(name);
        }
        if let Some(name) = non_empty(&lookup, "EVENTS_CHANNEL") {
            queues = queues.with_events(name);
        }

        Ok(Self {
            broker,
            queues,
            pop_timeout: pop_timeout(&lookup, defaults.pop_timeout)?,
            poll_interval: Duration::from_millis(parse_var(
                &lookup,
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            error_backoff: Duration::from_secs(parse_var(
                &lookup,
                "ERROR_BACKOFF_SECS",
                defaults.error_backoff.as_secs(),
            )?),
        })
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker substrate.
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.config.broker = broker;
        self
    }

    /// Set the queue names.
    pub fn queues(mut self, queues: QueueNames) -> Self {
        self.config.queues = queues;
        self
    }

    /// Set the blocking-pop timeout, clamped to
    /// [`MIN_POP_TIMEOUT`]..=[`MAX_POP_TIMEOUT`].
    pub fn pop_timeout(mut self, timeout: Duration) -> Self {
        self.config.pop_timeout = timeout.clamp(MIN_POP_TIMEOUT, MAX_POP_TIMEOUT);
        self
    }

    /// Set the emulated-pop poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the loop-level error backoff.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Where the relational store lives.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve the database URL.
    ///
    /// Priority: `BATCH_DATABASE_URL`, then a URL assembled from the
    /// `BATCH_DB_*` / `DB_*` parts, then the shared `DATABASE_URL`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_connections = parse_var(&lookup, "DB_MAX_CONNECTIONS", 5u32)?;

        if let Some(url) = non_empty(&lookup, "BATCH_DATABASE_URL") {
            return Ok(Self { url, max_connections });
        }

        let user = non_empty(&lookup, "BATCH_DB_USER");
        let password = non_empty(&lookup, "BATCH_DB_PASSWORD");
        let host = non_empty(&lookup, "DB_HOST");
        if let (Some(user), Some(password), Some(host)) = (user, password, host) {
            let port = non_empty(&lookup, "DB_PORT").unwrap_or_else(|| "5432".to_string());
            let name = non_empty(&lookup, "DB_NAME").unwrap_or_else(|| "postgres".to_string());
            return Ok(Self {
                url: format!("postgresql://{}:{}@{}:{}/{}", user, password, host, port, name),
                max_connections,
            });
        }

        if let Some(url) = non_empty(&lookup, "DATABASE_URL") {
            tracing::warn!(
                "Falling back to DATABASE_URL; set BATCH_DATABASE_URL for a dedicated batch role"
            );
            return Ok(Self { url, max_connections });
        }

        Err(ConfigError::Missing(
            "BATCH_DATABASE_URL, BATCH_DB_USER/BATCH_DB_PASSWORD/DB_HOST or DATABASE_URL"
                .to_string(),
        ))
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"***")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

fn pop_timeout<F>(lookup: &F, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let timeout = Duration::from_secs(parse_var(lookup, "POP_TIMEOUT_SECS", default.as_secs())?);
    if timeout < MIN_POP_TIMEOUT || timeout > MAX_POP_TIMEOUT {
        return Err(ConfigError::Invalid {
            var: "POP_TIMEOUT_SECS".to_string(),
            reason: format!(
                "must be between {} and {} seconds",
                MIN_POP_TIMEOUT.as_secs(),
                MAX_POP_TIMEOUT.as_secs()
            ),
        });
    }
    Ok(timeout)
}

fn non_empty<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).filter(|value| !value.trim().is_empty())
}

fn parse_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match non_empty(lookup, var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.broker, BrokerConfig::native("localhost", 6379));
        assert_eq!(config.pop_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.queues, QueueNames::default());
    }

    #[test]
    fn test_builder_fluent_chain() {
        let config = WorkerConfig::builder()
            .broker(BrokerConfig::rest("https://broker.example", "tok"))
            .queues(QueueNames::default().with_main("in"))
            .pop_timeout(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(50))
            .error_backoff(Duration::from_secs(1))
            .build();

        assert_eq!(config.broker.substrate(), "rest");
        assert_eq!(config.queues.main(), "in");
        assert_eq!(config.pop_timeout, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_from_lookup_selects_rest_when_both_set() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("UPSTASH_REDIS_REST_URL", "https://eu1.example.io"),
            ("UPSTASH_REDIS_REST_TOKEN", "secret"),
            ("REDIS_HOST", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.broker, BrokerConfig::rest("https://eu1.example.io", "secret"));
    }

    #[test]
    fn test_from_lookup_native_when_token_missing() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("UPSTASH_REDIS_REST_URL", "https://eu1.example.io"),
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert_eq!(
            config.broker,
            BrokerConfig::Native {
                host: "cache".to_string(),
                port: 6380,
                password: Some("pw".to_string()),
            }
        );
    }

    #[test]
    fn test_from_lookup_queue_names_and_timings() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("QUEUE_MAIN", "q:main"),
            ("QUEUE_PROCESSED", "q:ok"),
            ("QUEUE_FAILED", "q:ko"),
            ("EVENTS_CHANNEL", "ch"),
            ("POP_TIMEOUT_SECS", "10"),
            ("POLL_INTERVAL_MS", "250"),
            ("ERROR_BACKOFF_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.queues, QueueNames::new("q:main", "q:ok", "q:ko", "ch"));
        assert_eq!(config.pop_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_from_lookup_invalid_port() {
        let err = WorkerConfig::from_lookup(lookup_from(&[("REDIS_PORT", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "REDIS_PORT"));
    }

    #[test]
    fn test_from_lookup_rejects_out_of_range_pop_timeout() {
        for raw in ["0", "86401", "18446744073709551615"] {
            let err = WorkerConfig::from_lookup(lookup_from(&[("POP_TIMEOUT_SECS", raw)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { ref var, .. } if var == "POP_TIMEOUT_SECS"),
                "{} accepted",
                raw
            );
        }
        let config =
            WorkerConfig::from_lookup(lookup_from(&[("POP_TIMEOUT_SECS", "1")])).unwrap();
        assert_eq!(config.pop_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_clamps_pop_timeout() {
        let config = WorkerConfig::builder().pop_timeout(Duration::ZERO).build();
        assert_eq!(config.pop_timeout, MIN_POP_TIMEOUT);
        let config = WorkerConfig::builder().pop_timeout(Duration::MAX).build();
        assert_eq!(config.pop_timeout, MAX_POP_TIMEOUT);
    }

    #[test]
    fn test_debug_hides_credentials() {
        let debug = format!("{:?}", BrokerConfig::rest("https://x", "super-secret"));
        assert!(!debug.contains("super-secret"));
        let debug = format!("{:?}", DatabaseConfig::new("postgres://u:pw@h/db"));
        assert!(!debug.contains("pw@"));
    }

    #[test]
    fn test_database_url_priority() {
        let config = DatabaseConfig::from_lookup(lookup_from(&[
            ("BATCH_DATABASE_URL", "postgres://batch@h/db"),
            ("DATABASE_URL", "postgres://api@h/db"),
        ]))
        .unwrap();
        assert_eq!(config.url, "postgres://batch@h/db");

        let config = DatabaseConfig::from_lookup(lookup_from(&[
            ("BATCH_DB_USER", "batch"),
            ("BATCH_DB_PASSWORD", "pw"),
            ("DB_HOST", "db.internal"),
            ("DATABASE_URL", "postgres://api@h/db"),
        ]))
        .unwrap();
        assert_eq!(config.url, "postgresql://batch:pw@db.internal:5432/postgres");

        let config =
            DatabaseConfig::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://api@h/db")]))
                .unwrap();
        assert_eq!(config.url, "postgres://api@h/db");
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_database_url_missing() {
        let err = DatabaseConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
