//! Environment-driven configuration for the outbox worker.

use crate::{ConfigError, ConfigResult};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default queue that receives events handed off to out-of-process workers.
pub const DEFAULT_QUEUE_NAME: &str = "outbox-events";

const POLL_INTERVAL_RANGE: RangeInclusive<u64> = 10..=60_000;
const BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=1_000;
const LOCK_TIMEOUT_RANGE: RangeInclusive<u64> = 1_000..=600_000;
const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=20;
const EVENT_CONCURRENCY_RANGE: RangeInclusive<usize> = 1..=256;
const HANDLER_TIMEOUT_RANGE: RangeInclusive<u64> = 100..=300_000;
const MAX_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

/// Poller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerSettings {
    /// Interval between fetch cycles.
    pub poll_interval: Duration,
    /// Maximum events fetched per cycle.
    pub batch_size: usize,
    /// How long a leasing store keeps a claimed event hidden from other pollers.
    pub lock_timeout: Duration,
    /// Attempts before an event is dead-lettered.
    pub max_retries: u32,
    /// Delay before each retry, indexed by zero-based attempt.
    pub retry_backoff: Vec<Duration>,
    /// Events of one batch processed at the same time.
    pub event_concurrency: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            lock_timeout: Duration::from_millis(30_000),
            max_retries: 3,
            retry_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            event_concurrency: 1,
        }
    }
}

/// Handler execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerSettings {
    /// Run matched handlers concurrently (true) or one after another (false).
    pub parallel: bool,
    /// Upper bound for a single handler invocation.
    pub timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            parallel: true,
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Durable job queue settings. Present only when `REDIS_URL` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSettings {
    /// Redis connection URL.
    pub redis_url: String,
    /// Queue receiving forwarded outbox events.
    pub queue_name: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventsConfig {
    /// Use the SQLite store instead of the in-memory one.
    pub use_database: bool,
    /// SQLite database file.
    pub database_path: PathBuf,
    pub poller: PollerSettings,
    pub handlers: HandlerSettings,
    pub queue: Option<QueueSettings>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            use_database: false,
            database_path: default_database_path(),
            poller: PollerSettings::default(),
            handlers: HandlerSettings::default(),
            queue: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("outbox")
        .join("outbox.db")
}

impl EventsConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset variables fall back to their defaults. Set variables must parse
    /// and fall inside their documented range; a variable set to an empty or
    /// whitespace-only value is rejected rather than silently defaulted.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> ConfigResult<Option<String>> {
            match lookup(key) {
                Some(raw) if raw.trim().is_empty() => {
                    Err(ConfigError::invalid(key, &raw, "value is empty"))
                }
                Some(raw) => Ok(Some(raw.trim().to_string())),
                None => Ok(None),
            }
        };
        let defaults = Self::default();

        let use_database = match get("EVENTS_WORKER_USE_DATABASE")? {
            Some(raw) => parse_bool("EVENTS_WORKER_USE_DATABASE", &raw)?,
            None => defaults.use_database,
        };

        let database_path = get("OUTBOX_DATABASE_PATH")?
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let poller = PollerSettings {
            poll_interval: match get("OUTBOX_POLL_INTERVAL_MS")? {
                Some(raw) => Duration::from_millis(parse_in_range(
                    "OUTBOX_POLL_INTERVAL_MS",
                    &raw,
                    POLL_INTERVAL_RANGE,
                )?),
                None => defaults.poller.poll_interval,
            },
            batch_size: match get("OUTBOX_BATCH_SIZE")? {
                Some(raw) => parse_in_range("OUTBOX_BATCH_SIZE", &raw, BATCH_SIZE_RANGE)?,
                None => defaults.poller.batch_size,
            },
            lock_timeout: match get("OUTBOX_LOCK_TIMEOUT_MS")? {
                Some(raw) => Duration::from_millis(parse_in_range(
                    "OUTBOX_LOCK_TIMEOUT_MS",
                    &raw,
                    LOCK_TIMEOUT_RANGE,
                )?),
                None => defaults.poller.lock_timeout,
            },
            max_retries: match get("OUTBOX_MAX_RETRIES")? {
                Some(raw) => parse_in_range("OUTBOX_MAX_RETRIES", &raw, MAX_RETRIES_RANGE)?,
                None => defaults.poller.max_retries,
            },
            retry_backoff: match get("OUTBOX_RETRY_BACKOFF_MS")? {
                Some(raw) => parse_backoff("OUTBOX_RETRY_BACKOFF_MS", &raw)?,
                None => defaults.poller.retry_backoff,
            },
            event_concurrency: match get("OUTBOX_EVENT_CONCURRENCY")? {
                Some(raw) => {
                    parse_in_range("OUTBOX_EVENT_CONCURRENCY", &raw, EVENT_CONCURRENCY_RANGE)?
                }
                None => defaults.poller.event_concurrency,
            },
        };

        let handlers = HandlerSettings {
            parallel: match get("EVENTS_HANDLER_PARALLEL")? {
                Some(raw) => parse_bool("EVENTS_HANDLER_PARALLEL", &raw)?,
                None => defaults.handlers.parallel,
            },
            timeout: match get("EVENTS_HANDLER_TIMEOUT_MS")? {
                Some(raw) => Duration::from_millis(parse_in_range(
                    "EVENTS_HANDLER_TIMEOUT_MS",
                    &raw,
                    HANDLER_TIMEOUT_RANGE,
                )?),
                None => defaults.handlers.timeout,
            },
        };

        let queue = match get("REDIS_URL")? {
            Some(redis_url) => {
                if !(redis_url.starts_with("redis://") || redis_url.starts_with("rediss://")) {
                    return Err(ConfigError::invalid(
                        "REDIS_URL",
                        &redis_url,
                        "expected a redis:// or rediss:// URL",
                    ));
                }
                Some(QueueSettings {
                    redis_url,
                    queue_name: get("OUTBOX_QUEUE_NAME")?
                        .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
                })
            }
            None => None,
        };

        let log_level = match get("OUTBOX_LOG_LEVEL")? {
            Some(raw) => parse_log_level("OUTBOX_LOG_LEVEL", &raw)?,
            None => defaults.log_level,
        };

        let log_format = match get("OUTBOX_LOG_FORMAT")? {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "compact" => LogFormat::Compact,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::invalid(
                        "OUTBOX_LOG_FORMAT",
                        &raw,
                        "expected compact or json",
                    ))
                }
            },
            None => defaults.log_format,
        };

        Ok(Self {
            use_database,
            database_path,
            poller,
            handlers,
            queue,
            log_level,
            log_format,
        })
    }
}

fn parse_bool(key: &str, raw: &str) -> ConfigResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}

fn parse_in_range<T>(key: &str, raw: &str, range: RangeInclusive<T>) -> ConfigResult<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let value: T = raw
        .parse()
        .map_err(|_| ConfigError::invalid(key, raw, "expected an unsigned integer"))?;
    if !range.contains(&value) {
        return Err(ConfigError::invalid(
            key,
            raw,
            format!("must be between {} and {}", range.start(), range.end()),
        ));
    }
    Ok(value)
}

fn parse_backoff(key: &str, raw: &str) -> ConfigResult<Vec<Duration>> {
    let mut delays = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(ConfigError::invalid(key, raw, "empty entry in delay list"));
        }
        let ms = parse_in_range(key, part, 0..=MAX_BACKOFF_MS)?;
        delays.push(Duration::from_millis(ms));
    }
    Ok(delays)
}

fn parse_log_level(key: &str, raw: &str) -> ConfigResult<String> {
    let level = raw.to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(level),
        "warning" => Ok("warn".to_string()),
        _ => Err(ConfigError::invalid(
            key,
            raw,
            "expected trace, debug, info, warn or error",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ConfigResult<EventsConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EventsConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = load(&[]).unwrap();
        assert!(!config.use_database);
        assert_eq!(config.poller.poll_interval, Duration::from_millis(100));
        assert_eq!(config.poller.batch_size, 100);
        assert_eq!(config.poller.lock_timeout, Duration::from_millis(30_000));
        assert_eq!(config.poller.max_retries, 3);
        assert_eq!(
            config.poller.retry_backoff,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30)
            ]
        );
        assert_eq!(config.poller.event_concurrency, 1);
        assert!(config.handlers.parallel);
        assert_eq!(config.handlers.timeout, Duration::from_millis(30_000));
        assert!(config.queue.is_none());
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(config.database_path.ends_with("outbox/outbox.db"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("events.db");
        let config = load(&[
            ("EVENTS_WORKER_USE_DATABASE", "yes"),
            ("OUTBOX_DATABASE_PATH", db_path.to_str().unwrap()),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_BATCH_SIZE", "20"),
            ("OUTBOX_LOCK_TIMEOUT_MS", "5000"),
            ("OUTBOX_MAX_RETRIES", "5"),
            ("OUTBOX_RETRY_BACKOFF_MS", "10, 20,40"),
            ("OUTBOX_EVENT_CONCURRENCY", "4"),
            ("EVENTS_HANDLER_PARALLEL", "false"),
            ("EVENTS_HANDLER_TIMEOUT_MS", "1500"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("OUTBOX_LOG_LEVEL", "DEBUG"),
            ("OUTBOX_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert!(config.use_database);
        assert_eq!(config.database_path, db_path);
        assert_eq!(config.poller.poll_interval, Duration::from_millis(250));
        assert_eq!(config.poller.batch_size, 20);
        assert_eq!(config.poller.lock_timeout, Duration::from_millis(5000));
        assert_eq!(config.poller.max_retries, 5);
        assert_eq!(
            config.poller.retry_backoff,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
        assert_eq!(config.poller.event_concurrency, 4);
        assert!(!config.handlers.parallel);
        assert_eq!(config.handlers.timeout, Duration::from_millis(1500));
        let queue = config.queue.unwrap();
        assert_eq!(queue.redis_url, "redis://localhost:6379");
        assert_eq!(queue.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_blank_values_are_rejected() {
        for (key, value) in [("OUTBOX_BATCH_SIZE", "  "), ("REDIS_URL", ""), ("OUTBOX_LOG_LEVEL", "\t")] {
            match load(&[(key, value)]).unwrap_err() {
                ConfigError::Invalid { key: k, value: v, reason } => {
                    assert_eq!(k, key);
                    assert_eq!(v, value);
                    assert_eq!(reason, "value is empty");
                }
                other => panic!("unexpected error for {}: {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_surrounding_whitespace_is_trimmed() {
        let config = load(&[("OUTBOX_BATCH_SIZE", " 50 ")]).unwrap();
        assert_eq!(config.poller.batch_size, 50);
    }

    #[test]
    fn test_out_of_range_values_fail_instead_of_clamping() {
        let cases = [
            ("OUTBOX_POLL_INTERVAL_MS", "5"),
            ("OUTBOX_BATCH_SIZE", "0"),
            ("OUTBOX_BATCH_SIZE", "1001"),
            ("OUTBOX_LOCK_TIMEOUT_MS", "999"),
            ("OUTBOX_MAX_RETRIES", "0"),
            ("OUTBOX_MAX_RETRIES", "21"),
            ("OUTBOX_EVENT_CONCURRENCY", "0"),
            ("EVENTS_HANDLER_TIMEOUT_MS", "300001"),
        ];

        for (key, value) in cases {
            let err = load(&[(key, value)]).unwrap_err();
            match err {
                ConfigError::Invalid { key: k, value: v, .. } => {
                    assert_eq!(k, key);
                    assert_eq!(v, value);
                }
                other => panic!("unexpected error for {}: {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_unparseable_values_fail() {
        assert!(load(&[("OUTBOX_BATCH_SIZE", "ten")]).is_err());
        assert!(load(&[("OUTBOX_POLL_INTERVAL_MS", "-100")]).is_err());
        assert!(load(&[("EVENTS_WORKER_USE_DATABASE", "maybe")]).is_err());
        assert!(load(&[("EVENTS_HANDLER_PARALLEL", "2")]).is_err());
        assert!(load(&[("OUTBOX_RETRY_BACKOFF_MS", "100,,200")]).is_err());
        assert!(load(&[("OUTBOX_RETRY_BACKOFF_MS", "100,abc")]).is_err());
        assert!(load(&[("REDIS_URL", "http://localhost")]).is_err());
        assert!(load(&[("OUTBOX_LOG_LEVEL", "verbose")]).is_err());
        assert!(load(&[("OUTBOX_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_bool_spellings() {
        for raw in ["true", "TRUE", "1", "yes", "on"] {
            assert!(parse_bool("K", raw).unwrap(), "{}", raw);
        }
        for raw in ["false", "False", "0", "no", "off"] {
            assert!(!parse_bool("K", raw).unwrap(), "{}", raw);
        }
    }

    #[test]
    fn test_custom_queue_name() {
        let config = load(&[
            ("REDIS_URL", "rediss://cache.internal:6380"),
            ("OUTBOX_QUEUE_NAME", "crm-events"),
        ])
        .unwrap();
        assert_eq!(config.queue.unwrap().queue_name, "crm-events");
    }
}
