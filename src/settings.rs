//! Typed, validated configuration surface, read once at startup from the
//! environment (§6 of the spec). Mirrors the validate-then-freeze shape
//! `pageserver::config::PageServerConf` builds from its TOML file, adapted
//! to this service's environment-variable configuration model.

use std::fmt;
use std::time::Duration;

use crate::logging::LogFormat;

/// Wrapper that redacts its contents from `Debug`/`Display`, matching
/// `utils::logging::SecretString`'s redaction behavior.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn for_test(value: &str) -> Self {
        SecretString(value.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub dbname: String,
    pub replication_slot: String,
    pub leader_lock_key_override: Option<i64>,
}

impl PostgresSettings {
    /// Connection string for a *non*-replication session (leader lock
    /// session, slot metadata queries).
    pub fn connstring(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} application_name=wal-relay",
            self.host,
            self.port,
            self.user,
            self.password.expose(),
            self.dbname
        )
    }

    /// Connection string for the replication session: same target, with
    /// `replication=database` so `START_REPLICATION` is accepted.
    pub fn replication_connstring(&self) -> String {
        format!("{} replication=database", self.connstring())
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_linger: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_count: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct IntervalSettings {
    pub feedback: Duration,
    pub watchdog: Duration,
    pub leader_acquire: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    pub aws_region: String,
    pub kinesis_stream: String,
    pub batch: BatchSettings,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub intervals: IntervalSettings,
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_listen_addr: String,
}

fn env_var(name: &'static str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("missing required environment variable {name}"))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T>(name: &'static str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var_opt(name) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {name} ('{v}'): {e}")),
    }
}

impl Settings {
    /// Build and validate settings from the process environment. Any
    /// failure here is a fatal, pre-startup configuration error (§7).
    pub fn from_env() -> anyhow::Result<Settings> {
        let postgres = PostgresSettings {
            host: env_var("PGHOST")?,
            port: env_parse("PGPORT", 5432u16)?,
            user: env_var("PGUSER")?,
            password: SecretString(env_var("PGPASSWORD").unwrap_or_default()),
            dbname: env_var("PGDATABASE")?,
            replication_slot: env_var("REPLICATION_SLOT")?,
            leader_lock_key_override: match env_var_opt("LEADER_LOCK_KEY_OVERRIDE") {
                Some(v) => Some(
                    v.parse()
                        .map_err(|e| anyhow::anyhow!("invalid LEADER_LOCK_KEY_OVERRIDE: {e}"))?,
                ),
                None => None,
            },
        };

        let aws_region = env_var_opt("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let kinesis_stream = env_var("KINESIS_STREAM")?;

        let batch = BatchSettings {
            max_records: env_parse("BATCH_MAX_RECORDS", 500usize)?,
            max_bytes: env_parse("BATCH_MAX_BYTES", 1_000_000usize)?,
            max_linger: Duration::from_millis(env_parse("BATCH_MAX_LINGER_MS", 250u64)?),
        };

        let queue = QueueSettings {
            max_count: env_parse("QUEUE_MAX_COUNT", 10_000usize)?,
            max_bytes: env_parse("QUEUE_MAX_BYTES", 64 * 1024 * 1024usize)?,
        };

        let retry = RetrySettings {
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5u32)?,
            base: Duration::from_millis(env_parse("RETRY_BASE_MS", 100u64)?),
            cap: Duration::from_millis(env_parse("RETRY_CAP_MS", 10_000u64)?),
            multiplier: env_parse("RETRY_MULTIPLIER", 2.0f64)?,
        };

        let intervals = IntervalSettings {
            feedback: Duration::from_millis(env_parse("FEEDBACK_INTERVAL_MS", 1_000u64)?),
            watchdog: Duration::from_millis(env_parse("WATCHDOG_INTERVAL_MS", 5_000u64)?),
            leader_acquire: Duration::from_millis(env_parse(
                "LEADER_ACQUIRE_INTERVAL_MS",
                2_000u64,
            )?),
        };

        let log_level = env_var_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format_str = env_var_opt("LOG_FORMAT").unwrap_or_else(|| "plain".to_string());
        let log_format: LogFormat = log_format_str.parse()?;

        let metrics_listen_addr =
            env_var_opt("METRICS_LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:9399".to_string());

        let settings = Settings {
            postgres,
            aws_region,
            kinesis_stream,
            batch,
            queue,
            retry,
            intervals,
            log_level,
            log_format,
            metrics_listen_addr,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.postgres.host.is_empty() {
            return Err(crate::errors::ConfigError::Missing("PGHOST").into());
        }
        if self.postgres.replication_slot.is_empty() {
            return Err(crate::errors::ConfigError::Missing("REPLICATION_SLOT").into());
        }
        if self.kinesis_stream.is_empty() {
            return Err(crate::errors::ConfigError::Missing("KINESIS_STREAM").into());
        }
        anyhow::ensure!(
            self.batch.max_records > 0,
            "BATCH_MAX_RECORDS must be positive"
        );
        anyhow::ensure!(self.batch.max_bytes > 0, "BATCH_MAX_BYTES must be positive");
        anyhow::ensure!(self.queue.max_count > 0, "QUEUE_MAX_COUNT must be positive");
        anyhow::ensure!(self.queue.max_bytes > 0, "QUEUE_MAX_BYTES must be positive");
        anyhow::ensure!(
            self.queue.max_count >= self.batch.max_records,
            "QUEUE_MAX_COUNT must be at least BATCH_MAX_RECORDS"
        );
        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "RETRY_MAX_ATTEMPTS must be positive"
        );
        anyhow::ensure!(
            self.retry.multiplier >= 1.0,
            "RETRY_MULTIPLIER must be >= 1.0"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_string_redacted_in_debug() {
        let s = SecretString("hunter2".to_string());
        assert_eq!(format!("{s:?}"), "<redacted>");
        assert_eq!(s.expose(), "hunter2");
    }

    #[test]
    fn validate_rejects_queue_smaller_than_batch() {
        let postgres = PostgresSettings {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: SecretString(String::new()),
            dbname: "postgres".into(),
            replication_slot: "relay_slot".into(),
            leader_lock_key_override: None,
        };
        let settings = Settings {
            postgres,
            aws_region: "us-east-1".into(),
            kinesis_stream: "events".into(),
            batch: BatchSettings {
                max_records: 1000,
                max_bytes: 100,
                max_linger: Duration::from_millis(10),
            },
            queue: QueueSettings {
                max_count: 10,
                max_bytes: 1000,
            },
            retry: RetrySettings {
                max_attempts: 3,
                base: Duration::from_millis(10),
                cap: Duration::from_millis(100),
                multiplier: 2.0,
            },
            intervals: IntervalSettings {
                feedback: Duration::from_millis(10),
                watchdog: Duration::from_millis(10),
                leader_acquire: Duration::from_millis(10),
            },
            log_level: "info".into(),
            log_format: LogFormat::Plain,
            metrics_listen_addr: "127.0.0.1:9399".into(),
        };
        assert!(settings.validate().is_err());
    }
}
