//! Configuration loading and representation.
//!
//! Every setting has a default and can be overridden from the environment.
//! Empty variables count as unset.

use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

use crate::jobs::DEFAULT_LEASE;

/// Configuration error (reported once at startup).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Connection parameters of one Postgres database.
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl core::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl DbConfig {
    /// Defaults of the job queue database.
    pub fn queue_defaults() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5433,
            user: "vainraw".to_string(),
            password: "vainraw".to_string(),
            database: "vainsocial-raw".to_string(),
        }
    }

    /// Defaults of the destination analytics database.
    pub fn dest_defaults() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "vainweb".to_string(),
            password: "vainweb".to_string(),
            database: "vainsocial-web".to_string(),
        }
    }

    /// Apply `{prefix}_HOST`, `_PORT`, `_USER`, `_PASSWORD` and `_DB` overrides.
    pub fn with_overrides<F>(self, prefix: &str, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup_non_empty(lookup, &format!("{prefix}_{suffix}"));

        let port = match var("PORT") {
            Some(raw) => parse_value(&format!("{prefix}_PORT"), &raw)?,
            None => self.port,
        };

        Ok(Self {
            host: var("HOST").unwrap_or(self.host),
            port,
            user: var("USER").unwrap_or(self.user),
            password: var("PASSWORD").unwrap_or(self.password),
            database: var("DB").unwrap_or(self.database),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

/// Settings of the worker loop itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Job type the worker registers for.
    pub job_type: String,
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Attempts before a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// How long a claimed job may stay running before it is reclaimed.
    pub lease: Duration,
    /// Apply the bundled `CREATE TABLE IF NOT EXISTS` schema at startup.
    pub ensure_schema: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_type: "crunch".to_string(),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            lease: DEFAULT_LEASE,
            ensure_schema: false,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrunchConfig {
    pub queue_db: DbConfig,
    pub dest_db: DbConfig,
    pub worker: WorkerConfig,
}

impl CrunchConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_db = DbConfig::queue_defaults().with_overrides("POSTGRESQL_SOURCE", lookup)?;
        let dest_db = DbConfig::dest_defaults().with_overrides("POSTGRESQL_DEST", lookup)?;

        let defaults = WorkerConfig::default();
        let poll_interval = match lookup_non_empty(lookup, "CRUNCH_POLL_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(parse_value("CRUNCH_POLL_INTERVAL_MS", &raw)?),
            None => defaults.poll_interval,
        };
        let max_attempts = match lookup_non_empty(lookup, "CRUNCH_MAX_ATTEMPTS") {
            Some(raw) => parse_value("CRUNCH_MAX_ATTEMPTS", &raw)?,
            None => defaults.max_attempts,
        };
        let lease = match lookup_non_empty(lookup, "CRUNCH_JOB_LEASE_SECS") {
            Some(raw) => Duration::from_secs(parse_value("CRUNCH_JOB_LEASE_SECS", &raw)?),
            None => defaults.lease,
        };
        let ensure_schema = match lookup_non_empty(lookup, "CRUNCH_ENSURE_SCHEMA") {
            Some(raw) => parse_bool("CRUNCH_ENSURE_SCHEMA", &raw)?,
            None => defaults.ensure_schema,
        };

        Ok(Self {
            queue_db,
            dest_db,
            worker: WorkerConfig {
                job_type: lookup_non_empty(lookup, "CRUNCH_JOB_TYPE").unwrap_or(defaults.job_type),
                poll_interval,
                max_attempts,
                lease,
                ensure_schema,
            },
        })
    }
}

fn lookup_non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.is_empty())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = CrunchConfig::from_lookup(&lookup_from(&[])).unwrap();

        assert_eq!(cfg.queue_db, DbConfig::queue_defaults());
        assert_eq!(cfg.dest_db, DbConfig::dest_defaults());
        assert_eq!(cfg.queue_db.port, 5433);
        assert_eq!(cfg.dest_db.port, 5432);
        assert_eq!(cfg.worker, WorkerConfig::default());
    }

    #[test]
    fn stores_are_overridden_independently() {
        let cfg = CrunchConfig::from_lookup(&lookup_from(&[
            ("POSTGRESQL_DEST_HOST", "analytics.internal"),
            ("POSTGRESQL_DEST_PORT", "6543"),
            ("POSTGRESQL_SOURCE_DB", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.dest_db.host, "analytics.internal");
        assert_eq!(cfg.dest_db.port, 6543);
        assert_eq!(cfg.dest_db.user, "vainweb");
        assert_eq!(cfg.queue_db, DbConfig::queue_defaults());
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = CrunchConfig::from_lookup(&lookup_from(&[("POSTGRESQL_SOURCE_PORT", "54x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "POSTGRESQL_SOURCE_PORT"));

        assert!(
            CrunchConfig::from_lookup(&lookup_from(&[("CRUNCH_ENSURE_SCHEMA", "maybe")])).is_err()
        );
    }

    #[test]
    fn worker_overrides() {
        let cfg = CrunchConfig::from_lookup(&lookup_from(&[
            ("CRUNCH_JOB_TYPE", "crunch_hero"),
            ("CRUNCH_POLL_INTERVAL_MS", "50"),
            ("CRUNCH_MAX_ATTEMPTS", "2"),
            ("CRUNCH_JOB_LEASE_SECS", "90"),
            ("CRUNCH_ENSURE_SCHEMA", "true"),
        ]))
        .unwrap();

        assert_eq!(cfg.worker.job_type, "crunch_hero");
        assert_eq!(cfg.worker.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.worker.max_attempts, 2);
        assert_eq!(cfg.worker.lease, Duration::from_secs(90));
        assert!(cfg.worker.ensure_schema);
    }

    #[test]
    fn debug_output_hides_password() {
        let cfg = DbConfig {
            password: "s3cret".to_string(),
            ..DbConfig::dest_defaults()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
