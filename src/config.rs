use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime configuration loaded from the environment (and `.env`, if present).
///
/// | Env Var               | Default |
/// |-----------------------|---------|
/// | `DATABASE_URL`        | none    |
/// | `DB_MAX_CONNECTIONS`  | `5`     |
/// | `GROUP_TIMEOUT_SECS`  | `30`    |
/// | `MAX_PARALLEL_GROUPS` | `4`     |
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub recompute: RecomputeOptions,
}

/// Knobs for a recomputation run.
#[derive(Debug, Clone, Copy)]
pub struct RecomputeOptions {
    /// Upper bound on one group's pipeline before it is recorded as failed.
    pub group_timeout: Duration,
    /// Number of group pipelines allowed in flight at once.
    pub max_parallel_groups: usize,
}

impl Default for RecomputeOptions {
    fn default() -> Self {
        Self {
            group_timeout: Duration::from_secs(30),
            max_parallel_groups: 4,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            Error::Configuration("DATABASE_URL must be set to a Postgres instance".into())
        })?;

        let defaults = RecomputeOptions::default();
        let max_connections: u32 = parse_or(&lookup, "DB_MAX_CONNECTIONS", 5)?;
        let timeout_secs: u64 =
            parse_or(&lookup, "GROUP_TIMEOUT_SECS", defaults.group_timeout.as_secs())?;
        let max_parallel_groups: usize =
            parse_or(&lookup, "MAX_PARALLEL_GROUPS", defaults.max_parallel_groups)?;

        if timeout_secs == 0 {
            return Err(Error::Configuration(
                "GROUP_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }
        if max_parallel_groups == 0 {
            return Err(Error::Configuration(
                "MAX_PARALLEL_GROUPS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            database_url,
            max_connections,
            recompute: RecomputeOptions {
                group_timeout: Duration::from_secs(timeout_secs),
                max_parallel_groups,
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("{key} must be a valid number, got {raw:?}"))),
        None => Ok(default),
    }
}
