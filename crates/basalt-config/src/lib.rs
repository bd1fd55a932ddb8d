//! Configuration loading for `basalt-coordination`, `basalt-srpc` and
//! `basalt-migration`.
//!
//! Hierarchical loading, highest precedence first:
//! 1. Environment variables (`BASALT_*`)
//! 2. `basalt.local.toml` (gitignored, local overrides)
//! 3. `basalt.toml` (project config)
//! 4. `~/.config/basalt/config.toml` (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The key names below are exactly the ones the distilled specification
//! enumerates (`REDIS_HOST`, `MUTEX_MODE`, `SRPC_AUTH_SECRET`, ...), prefixed
//! with `BASALT_` for the environment-variable form, matching the teacher's
//! own `KMB_`-prefixed convention.

use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Top-level configuration consumed by the three core crates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasaltConfig {
    pub redis: RedisConfig,
    pub mutex: MutexConfig,
    pub srpc: SrpcAuthConfig,
    pub schema: SchemaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `REDIS_HOST`
    pub host: String,
    /// `REDIS_PORT`
    pub port: u16,
    /// `REDIS_PREFIX` — root of every key this crate writes
    /// (`${prefix}:${category}:${key}`).
    pub prefix: String,
    /// `REDIS_SENTINEL_MASTER` — empty when not using Sentinel.
    pub sentinel_master: String,
    /// `REDIS_SENTINEL_NODES` — comma-separated `host:port` pairs.
    pub sentinel_nodes: String,
}

impl RedisConfig {
    /// Splits `sentinel_nodes` on commas, trimming whitespace and dropping
    /// empty entries.
    pub fn sentinel_node_list(&self) -> Vec<String> {
        self.sentinel_nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn uses_sentinel(&self) -> bool {
        !self.sentinel_master.is_empty()
    }

    /// The plain (non-Sentinel) connection URL, `redis://host:port`.
    pub fn connection_url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            prefix: "basalt".to_string(),
            sentinel_master: String::new(),
            sentinel_nodes: String::new(),
        }
    }
}

/// `MUTEX_MODE`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MutexMode {
    /// Process-local in-memory mutex; no Redis traffic.
    Local,
    /// Redis-backed distributed mutex.
    #[default]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    pub mode: MutexMode,
    /// `MUTEX_REDIS_PREFIX` — overrides `redis.prefix` for mutex keys when set.
    pub redis_prefix: String,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            mode: MutexMode::default(),
            redis_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrpcAuthConfig {
    /// `SRPC_AUTH_SECRET` — HMAC key shared with every authorized client.
    pub secret: String,
    /// `SRPC_AUTH_CLOCK_DRIFT_MS` — maximum accepted `|now - ts|`, default 30s.
    pub clock_drift_ms: i64,
}

impl Default for SrpcAuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            clock_drift_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// `PG_SCHEMA` — PostgreSQL schema the differ reads/writes (default `public`).
    pub pg_schema: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            pg_schema: "public".to_string(),
        }
    }
}

impl BasaltConfig {
    /// Loads configuration from the current directory and default locations.
    pub fn load() -> anyhow::Result<Self> {
        ConfigLoader::new().load()
    }

    /// Loads configuration rooted at a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Returns the effective Redis key prefix for mutex keys: `mutex.redis_prefix`
    /// when set, else `redis.prefix`.
    pub fn mutex_prefix(&self) -> &str {
        if self.mutex.redis_prefix.is_empty() {
            &self.redis.prefix
        } else {
            &self.mutex.redis_prefix
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = BasaltConfig::default();
        assert_eq!(config.redis.host, "127.0.0.1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.mutex.mode, MutexMode::Redis);
        assert_eq!(config.srpc.clock_drift_ms, 30_000);
        assert_eq!(config.schema.pg_schema, "public");
    }

    #[test]
    fn mutex_prefix_falls_back_to_redis_prefix() {
        let config = BasaltConfig::default();
        assert_eq!(config.mutex_prefix(), "basalt");

        let mut overridden = config.clone();
        overridden.mutex.redis_prefix = "locks".to_string();
        assert_eq!(overridden.mutex_prefix(), "locks");
    }

    #[test]
    fn sentinel_node_list_splits_and_trims() {
        let mut redis = RedisConfig::default();
        redis.sentinel_nodes = "10.0.0.1:26379, 10.0.0.2:26379,,".to_string();
        assert_eq!(
            redis.sentinel_node_list(),
            vec!["10.0.0.1:26379".to_string(), "10.0.0.2:26379".to_string()]
        );
    }
}
