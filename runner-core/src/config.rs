//! Runtime configuration for the execution pipeline
//!
//! Every knob can be set from the environment; defaults match the values
//! the platform ships with. `RunnerConfig::from_env` never fails: malformed
//! values fall back to the default for that knob.

use crate::network::subnet::SubnetPoolConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the execution pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Execution queue shape
    #[serde(default)]
    pub queue: QueueConfig,

    /// Session container pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Request admission limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-container resource caps
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Session network management
    #[serde(default)]
    pub network: NetworkConfig,

    /// Fallback execution timeout in milliseconds (languages may override)
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
}

/// Execution queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrently executing submissions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of waiting tasks before `QueueFull`
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Maximum time a task may wait before it expires, milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

/// Session container pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle time before a warm container is reclaimed, milliseconds
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// Base interval of the container sweeper, milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Label key stamped on every pooled container for later filtering
    #[serde(default = "default_pool_label")]
    pub pool_label: String,
}

fn default_session_ttl_ms() -> u64 {
    30_000
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_pool_label() -> String {
    "io.coderunner.pool".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: default_session_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            pool_label: default_pool_label(),
        }
    }
}

/// Request admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of files per submission
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Maximum size of one file in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Maximum total size of all files in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_total_bytes: usize,

    /// Maximum `run` frames per socket within the rate window
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_window: usize,

    /// Sliding rate window, milliseconds
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
}

fn default_max_files() -> usize {
    50
}

fn default_max_file_bytes() -> usize {
    1024 * 1024
}

fn default_rate_limit() -> usize {
    10
}

fn default_rate_window_ms() -> u64 {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_file_bytes(),
            rate_limit_per_window: default_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
        }
    }
}

/// Per-container resource caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Default memory ceiling, in engine notation (`"<n>[k|m|g]"`)
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Default CPU allocation as a decimal fraction of a core
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Memory ceiling for database-like runtimes
    #[serde(default = "default_sql_memory")]
    pub sql_memory: String,

    /// CPU allocation for database-like runtimes
    #[serde(default = "default_sql_cpus")]
    pub sql_cpus: f64,
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpus() -> f64 {
    0.5
}

fn default_sql_memory() -> String {
    "512m".to_string()
}

fn default_sql_cpus() -> f64 {
    1.0
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            sql_memory: default_sql_memory(),
            sql_cpus: default_sql_cpus(),
        }
    }
}

/// Session network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Prefix of every managed session network name
    #[serde(default = "default_network_prefix")]
    pub prefix: String,

    /// Label key stamped on every managed network
    #[serde(default = "default_network_label")]
    pub network_label: String,

    /// Base interval of the network sweeper, milliseconds
    #[serde(default = "default_network_sweep_ms")]
    pub sweep_interval_ms: u64,

    /// Ordered subnet pools; allocation spills to the next pool when one
    /// is exhausted
    #[serde(default = "SubnetPoolConfig::default_pools")]
    pub pools: Vec<SubnetPoolConfig>,
}

fn default_network_prefix() -> String {
    "coderunner-net-".to_string()
}

fn default_network_label() -> String {
    "io.coderunner.network".to_string()
}

fn default_network_sweep_ms() -> u64 {
    120_000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            prefix: default_network_prefix(),
            network_label: default_network_label(),
            sweep_interval_ms: default_network_sweep_ms(),
            pools: SubnetPoolConfig::default_pools(),
        }
    }
}

fn default_exec_timeout_ms() -> u64 {
    30_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            pool: PoolConfig::default(),
            limits: LimitsConfig::default(),
            resources: ResourceConfig::default(),
            network: NetworkConfig::default(),
            exec_timeout_ms: default_exec_timeout_ms(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = RunnerConfig::default();

        if let Some(n) = env_parse("CONCURRENT_LIMIT") {
            config.queue.max_concurrent = n;
        }
        if let Some(n) = env_parse("MAX_QUEUE_SIZE") {
            config.queue.max_queue_size = n;
        }
        if let Some(ms) = env_parse("QUEUE_TIMEOUT") {
            config.queue.queue_timeout_ms = ms;
        }

        if let Some(ms) = env_parse("SESSION_TTL") {
            config.pool.session_ttl_ms = ms;
        }
        if let Some(ms) = env_parse("CLEANUP_INTERVAL") {
            config.pool.cleanup_interval_ms = ms;
        }

        if let Ok(mem) = std::env::var("MEM") {
            config.resources.memory = mem;
        }
        if let Some(cpus) = env_parse("CPUS") {
            config.resources.cpus = cpus;
        }
        if let Ok(mem) = std::env::var("SQL_MEM") {
            config.resources.sql_memory = mem;
        }
        if let Some(cpus) = env_parse("SQL_CPUS") {
            config.resources.sql_cpus = cpus;
        }

        if let Some(ms) = env_parse("EXEC_TIMEOUT") {
            config.exec_timeout_ms = ms;
        }
        if let Some(n) = env_parse("RATE_LIMIT_SOCKET_RUN") {
            config.limits.rate_limit_per_window = n;
        }
        if let Ok(prefix) = std::env::var("NETWORK_PREFIX") {
            config.network.prefix = prefix;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.queue.max_concurrent, 10);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.pool.session_ttl_ms, 30_000);
        assert_eq!(config.limits.rate_limit_per_window, 10);
        assert_eq!(config.exec_timeout_ms, 30_000);
        assert_eq!(config.network.pools.len(), 2);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("CONCURRENT_LIMIT", "3");
        std::env::set_var("NETWORK_PREFIX", "test-net-");
        std::env::set_var("QUEUE_TIMEOUT", "not-a-number");

        let config = RunnerConfig::from_env();
        assert_eq!(config.queue.max_concurrent, 3);
        assert_eq!(config.network.prefix, "test-net-");
        // Unparseable values fall back to the default
        assert_eq!(config.queue.queue_timeout_ms, 60_000);

        std::env::remove_var("CONCURRENT_LIMIT");
        std::env::remove_var("NETWORK_PREFIX");
        std::env::remove_var("QUEUE_TIMEOUT");
    }
}
