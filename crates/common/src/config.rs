use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FanoutError, NodeId, Result};

/// Coordinator behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Id of the node the coordinator runs on. In push mode units assigned
    /// to this node are started in-process instead of being sent over the
    /// transport, and remote pages are pushed back to it.
    pub local_node_id: NodeId,
    /// Upper bound for one `ExecuteJob` round trip; expiry counts as the
    /// node being unavailable.
    pub job_request_timeout_ms: u64,
    /// Upper bound for one best-effort `CloseContext` call.
    pub close_context_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_node_id: NodeId::new("node-1"),
            job_request_timeout_ms: 30_000,
            close_context_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    /// Read overrides from `FANOUT_NODE_ID`, `FANOUT_JOB_REQUEST_TIMEOUT_MS`
    /// and `FANOUT_CLOSE_CONTEXT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            local_node_id: NodeId::new(env_or_default(
                "FANOUT_NODE_ID",
                defaults.local_node_id.as_str(),
            )),
            job_request_timeout_ms: env_parse_or_default(
                "FANOUT_JOB_REQUEST_TIMEOUT_MS",
                defaults.job_request_timeout_ms,
            )?,
            close_context_timeout_ms: env_parse_or_default(
                "FANOUT_CLOSE_CONTEXT_TIMEOUT_MS",
                defaults.close_context_timeout_ms,
            )?,
        })
    }

    pub fn job_request_timeout(&self) -> Duration {
        Duration::from_millis(self.job_request_timeout_ms.max(1))
    }

    pub fn close_context_timeout(&self) -> Duration {
        Duration::from_millis(self.close_context_timeout_ms.max(1))
    }
}

/// Cluster node (job receiver) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node id used in job requests and push deliveries.
    pub node_id: NodeId,
    /// Max rows per pushed page in push mode; `0` pushes each bucket whole.
    pub page_size_rows: usize,
    /// Budget of the node-wide query circuit breaker.
    pub breaker_limit_bytes: usize,
    /// Upper bound for one `PushBucket` round trip.
    pub push_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("node-1"),
            page_size_rows: 8192,
            breaker_limit_bytes: 512 * 1024 * 1024,
            push_timeout_ms: 30_000,
        }
    }
}

impl NodeConfig {
    /// Read overrides from `FANOUT_NODE_ID`, `FANOUT_PAGE_SIZE_ROWS`,
    /// `FANOUT_BREAKER_LIMIT_BYTES` and `FANOUT_PUSH_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            node_id: NodeId::new(env_or_default("FANOUT_NODE_ID", defaults.node_id.as_str())),
            page_size_rows: env_parse_or_default("FANOUT_PAGE_SIZE_ROWS", defaults.page_size_rows)?,
            breaker_limit_bytes: env_parse_or_default(
                "FANOUT_BREAKER_LIMIT_BYTES",
                defaults.breaker_limit_bytes,
            )?,
            push_timeout_ms: env_parse_or_default("FANOUT_PUSH_TIMEOUT_MS", defaults.push_timeout_ms)?,
        })
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms.max(1))
    }
}

/// Read `key` or fall back to `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse `key` when set; unset falls back to `default`, garbage is an error.
pub fn env_parse_or_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| FanoutError::InvalidConfig(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}
