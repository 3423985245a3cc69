use std::{str::FromStr, time::Duration};

use crate::error::ConfigError;

/// How the items of one batch are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Every item runs on its own task; responses are reordered to input order.
    #[default]
    Parallel,
    /// Items run one at a time, in array order.
    Sequential,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(ExecutionMode::Parallel),
            "sequential" => Ok(ExecutionMode::Sequential),
            _ => Err(ConfigError {
                key: "execution_mode",
                value: s.to_owned(),
            }),
        }
    }
}

/// What a sequential batch does after an item fails hard (handler error or panic).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequentialFaultPolicy {
    #[default]
    Continue,
    /// Every later item is answered with a "skipped" error without running.
    SkipRemaining,
}

impl FromStr for SequentialFaultPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(SequentialFaultPolicy::Continue),
            "skip" | "skip_remaining" | "skip-remaining" => Ok(SequentialFaultPolicy::SkipRemaining),
            _ => Err(ConfigError {
                key: "sequential_fault_policy",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest accepted batch. Bigger batches are rejected before any item runs.
    pub max_batch_size: usize,
    pub execution_mode: ExecutionMode,
    pub sequential_fault_policy: SequentialFaultPolicy,
    /// Deadline for server-initiated requests when the caller does not pick one.
    pub request_timeout: Duration,
    /// Sessions without inbound traffic for this long are terminated. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    /// Capacity of each session's outbound queue.
    pub outbound_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            execution_mode: ExecutionMode::Parallel,
            sequential_fault_policy: SequentialFaultPolicy::Continue,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            reap_interval: Duration::from_secs(60),
            outbound_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, keeping the default for anything unset or unparsable.
    ///
    /// # Environment Variables
    ///
    /// - `MCP_MAX_BATCH_SIZE` (default: 100)
    /// - `MCP_BATCH_EXECUTION`: `parallel` or `sequential` (default: parallel)
    /// - `MCP_SEQUENTIAL_FAULT_POLICY`: `continue` or `skip` (default: continue)
    /// - `MCP_REQUEST_TIMEOUT_MS` (default: 60000)
    /// - `MCP_SESSION_IDLE_TIMEOUT_SECS`, 0 disables (default: 1800)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let max_batch_size = parse_warn(&lookup, "MCP_MAX_BATCH_SIZE", default.max_batch_size);
        let execution_mode = parse_warn(&lookup, "MCP_BATCH_EXECUTION", default.execution_mode);
        let sequential_fault_policy = parse_warn(
            &lookup,
            "MCP_SEQUENTIAL_FAULT_POLICY",
            default.sequential_fault_policy,
        );
        let request_timeout = Duration::from_millis(parse_warn(
            &lookup,
            "MCP_REQUEST_TIMEOUT_MS",
            default.request_timeout.as_millis() as u64,
        ));
        let idle_secs = parse_warn(
            &lookup,
            "MCP_SESSION_IDLE_TIMEOUT_SECS",
            default.idle_timeout.map_or(0, |d| d.as_secs()),
        );

        Self {
            max_batch_size,
            execution_mode,
            sequential_fault_policy,
            request_timeout,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            ..default
        }
    }
}

fn parse_warn<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, ?default, "invalid configuration value, using default");
            default
        }
    }
}
