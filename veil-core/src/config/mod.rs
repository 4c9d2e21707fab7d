//! Configuration module
//!
//! Orchestrator tuning and tunnel client settings, plus TOML I/O of the
//! directory file in `toml_config`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod toml_config;

/// Tuning knobs for the connection orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long to wait for a tunnel to confirm teardown before abandoning it
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_ms: u64,

    /// Delay before the single automatic retry after an unreachable endpoint
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Capacity of the state-change broadcast
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_cancel_timeout() -> u64 {
    5000
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_event_buffer() -> usize {
    64
}

/// Longest accepted retry delay
const MAX_RETRY_DELAY_MS: u64 = 60_000;

impl OrchestratorConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cancel_timeout_ms == 0 {
            return Err("cancel_timeout_ms cannot be zero".to_string());
        }

        if self.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(format!(
                "retry_delay_ms must be at most {}, got: {}",
                MAX_RETRY_DELAY_MS, self.retry_delay_ms
            ));
        }

        if self.event_buffer == 0 {
            return Err("event_buffer cannot be zero".to_string());
        }

        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: default_cancel_timeout(),
            retry_delay_ms: default_retry_delay(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// External tunnel client invocation
///
/// `{host}` in any argument is replaced with the endpoint's entry host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.program.trim().is_empty() {
            return Err("Tunnel program cannot be empty".to_string());
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            program: "openconnect".to_string(),
            args: vec!["{host}".to_string()],
        }
    }
}
