//! Error types for the veil VPN orchestration core
//!
//! This module defines all error types used throughout the application,
//! from configuration loading up to the connection outcome kinds that
//! subscribers render.

use crate::types::Tier;
use thiserror::Error;

/// Main error type for the veil application
#[derive(Error, Debug)]
pub enum VeilError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to VPN connection operations
    #[error("VPN error: {0}")]
    Vpn(#[from] VpnError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Which plan feature gates an endpoint, so the caller can show the right offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeFeature {
    /// The endpoint belongs to a higher plan tier
    MultiTier { required: Tier },
    /// The endpoint routes through the secure-core network
    SecureRouting,
}

impl std::fmt::Display for UpgradeFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeFeature::MultiTier { required } => write!(f, "{} plan required", required),
            UpgradeFeature::SecureRouting => write!(f, "secure core requires a plus plan"),
        }
    }
}

/// Outcome kinds of a connection intent that did not end connected
///
/// Policy kinds (`RequiresUpgrade`, `ServerUnavailable`) are decisions, not
/// faults: they are never retried and never consume the retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Server unreachable")]
    Unreachable,

    #[error("Upgrade required: {0}")]
    RequiresUpgrade(UpgradeFeature),

    #[error("Server under maintenance")]
    ServerUnavailable,

    #[error("No server could be resolved: {0}")]
    ResolutionFailed(String),

    #[error("Tunnel fault: {0}")]
    TunnelFault(String),
}

impl ErrorKind {
    /// Policy decisions for the caller to render as prompts
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            ErrorKind::RequiresUpgrade(_) | ErrorKind::ServerUnavailable
        )
    }

    /// Only an unreachable endpoint is retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unreachable)
    }
}

/// VPN connection operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VpnError {
    #[error("Connection failed: {0}")]
    Connection(#[from] ErrorKind),

    #[error("Cannot {action} while {state}")]
    InvalidStateTransition { state: String, action: &'static str },

    #[error("Tunnel session already has an active handle")]
    TunnelAlreadyActive,

    #[error("Failed to spawn tunnel process: {reason}")]
    ProcessSpawnError { reason: String },

    #[error("Failed to terminate tunnel process")]
    TerminationError,

    #[error("Connection orchestrator is no longer running")]
    OrchestratorClosed,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, VeilError>;
