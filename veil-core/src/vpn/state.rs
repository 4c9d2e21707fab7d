//! VPN connection state
//!
//! Defines the orchestrator's state machine states and the notification
//! published to subscribers on every transition.

use crate::error::ErrorKind;
use crate::types::{AttemptId, Endpoint};
use chrono::{DateTime, Utc};

/// Why the orchestrator is retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Unreachable,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// VPN connection states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt in progress
    Idle,

    /// Intent admitted, endpoint being handed to the tunnel
    ResolvingEndpoint,

    /// Tunnel start in flight
    Connecting,

    /// Tunnel established
    Connected,

    /// Tearing down the tunnel
    Disconnecting,

    /// Waiting to restart the tunnel after a transient failure
    Retrying(RetryReason),

    /// Attempt ended without a connection
    Error(ErrorKind),
}

impl ConnectionState {
    /// `Idle` and `Error` end an attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Error(_))
    }

    /// States in which `cancel()` is accepted
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ConnectionState::ResolvingEndpoint
                | ConnectionState::Connecting
                | ConnectionState::Retrying(_)
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::ResolvingEndpoint => write!(f, "resolving endpoint"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Retrying(reason) => write!(f, "retrying ({})", reason),
            ConnectionState::Error(kind) => write!(f, "error: {}", kind),
        }
    }
}

/// Notification published for every state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub attempt: AttemptId,
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub at: DateTime<Utc>,
}

impl StateChange {
    pub fn new(attempt: AttemptId, state: ConnectionState, endpoint: Option<Endpoint>) -> Self {
        Self {
            attempt,
            state,
            endpoint,
            at: Utc::now(),
        }
    }

    /// Initial notification before any intent
    pub fn idle() -> Self {
        Self::new(AttemptId::default(), ConnectionState::Idle, None)
    }

    pub fn error(&self) -> Option<&ErrorKind> {
        match &self.state {
            ConnectionState::Error(kind) => Some(kind),
            _ => None,
        }
    }
}
