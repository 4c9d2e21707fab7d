//! Type definitions for the connection data model
//!
//! Endpoints and entitlements are immutable snapshots: the orchestrator reads
//! them once per intent and never mutates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan tier ladder, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Plus,
    Visionary,
}

impl Tier {
    /// Whether a plan at this tier may use endpoints requiring `required`
    pub fn covers(self, required: Tier) -> bool {
        self >= required
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Basic => write!(f, "basic"),
            Tier::Plus => write!(f, "plus"),
            Tier::Visionary => write!(f, "visionary"),
        }
    }
}

/// Liveness flag reported by the server directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Maintenance,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::Online
    }
}

/// A connectable server as listed by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier, e.g. "CH#4"
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// ISO country code of the exit
    pub country: String,

    /// Entry host handed to the tunnel primitive
    pub host: String,

    /// Minimum plan tier required to connect
    #[serde(default)]
    pub tier: Tier,

    #[serde(default)]
    pub status: Liveness,

    /// Load/latency score, lower is better
    #[serde(default)]
    pub score: f64,

    /// Routed through the secure-core network
    #[serde(default)]
    pub secure_core: bool,
}

impl Endpoint {
    /// Create an online endpoint with default score and no secure routing
    pub fn new(id: &str, country: &str, host: &str, tier: Tier) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            country: country.to_string(),
            host: host.to_string(),
            tier,
            status: Liveness::Online,
            score: 0.0,
            secure_core: false,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_status(mut self, status: Liveness) -> Self {
        self.status = status;
        self
    }

    pub fn with_secure_core(mut self, secure_core: bool) -> Self {
        self.secure_core = secure_core;
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == Liveness::Online
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The user's plan-derived rights, captured once per connection intent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub tier: Tier,
}

impl UserEntitlement {
    pub fn new(tier: Tier) -> Self {
        Self { tier }
    }
}

/// Saved connection target referenced by a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileTarget {
    Fastest,
    Country(String),
    Server(String),
}

/// A named saved connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub target: ProfileTarget,
}

/// How a connection intent picks its endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// A specific server by id
    Server(String),
    /// Best-scoring server overall
    Fastest,
    /// Best-scoring server in a country
    Country(String),
    /// A saved profile by name
    Profile(String),
}

impl From<ProfileTarget> for SelectionMode {
    fn from(target: ProfileTarget) -> Self {
        match target {
            ProfileTarget::Fastest => SelectionMode::Fastest,
            ProfileTarget::Country(code) => SelectionMode::Country(code),
            ProfileTarget::Server(id) => SelectionMode::Server(id),
        }
    }
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionMode::Server(id) => write!(f, "server {}", id),
            SelectionMode::Fastest => write!(f, "fastest"),
            SelectionMode::Country(code) => write!(f, "fastest in {}", code),
            SelectionMode::Profile(name) => write!(f, "profile {}", name),
        }
    }
}

/// A user's request to connect
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionIntent {
    pub mode: SelectionMode,

    /// Human-readable trigger label for diagnostics
    pub cause: String,

    pub created_at: DateTime<Utc>,
}

impl ConnectionIntent {
    pub fn new(mode: SelectionMode, cause: impl Into<String>) -> Self {
        Self {
            mode,
            cause: cause.into(),
            created_at: Utc::now(),
        }
    }

    pub fn fastest(cause: impl Into<String>) -> Self {
        Self::new(SelectionMode::Fastest, cause)
    }

    pub fn server(id: &str, cause: impl Into<String>) -> Self {
        Self::new(SelectionMode::Server(id.to_string()), cause)
    }
}

/// Identity of one connection attempt; strictly increasing per orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId(pub u64);

impl AttemptId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
