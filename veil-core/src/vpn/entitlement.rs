//! Entitlement gate
//!
//! Decides whether a user's plan may connect to an endpoint. Liveness is
//! checked before tier so a user is never offered an upgrade for a server
//! that is down.

use crate::error::{ErrorKind, UpgradeFeature};
use crate::types::{Endpoint, Tier, UserEntitlement};
use tokio::sync::watch;

/// Minimum tier for endpoints routed through secure core
pub const SECURE_ROUTING_MIN_TIER: Tier = Tier::Plus;

/// Result of an entitlement check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    RequiresUpgrade(UpgradeFeature),
    Unavailable,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// The error kind reported for a denied decision
    pub fn into_error(self) -> Option<ErrorKind> {
        match self {
            Decision::Allowed => None,
            Decision::RequiresUpgrade(feature) => Some(ErrorKind::RequiresUpgrade(feature)),
            Decision::Unavailable => Some(ErrorKind::ServerUnavailable),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allowed => write!(f, "allowed"),
            Decision::RequiresUpgrade(feature) => write!(f, "requires upgrade ({})", feature),
            Decision::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Pure entitlement policy
#[derive(Debug, Clone, Copy, Default)]
pub struct EntitlementChecker;

impl EntitlementChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, entitlement: &UserEntitlement, endpoint: &Endpoint) -> Decision {
        if !endpoint.is_online() {
            return Decision::Unavailable;
        }

        if endpoint.secure_core && !entitlement.tier.covers(SECURE_ROUTING_MIN_TIER) {
            return Decision::RequiresUpgrade(UpgradeFeature::SecureRouting);
        }

        if !entitlement.tier.covers(endpoint.tier) {
            return Decision::RequiresUpgrade(UpgradeFeature::MultiTier {
                required: endpoint.tier,
            });
        }

        Decision::Allowed
    }
}

/// Source of the user's current entitlement
///
/// The orchestrator calls `snapshot()` exactly once per intent and evaluates
/// the whole attempt against that value.
pub trait EntitlementSource: Send + Sync + 'static {
    fn snapshot(&self) -> UserEntitlement;
}

impl EntitlementSource for UserEntitlement {
    fn snapshot(&self) -> UserEntitlement {
        *self
    }
}

/// Entitlement refreshed in the background by a plan watcher
impl EntitlementSource for watch::Receiver<UserEntitlement> {
    fn snapshot(&self) -> UserEntitlement {
        *self.borrow()
    }
}
