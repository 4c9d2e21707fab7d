//! Endpoint resolution
//!
//! Turns a connection intent into a concrete endpoint from a directory
//! snapshot. Selection prefers endpoints the user's plan covers but falls back
//! to the best online endpoint overall, leaving the gate decision to the
//! entitlement checker so the caller can tell "nothing reachable" apart from
//! "reachable but gated".

use crate::error::ErrorKind;
use crate::types::{ConnectionIntent, Endpoint, Profile, SelectionMode, UserEntitlement};
use crate::vpn::entitlement::EntitlementChecker;
use thiserror::Error;
use tracing::debug;

/// Directory lookup collaborator
pub trait EndpointDirectory: Send + Sync + 'static {
    /// Current endpoint snapshot
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Saved profile by name
    fn profile(&self, name: &str) -> Option<Profile>;
}

/// In-memory directory, typically loaded from the servers file
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    endpoints: Vec<Endpoint>,
    profiles: Vec<Profile>,
}

impl StaticDirectory {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            profiles: Vec::new(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<Profile>) -> Self {
        self.profiles = profiles;
        self
    }
}

impl EndpointDirectory for StaticDirectory {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }

    fn profile(&self, name: &str) -> Option<Profile> {
        self.profiles.iter().find(|p| p.name == name).cloned()
    }
}

/// Why an intent could not be turned into an endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailed {
    #[error("no online servers in directory")]
    NoOnlineEndpoints,

    #[error("no online servers in {0}")]
    NoOnlineInCountry(String),

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("unknown profile {0}")]
    UnknownProfile(String),
}

impl From<ResolutionFailed> for ErrorKind {
    fn from(e: ResolutionFailed) -> Self {
        ErrorKind::ResolutionFailed(e.to_string())
    }
}

/// Resolves intents against a directory snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointSelector {
    checker: EntitlementChecker,
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &self,
        intent: &ConnectionIntent,
        directory: &dyn EndpointDirectory,
        entitlement: &UserEntitlement,
    ) -> Result<Endpoint, ResolutionFailed> {
        let endpoints = directory.endpoints();

        let mode = match &intent.mode {
            SelectionMode::Profile(name) => {
                let profile = directory
                    .profile(name)
                    .ok_or_else(|| ResolutionFailed::UnknownProfile(name.clone()))?;
                debug!(profile = %name, target = ?profile.target, "Resolved profile");
                SelectionMode::from(profile.target)
            }
            other => other.clone(),
        };

        match mode {
            // Passed through as-is; liveness and tier are the gate's concern
            SelectionMode::Server(id) => endpoints
                .into_iter()
                .find(|e| e.id == id)
                .ok_or(ResolutionFailed::UnknownServer(id)),
            SelectionMode::Fastest => self
                .best(endpoints.iter(), entitlement)
                .ok_or(ResolutionFailed::NoOnlineEndpoints),
            SelectionMode::Country(code) => {
                if !endpoints.iter().any(Endpoint::is_online) {
                    return Err(ResolutionFailed::NoOnlineEndpoints);
                }
                let in_country = endpoints
                    .iter()
                    .filter(|e| e.country.eq_ignore_ascii_case(&code));
                self.best(in_country, entitlement)
                    .ok_or(ResolutionFailed::NoOnlineInCountry(code))
            }
            SelectionMode::Profile(name) => Err(ResolutionFailed::UnknownProfile(name)),
        }
    }

    /// Best-scoring online endpoint the plan covers, else best online overall
    fn best<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Endpoint>,
        entitlement: &UserEntitlement,
    ) -> Option<Endpoint> {
        let online: Vec<&Endpoint> = candidates.filter(|e| e.is_online()).collect();

        let covered = online
            .iter()
            .copied()
            .filter(|e| self.checker.check(entitlement, e).is_allowed())
            .min_by(|a, b| by_score(a, b));

        covered
            .or_else(|| online.iter().copied().min_by(|a, b| by_score(a, b)))
            .cloned()
    }
}

fn by_score(a: &Endpoint, b: &Endpoint) -> std::cmp::Ordering {
    a.score.total_cmp(&b.score).then_with(|| a.id.cmp(&b.id))
}
