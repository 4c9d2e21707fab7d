//! Entitlement check command

use colored::Colorize;
use veil_core::config::toml_config::load_directory;
use veil_core::error::{ErrorKind, VeilError, VpnError};
use veil_core::vpn::entitlement::EntitlementChecker;

/// Report whether the account's plan allows `server`
///
/// A denied server is returned as an error so the exit code reflects it.
pub fn run_check(server: &str) -> Result<(), VeilError> {
    let file = load_directory()?;
    let entitlement = file.entitlement();

    let Some(endpoint) = file.servers.iter().find(|s| s.id == server) else {
        return Err(VpnError::Connection(ErrorKind::ResolutionFailed(format!(
            "unknown server {}",
            server
        )))
        .into());
    };

    let decision = EntitlementChecker::new().check(&entitlement, endpoint);
    match decision.into_error() {
        None => {
            println!(
                "{} {} ({}) is available on the {} plan",
                "✓".green(),
                endpoint.id,
                endpoint.host,
                entitlement.tier
            );
            Ok(())
        }
        Some(kind) => {
            println!("{} {}: {}", "⚠".yellow(), endpoint.id, kind);
            Err(VpnError::Connection(kind).into())
        }
    }
}
