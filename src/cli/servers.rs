//! Server listing command

use colored::Colorize;
use veil_core::config::toml_config::load_directory;
use veil_core::error::VeilError;
use veil_core::vpn::entitlement::{Decision, EntitlementChecker};

/// Print the directory sorted by score, with the plan decision per server
pub fn run_servers(country: Option<&str>) -> Result<(), VeilError> {
    let file = load_directory()?;
    let entitlement = file.entitlement();
    let checker = EntitlementChecker::new();

    let mut servers: Vec<_> = file
        .servers
        .iter()
        .filter(|s| country.map_or(true, |c| s.country.eq_ignore_ascii_case(c)))
        .collect();
    servers.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.id.cmp(&b.id)));

    println!("Plan: {}", entitlement.tier.to_string().bold());
    if servers.is_empty() {
        println!("No servers found");
        return Ok(());
    }

    for server in servers {
        let decision = checker.check(&entitlement, server);
        let verdict = match decision {
            Decision::Allowed => "available".green(),
            Decision::RequiresUpgrade(_) => decision.to_string().yellow(),
            Decision::Unavailable => "maintenance".red(),
        };
        let secure = if server.secure_core { " [secure core]" } else { "" };
        println!(
            "  {:<10} {:<3} {:>6.2}  {:<9}{}  {}",
            server.id,
            server.country,
            server.score,
            server.tier.to_string(),
            secure,
            verdict
        );
    }

    Ok(())
}
