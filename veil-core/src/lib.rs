//! Core library for the veil VPN CLI
//!
//! This crate provides the connection orchestration core: endpoint
//! selection, entitlement gating, tunnel session handling and the state
//! machine that drives them.

pub mod error;
pub mod types;

pub mod config;
pub mod vpn;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr with pretty formatting. The level defaults to
/// INFO and can be overridden with the `VEIL_LOG` environment variable.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("VEIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .init();
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}
