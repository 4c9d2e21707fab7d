//! Connect command
//!
//! Runs the orchestrator in the foreground, renders every transition to the
//! terminal and tears the tunnel down on Ctrl+C or SIGTERM.

use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use veil_core::config::toml_config::load_directory;
use veil_core::error::{ErrorKind, VeilError, VpnError};
use veil_core::types::{ConnectionIntent, SelectionMode};
use veil_core::vpn::command_tunnel::CommandTunnelFactory;
use veil_core::vpn::render::{spawn_renderer, StateRenderer};
use veil_core::vpn::simulated::SimulatedTunnelFactory;
use veil_core::vpn::{ConnectionState, Orchestrator, StateChange, TunnelFactory};

/// How long a simulated tunnel takes to come up
const SIMULATED_CONNECT_DELAY: Duration = Duration::from_millis(300);

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Connect to a specific server id
    #[arg(long, conflicts_with_all = ["country", "profile"])]
    pub server: Option<String>,

    /// Connect to the fastest server in a country
    #[arg(long, conflicts_with = "profile")]
    pub country: Option<String>,

    /// Connect using a saved profile
    #[arg(long)]
    pub profile: Option<String>,

    /// Use an in-process simulated tunnel instead of the tunnel client
    #[arg(long)]
    pub simulate: bool,

    /// Label recorded with the connection for diagnostics
    #[arg(long, default_value = "cli")]
    pub cause: String,
}

impl ConnectArgs {
    fn intent(&self) -> ConnectionIntent {
        let mode = if let Some(id) = &self.server {
            SelectionMode::Server(id.clone())
        } else if let Some(code) = &self.country {
            SelectionMode::Country(code.clone())
        } else if let Some(name) = &self.profile {
            SelectionMode::Profile(name.clone())
        } else {
            SelectionMode::Fastest
        };
        ConnectionIntent::new(mode, self.cause.clone())
    }
}

/// Prints transitions as status lines
#[derive(Debug, Default)]
struct ConsoleRenderer;

impl StateRenderer for ConsoleRenderer {
    fn render(&mut self, change: &StateChange) {
        let server = change
            .endpoint
            .as_ref()
            .map(|e| e.id.as_str())
            .unwrap_or("server");

        let line = match &change.state {
            ConnectionState::Idle => "Disconnected".dimmed(),
            ConnectionState::ResolvingEndpoint => format!("Selected {}", server).normal(),
            ConnectionState::Connecting => format!("Connecting to {}...", server).normal(),
            ConnectionState::Connected => format!("✓ Connected to {}", server).green().bold(),
            ConnectionState::Disconnecting => "Disconnecting...".normal(),
            ConnectionState::Retrying(reason) => {
                format!("{} is {}, retrying...", server, reason).yellow()
            }
            ConnectionState::Error(ErrorKind::RequiresUpgrade(feature)) => {
                format!("⚠ {}: {}. Upgrade your plan to connect.", server, feature).yellow()
            }
            ConnectionState::Error(ErrorKind::ServerUnavailable) => {
                format!("⚠ {} is under maintenance, pick another server.", server).yellow()
            }
            ConnectionState::Error(kind) => format!("✗ {}", kind).red(),
        };
        println!("{}", line);
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}

/// Run the connect command until the connection ends or is interrupted
pub async fn run_connect(args: ConnectArgs) -> Result<(), VeilError> {
    let file = load_directory()?;

    let tunnels: Arc<dyn TunnelFactory> = if args.simulate {
        info!("Using simulated tunnel");
        Arc::new(SimulatedTunnelFactory::new(SIMULATED_CONNECT_DELAY))
    } else {
        Arc::new(CommandTunnelFactory::new(file.tunnel_config()))
    };

    let handle = Orchestrator::new(
        file.orchestrator_config(),
        Arc::new(file.directory()),
        Arc::new(file.entitlement()),
        tunnels,
    )
    .spawn();
    let renderer = spawn_renderer(handle.subscribe(), ConsoleRenderer);

    let outcome = match handle.connect(args.intent()).await {
        Ok(attempt) => {
            info!(%attempt, "Connection attempt admitted");
            let mut current = handle.watch();
            let interrupted = shutdown_signal();
            tokio::pin!(interrupted);

            loop {
                if let Some(kind) = current.borrow_and_update().error().cloned() {
                    break Err(VpnError::Connection(kind).into());
                }

                tokio::select! {
                    changed = current.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                    result = &mut interrupted => {
                        if let Err(e) = result {
                            warn!("Failed to listen for shutdown signals: {}", e);
                            break Err(VeilError::Io(e));
                        }
                        info!("Interrupted, tearing down connection");
                        let teardown = if handle.state().is_cancellable() {
                            handle.cancel().await
                        } else {
                            handle.disconnect().await
                        };
                        break teardown.map_err(VeilError::from);
                    }
                }
            }
        }
        Err(e) => Err(e.into()),
    };

    // Let the renderer drain once the orchestrator is gone
    handle.shutdown().await;
    drop(handle);
    let _ = renderer.await;

    outcome
}
