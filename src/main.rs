//! veil - VPN connection orchestration CLI
//!
//! Picks a server from the local directory file, gates it against the
//! account's plan and drives the tunnel through the connection state machine.

use clap::{Parser, Subcommand};
use veil_core::error::{VeilError, VpnError};
use veil_core::init_logging;

mod cli;

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "VPN connection orchestration with plan gating and bounded retry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List servers in the directory and whether the plan allows them
    Servers {
        /// Only show servers in this country
        #[arg(long)]
        country: Option<String>,
    },
    /// Check whether the account may connect to a server
    Check {
        /// Server id, e.g. CH#4
        server: String,
    },
    /// Connect and stay connected until interrupted
    Connect(cli::connect::ConnectArgs),
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Servers { country } => cli::servers::run_servers(country.as_deref()),
        Commands::Check { server } => cli::check::run_check(&server),
        Commands::Connect(args) => cli::connect::run_connect(args).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration errors (exit code 2)
                VeilError::Config(_) | VeilError::Toml(_) | VeilError::TomlSerialize(_) => 2,
                // Plan and maintenance decisions (exit code 3)
                VeilError::Vpn(VpnError::Connection(ref kind)) if kind.is_policy() => 3,
                // Connection failures and runtime errors (exit code 1)
                VeilError::Vpn(_) | VeilError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
