// Reserva CLI - hierarchical resource-reservation broker
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use reserva::{init_logging_with_level, Server, ServerConfig};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "A hierarchical resource-reservation broker with a first-order-logic policy engine",
    long_about = "Reserva walks an organization's entity tree for every request, \
                  evaluates a policy at each hop, and atomically allocates tickets \
                  or timeslots into per-organization ledgers."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress everything except errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker and listen for allocation requests
    Serve {
        /// Address to bind
        #[arg(long, env = "SERVER_IP", default_value = "127.0.0.1")]
        ip: String,

        /// Port to bind
        #[arg(long, env = "SERVER_PORT", default_value_t = 6000)]
        port: u16,

        /// Directory holding the organization ledgers
        #[arg(long, env = "RESERVA_DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,

        /// Accept-loop poll interval in milliseconds; the shutdown flag is
        /// checked once per interval
        #[arg(long, default_value_t = 2000)]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Serve {
            ip,
            port,
            data_dir,
            poll_interval_ms,
        } => {
            tokio::fs::create_dir_all(&data_dir).await?;
            let server = Server::new(ServerConfig {
                ip,
                port,
                data_root: data_dir,
                poll_interval: Duration::from_millis(poll_interval_ms),
            });
            server.serve().await
        }
    }
}
