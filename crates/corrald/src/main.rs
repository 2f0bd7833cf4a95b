//! corrald — the corral daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb, in-memory when no data dir is configured)
//! - Heartbeat monitor, eval broker, plan queue, scheduling workers
//! - REST API
//!
//! # Usage
//!
//! ```text
//! corrald server --config corral.toml --api-port 4646 --data-dir /var/lib/corral
//! corrald config > corral.toml
//! ```

mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use corral_core::ServerConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corrald", about = "corral control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a control plane server. A lone server elects itself leader.
    Server {
        /// TOML config file. CLI flags override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for the REST API.
        #[arg(long)]
        api_port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of scheduling workers.
        #[arg(long)]
        num_schedulers: Option<usize>,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Server {
            config,
            api_port,
            data_dir,
            num_schedulers,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::from_file(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(port) = api_port {
                config.api_addr.set_port(port);
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            if let Some(n) = num_schedulers {
                config.scheduler.num_schedulers = n;
            }
            config.validate()?;
            control_plane::run_server(config).await
        }
        Command::Config => {
            print!("{}", ServerConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,corrald=debug,corral=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
