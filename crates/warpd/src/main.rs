//! warpd: the WarpGrid control-plane daemon.
//!
//! Runs the node connection registry and the peer routing protocol, so
//! that any server can locate and reach any node in its region.
//!
//! # Usage
//!
//! ```text
//! warpd init-config --name server-1 --region global --rpc-addr 127.0.0.1:4647 > warpgrid.toml
//! warpd server --config warpgrid.toml
//! warpd resolve --config warpgrid.toml --node node-42
//! ```

mod resolve;
mod server_mode;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warp_core::ServerConfig;

const DEFAULT_LOG_FILTER: &str = "info,warpd=debug,warpgrid_nodeconn=debug";

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a control-plane server.
    Server {
        /// Path to the server configuration file.
        #[arg(long, default_value = "warpgrid.toml")]
        config: PathBuf,
    },

    /// Find the server currently holding a node's connection.
    Resolve {
        /// Path to the server configuration file.
        #[arg(long, default_value = "warpgrid.toml")]
        config: PathBuf,

        /// Node to look up.
        #[arg(long)]
        node: String,

        /// Region to search (defaults to the configured server's region).
        #[arg(long)]
        region: Option<String>,
    },

    /// Print a starter configuration file.
    InitConfig {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "global")]
        region: String,

        #[arg(long, default_value = "127.0.0.1:4647")]
        rpc_addr: SocketAddr,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Server { config } => {
            let config = ServerConfig::from_file(&config)?;
            server_mode::run_server(config).await
        }
        Command::Resolve {
            config,
            node,
            region,
        } => {
            let config = ServerConfig::from_file(&config)?;
            resolve::run_resolve(config, node, region).await
        }
        Command::InitConfig {
            name,
            region,
            rpc_addr,
        } => {
            let config = ServerConfig::scaffold(&name, &region, rpc_addr);
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
