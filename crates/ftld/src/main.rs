//! ftld — the FTL control plane daemon.
//!
//! Two roles, one per subcommand:
//! - `lease-server` serves the lease service other control plane processes
//!   elect leaders through.
//! - `provisioner` competes for `/system/provisioner`; the winner starts a
//!   scaling engine and converges the deployments declared in the config.
//!
//! # Usage
//!
//! ```text
//! ftld lease-server --bind 127.0.0.1:8895
//! ftld provisioner --config ftl.toml --mode local
//! ```

mod lease_server;
mod provisioner;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_FILTER: &str = "info,ftld=debug,ftl=debug";

#[derive(Parser)]
#[command(name = "ftld", about = "FTL control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the lease service.
    LeaseServer {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8895")]
        bind: SocketAddr,

        /// How often expired leases are swept, in seconds.
        #[arg(long, default_value = "5")]
        sweep_interval: u64,
    },

    /// Elect a provisioner leader and converge declared deployments.
    Provisioner {
        /// Control plane config file.
        #[arg(long)]
        config: PathBuf,

        /// Scaling engine to run while leading.
        #[arg(long, value_enum, default_value_t = Mode::Local)]
        mode: Mode,

        /// URL published to followers. Overrides `controller.advertise`.
        #[arg(long)]
        advertise: Option<Url>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Runner processes on this machine.
    Local,
    /// Kubernetes Deployments, one per deployment key.
    Kube,
    /// Kubernetes Deployments driven by schema change events.
    KubeLegacy,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        shutdown.cancel();
    });

    match cli.command {
        Command::LeaseServer { bind, sweep_interval } => {
            lease_server::run(ctx, bind, Duration::from_secs(sweep_interval.max(1))).await
        }
        Command::Provisioner {
            config,
            mode,
            advertise,
        } => provisioner::run(ctx, &config, mode, advertise).await,
    }
}
