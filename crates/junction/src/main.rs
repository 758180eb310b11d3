//! `junctiond` — the binder daemon.
//!
//! Loads the configuration, registers the built-in bindings, and serves
//! the WebSocket front door until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use junction::bindings;
use junction_server::{metrics, Binder, Config};

#[derive(Debug, Parser)]
#[command(name = "junctiond", about = "application framework binder daemon")]
struct Args {
    /// Configuration file (JSON).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the listening port.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Override the initial session token (36 bytes).
    #[arg(long)]
    token: Option<String>,

    /// Increase verbosity (repeatable).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("junction={default},junctiond={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(token) = args.token {
        config.initial_token = Some(token);
    }
    if args.verbose > 0 {
        config.verbosity = config.verbosity.max(args.verbose);
    }

    let binder = Binder::new(config).context("building the binder")?;
    binder
        .add_binding(bindings::hello::binding(&binder.hub))
        .context("registering the hello binding")?;

    let handle = metrics::install_recorder();

    tokio::select! {
        served = binder.serve(handle) => served.context("serving")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for interrupt")?;
            info!("interrupt received, shutting down");
        }
    }

    binder.engine.terminate().await;
    Ok(())
}
