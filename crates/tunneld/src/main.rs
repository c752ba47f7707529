use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tunneld::config::Config;
use tunneld::logging;
use tunneld::mode::Mode;
use tunneld::proxy::ProxyEngine;

/// A multi-rule TCP tunneling reverse proxy.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[clap(short, long, default_value = "tunneld.toml")]
    config: PathBuf,

    /// Write the default configuration to the --config path and exit.
    #[clap(short, long)]
    generate: bool,

    /// Override the configured runtime mode.
    #[clap(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate {
        Config::generate(&args.config)?;
        println!("wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = Config::load(&args.config)?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let _log_guard = logging::init(&config.log)?;

    let Some(mode) = Mode::create(&config.mode) else {
        error!(mode = %config.mode, "cannot find application mode");
        std::process::exit(1);
    };
    info!(mode = mode.name(), "loading mode");

    let engine = match mode {
        Mode::Proxy => Arc::new(ProxyEngine::new(config.proxy.clone())),
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => (),
                _ = sigint.recv() => (),
            }
            info!("gracefully shutting down...");
            engine.shutdown();
        });
    }

    if let Err(err) = engine.run().await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}
