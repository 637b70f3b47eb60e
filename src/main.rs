//! gpumode - switch a shared GPU between companion, training and gaming modes
//!
//! This binary serves the control API, or runs a single status query or mode
//! switch and exits.

use anyhow::{Context, Result};
use clap::Parser;
use gpumode::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpumode")]
#[command(about = "Switch a shared GPU between companion, training and gaming modes")]
struct Args {
    /// Path to configuration file (built-in defaults if it does not exist)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the current status as JSON and exit
    #[arg(long, conflicts_with = "switch")]
    status: bool,

    /// Switch to the given mode, print the result as JSON and exit
    #[arg(long, value_name = "MODE")]
    switch: Option<String>,

    /// Use an in-memory container runtime; no containers or scripts are touched
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Script output is logged under the "script" target at debug level,
    // so it can be enabled with e.g. RUST_LOG=info,script=debug.
    let filter = if args.verbose {
        EnvFilter::new("gpumode=debug,script=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .await
            .with_context(|| format!("Failed to load config from {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
        Config::default()
    };

    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate();

    let (control_router, metrics_router, switcher) =
        gpumode::build_app(&config, args.dry_run).context("Failed to build application")?;

    if args.status {
        let report = gpumode::status::collect(&switcher).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(mode) = args.switch {
        let result = switcher.switch_to(&mode).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        std::process::exit(if result.success { 0 } else { 1 });
    }

    // Spawn metrics server if enabled
    if let Some(metrics_router) = metrics_router {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let current_mode = switcher.detector().detect().await;
    info!(addr = %addr, current_mode = %current_mode, "Serving control API");

    axum::serve(listener, control_router)
        .await
        .context("Server error")?;

    Ok(())
}
