//! cueflowd: the lighting engine daemon
//!
//! Wires the pieces together: loads both config documents from
//! `--config-dir`, assembles the engine (which starts the configured
//! sinks), spawns the retransmitter and the MQTT worker, runs the
//! autostart, serves the HTTP API, and performs orderly shutdown on
//! SIGINT/SIGTERM (cancel playback, cancel fallbacks, stop retransmitter,
//! stop sinks, close the bus, exit 0).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cueflow::config::{ConfigStore, SettingsStore};
use cueflow::{engine::Engine, http, mqtt, recovery, retransmit};

#[derive(Parser, Debug)]
#[command(name = "cueflowd", about = "MQTT/HTTP driven DMX playback engine")]
struct Args {
    /// Directory containing settings.json and config.json
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Print the current configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Print full configuration details on startup
    #[arg(long)]
    print_config: bool,

    /// Disable the HTTP API server
    #[arg(long)]
    disable_web_server: bool,

    /// HTTP API port (overrides settings.json)
    #[arg(long)]
    web_port: Option<u16>,

    /// Disable MQTT
    #[arg(long)]
    disable_mqtt: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = SettingsStore::load(&args.config_dir);
    let default_level = settings.read(|s| s.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "cueflowd={default_level},cueflow={default_level},tower_http=info"
            ))
        }))
        .with_target(false)
        .compact()
        .init();

    if args.show_config || args.print_config {
        let rendered = serde_json::to_string_pretty(&settings.snapshot())
            .context("render settings")?;
        println!("{rendered}");
        if args.show_config {
            return Ok(());
        }
    }

    let config = ConfigStore::load(&args.config_dir).context("load config.json")?;
    let engine = Engine::new(settings, config);
    info!(sinks = ?engine.sinks.names(), "engine started");

    retransmit::spawn(engine.clone());

    let bus_task = if args.disable_mqtt {
        info!("MQTT disabled by command line argument");
        None
    } else {
        let engine = engine.clone();
        Some(tokio::spawn(async move { mqtt::run(engine).await }))
    };

    recovery::run_autostart(&engine);

    let web = engine.settings.read(|s| s.web_server.clone());
    let serve_web = web.enabled && !args.disable_web_server;
    let web_port = args.web_port.unwrap_or(web.port);

    let http_task = if serve_web {
        let engine = engine.clone();
        let host = web.host.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(engine, &host, web_port).await {
                warn!(error = %e, "HTTP server exited");
            }
        }))
    } else {
        info!("HTTP API disabled");
        None
    };

    wait_for_signal().await;
    engine.orderly_shutdown();

    if let Some(task) = http_task {
        let _ = task.await;
    }
    if let Some(task) = bus_task {
        let _ = task.await;
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
