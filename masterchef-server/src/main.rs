use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use masterchef_config::{ConfigLoad, ConfigLoader};
use masterchef_server::{AppState, create_app, infra::startup};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "masterchef-server", version, about = "Masterchef control plane")]
struct Cli {
    /// Path to masterchef.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Alternate .env file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Directory for run records and snapshots
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory job config paths resolve against
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            warn!("shutdown finished after aborting background work");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("{err:#}");
            eprintln!("masterchef-server: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(dir) = cli.state_dir {
        config.state.dir = dir;
    }
    if let Some(workdir) = cli.workdir {
        config.state.workdir = workdir;
    }

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "using configuration file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let control = startup::build_control_plane(&config)?;
    control.start();

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting Masterchef control plane on {}", addr);

    // Control plane shutdown closes the event log, which ends open SSE
    // streams; only then can the HTTP server finish draining.
    let grace = config.shutdown_grace;
    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel();
    let drain = {
        let control = control.clone();
        async move {
            startup::shutdown_signal().await;
            let clean = control.shutdown(grace).await;
            let _ = drained_tx.send(clean);
        }
    };

    let app = create_app(AppState::new(control.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(drain)
        .await;

    let clean = match drained_rx.await {
        Ok(clean) => clean,
        Err(_) => control.shutdown(grace).await,
    };
    served.context("HTTP server failed")?;
    info!(clean, "Masterchef control plane stopped");
    Ok(clean)
}
