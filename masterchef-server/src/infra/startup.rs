use std::sync::Arc;

use anyhow::{Context, Result};
use masterchef_config::Config;
use masterchef_core::ControlPlane;
use tracing::{info, warn};

/// Builds the control plane from loaded configuration; workers are not started.
pub fn build_control_plane(config: &Config) -> Result<Arc<ControlPlane>> {
    std::fs::create_dir_all(&config.state.dir).with_context(|| {
        format!("failed to create state dir {}", config.state.dir.display())
    })?;
    if !config.state.workdir.is_dir() {
        warn!(
            workdir = %config.state.workdir.display(),
            "workdir does not exist; every enqueue will be rejected"
        );
    }

    let control = ControlPlane::builder(
        config.control.clone(),
        config.state.dir.clone(),
        config.state.workdir.clone(),
    )
    .build()
    .context("failed to initialize control plane")?;

    info!(
        state_dir = %config.state.dir.display(),
        workdir = %config.state.workdir.display(),
        workers = config.control.queue.workers,
        "control plane initialized"
    );
    Ok(control)
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
