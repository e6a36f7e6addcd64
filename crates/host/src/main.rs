//! PocketRAG host
//!
//! Supervises the kernel process and routes its line-delimited JSON traffic
//! to the windows connected over WebSocket.

mod call_registry;
mod config;
mod control_plane;
mod ids;
mod kernel;
mod logging;
mod paths;
mod ready_gate;
mod session_registry;
mod settings;
mod state;
mod supervisor;
mod watcher;
mod websocket;

#[cfg(test)]
mod test_support;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::{HostArgs, HostConfig};
use crate::control_plane::{ControlPlane, ExitCause, HostCommand, PlaneConfig};
use crate::kernel::ProcessLauncher;
use crate::settings::SettingsAction;
use crate::state::{shared_snapshot, HttpState};

const COMMAND_BUFFER: usize = 256;
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config = HostConfig::from_args(HostArgs::parse())?;

    let data_dir = paths::init_data_dir(config.data_dir.as_deref());
    paths::ensure_dirs()
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let logging = logging::init_logging(&paths::log_dir())?;

    info!(
        component = "host",
        event = "host.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        kernel_path = %config.kernel_path.display(),
        "Starting PocketRAG host"
    );

    let settings_path = paths::settings_path();
    match settings::ensure_settings(&settings_path, &config.default_settings)
        .context("failed to prepare settings.json")?
    {
        SettingsAction::Kept => {}
        action => info!(
            component = "host",
            event = "host.settings_restored",
            action = ?action,
            default_settings = %config.default_settings.display(),
            "Installed default settings"
        ),
    }

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let snapshot = shared_snapshot();
    let launcher = ProcessLauncher::new(config.kernel_path.clone(), data_dir.clone());
    let (plane, kernel_rx) = ControlPlane::new(
        Box::new(launcher),
        PlaneConfig {
            max_restarts: config.max_restarts,
            settings_path,
            modified_settings_path: paths::modified_settings_path(),
        },
        commands_tx.clone(),
        snapshot.clone(),
    );
    let mut plane_task = tokio::spawn(plane.run(kernel_rx, commands_rx));

    let app = websocket::router(HttpState::new(commands_tx.clone(), snapshot));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        component = "host",
        event = "host.listening",
        bind = %config.bind,
        "Listening for windows"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            })
            .await
    });

    let cause = tokio::select! {
        joined = &mut plane_task => joined.context("dispatch loop panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!(
                component = "host",
                event = "host.signal",
                "Interrupt received, stopping kernel"
            );
            let _ = commands_tx.send(HostCommand::Quit).await;
            match tokio::time::timeout(config.shutdown_timeout, &mut plane_task).await {
                Ok(joined) => joined.context("dispatch loop panicked")?,
                Err(_) => {
                    warn!(
                        component = "host",
                        event = "host.shutdown_timeout",
                        timeout_secs = config.shutdown_timeout.as_secs(),
                        "Kernel did not stop in time, killing it"
                    );
                    plane_task.abort();
                    ExitCause::Quit
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server).await {
        Ok(Ok(Err(e))) => warn!(
            component = "host",
            event = "host.server_error",
            error = %e,
            "HTTP server ended with an error"
        ),
        Ok(_) => {}
        Err(_) => warn!(
            component = "host",
            event = "host.server_drain_timeout",
            "Open connections did not drain in time"
        ),
    }

    if cause == ExitCause::Fatal {
        error!(
            component = "host",
            event = "host.exit_fatal",
            "Exiting after repeated kernel failures"
        );
    } else {
        info!(
            component = "host",
            event = "host.exit",
            cause = ?cause,
            "PocketRAG host stopped"
        );
    }

    drop(logging);
    Ok(ExitCode::from(cause.exit_code()))
}
