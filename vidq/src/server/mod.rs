//! HTTP surface of the transcoding service.
//!
//! Endpoints:
//! - POST /transcode - Submit a job
//! - GET /transcode/status/{id} - Job record
//! - GET /transcode/jobs - Running and paused jobs
//! - GET /transcode/queue - Waiting jobs, in dispatch order
//! - DELETE /transcode/cancel/{id} - Cancel a job
//! - GET /transcode/logs/{id} - Job log lines
//! - POST /transcode/resubmit/{id} - Retry a failed job
//! - POST /transcode/resubmit-failed - Retry every failed job
//! - POST /transcode/pause/{id}, POST /transcode/resume/{id}
//! - PATCH /transcode/priority/{id}/{priority}
//! - GET /transcode/formats - Supported output formats
//! - POST /webhook - External status updates
//! - GET /health - Liveness probe
//! - WS /ws - Job events in real time
//!
//! The server writes its PID and port under `~/.vidq` so the CLI can find it.

mod error;
mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::scheduler::Scheduler;

const SERVER_DIR: &str = ".vidq";
const PID_FILE: &str = "server.pid";
const PORT_FILE: &str = "server.port";

/// Shared server state.
pub struct ServerState {
    pub scheduler: Scheduler,
    /// Executable probed by `/health`.
    pub ffmpeg_program: String,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/transcode", post(handlers::submit))
        .route("/transcode/status/{job_id}", get(handlers::status))
        .route("/transcode/jobs", get(handlers::list_active))
        .route("/transcode/queue", get(handlers::list_queued))
        .route("/transcode/cancel/{job_id}", delete(handlers::cancel))
        .route("/transcode/logs/{job_id}", get(handlers::logs))
        .route("/transcode/resubmit-failed", post(handlers::resubmit_failed))
        .route("/transcode/resubmit/{job_id}", post(handlers::resubmit))
        .route("/transcode/pause/{job_id}", post(handlers::pause))
        .route("/transcode/resume/{job_id}", post(handlers::resume))
        .route(
            "/transcode/priority/{job_id}/{priority}",
            patch(handlers::set_priority),
        )
        .route("/transcode/formats", get(handlers::formats))
        .route("/webhook", post(handlers::webhook))
        .route("/health", get(handlers::health))
        .route("/ws", get(handlers::websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(state: Arc<ServerState>, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let server_dir = get_server_dir()?;
    std::fs::create_dir_all(&server_dir)?;

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    std::fs::write(server_dir.join(PID_FILE), std::process::id().to_string())?;
    std::fs::write(server_dir.join(PORT_FILE), port.to_string())?;
    info!("vidq server listening on http://{addr}");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    let _ = std::fs::remove_file(server_dir.join(PID_FILE));
    let _ = std::fs::remove_file(server_dir.join(PORT_FILE));
    info!("HTTP server stopped");

    served
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn get_server_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(SERVER_DIR))
}

/// Port of the running server, if one is alive.
pub fn get_server_port() -> Option<u16> {
    let server_dir = get_server_dir().ok()?;
    let pid: u32 = std::fs::read_to_string(server_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()?;

    #[cfg(unix)]
    {
        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !alive {
            return None;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    std::fs::read_to_string(server_dir.join(PORT_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}
