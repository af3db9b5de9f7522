//! postflow worker service.
//!
//! Runs the change-stream consumer and the heartbeat reaper over in-memory
//! backends and serves liveness and readiness checks.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use postflow_core::SystemClock;
use postflow_core::observability::{LogFormat, init_logging};
use postflow_pipeline::config::PipelineConfig;
use postflow_pipeline::publisher::AccountPublisher;
use postflow_pipeline::stream::ChangeQueue;
use postflow_pipeline::templates::parse_templates;
use postflow_pipeline::worker::LocalBackends;

#[derive(Debug, Parser)]
#[command(name = "postflow-worker", version, about = "postflow pipeline worker")]
struct Args {
    /// Identity of this worker in lock records; a fresh ULID when unset.
    #[arg(long, env = "POSTFLOW_PROCESS_ID")]
    process_id: Option<String>,

    /// Port for the health endpoints.
    #[arg(long, env = "POSTFLOW_PORT", default_value_t = 8080)]
    port: u16,

    /// Log output format (json or pretty).
    #[arg(long, env = "POSTFLOW_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// JSON file with a full pipeline configuration.
    #[arg(long, env = "POSTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file with the prompt templates.
    #[arg(long, env = "POSTFLOW_TEMPLATES")]
    templates: PathBuf,

    /// JSON file with the publisher profiles.
    #[arg(long, env = "POSTFLOW_PROFILES")]
    profiles: Option<PathBuf>,

    /// Messages processed concurrently.
    #[arg(long, env = "POSTFLOW_MAX_CONCURRENT_CONSUMERS")]
    max_concurrent_consumers: Option<usize>,

    /// Messages received per poll.
    #[arg(long, env = "POSTFLOW_MAX_MESSAGES_PER_POLL")]
    max_messages_per_poll: Option<usize>,

    /// Change message visibility timeout in seconds.
    #[arg(long, env = "POSTFLOW_VISIBILITY_TIMEOUT_SECS")]
    visibility_timeout_secs: Option<u64>,

    /// Assignment lock TTL in seconds.
    #[arg(long, env = "POSTFLOW_ASSIGNMENT_LOCK_TTL_SECS")]
    assignment_lock_ttl_secs: Option<u64>,

    /// Publish lock TTL in seconds.
    #[arg(long, env = "POSTFLOW_PUBLISH_LOCK_TTL_SECS")]
    publish_lock_ttl_secs: Option<u64>,

    /// Render completion wait in seconds.
    #[arg(long, env = "POSTFLOW_RENDER_WAIT_SECS")]
    render_wait_secs: Option<u64>,

    /// Upload confirmation wait in seconds.
    #[arg(long, env = "POSTFLOW_PUBLISH_CONFIRM_WAIT_SECS")]
    publish_confirm_wait_secs: Option<u64>,

    /// Expired assignments tolerated per root and channel.
    #[arg(long, env = "POSTFLOW_MAX_ASSIGNMENT_ATTEMPTS")]
    max_assignment_attempts: Option<u32>,

    /// Seconds between reaper sweeps.
    #[arg(long, env = "POSTFLOW_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,

    /// Sweeps without progress before an item is reported stalled.
    #[arg(long, env = "POSTFLOW_STALL_THRESHOLD")]
    stall_threshold: Option<u32>,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&read(path)?)
                .with_context(|| format!("parsing {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        override_with(&mut config.consumer.max_concurrent_consumers, self.max_concurrent_consumers);
        override_with(&mut config.consumer.max_messages_per_poll, self.max_messages_per_poll);
        override_with(&mut config.consumer.visibility_timeout_secs, self.visibility_timeout_secs);
        override_with(&mut config.locks.assignment_lock_ttl_secs, self.assignment_lock_ttl_secs);
        override_with(&mut config.locks.publish_lock_ttl_secs, self.publish_lock_ttl_secs);
        override_with(&mut config.stages.render_wait_secs, self.render_wait_secs);
        override_with(&mut config.stages.publish_confirm_wait_secs, self.publish_confirm_wait_secs);
        override_with(&mut config.stages.max_assignment_attempts, self.max_assignment_attempts);
        override_with(&mut config.reaper.sweep_interval_secs, self.sweep_interval_secs);
        override_with(&mut config.reaper.stall_threshold, self.stall_threshold);

        config.validate()?;
        Ok(config)
    }

    fn profiles(&self) -> Result<Vec<AccountPublisher>> {
        let Some(path) = &self.profiles else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&read(path)?).with_context(|| format!("parsing {}", path.display()))
    }
}

fn override_with<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

#[derive(Clone)]
struct AppState {
    queue: Arc<dyn ChangeQueue>,
    cancel: CancellationToken,
}

#[derive(Debug, Serialize)]
struct Readiness {
    status: &'static str,
    queue_depth: Option<u64>,
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    if state.cancel.is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Readiness {
                status: "shutting_down",
                queue_depth: None,
            }),
        );
    }
    match state.queue.depth().await {
        Ok(depth) => (
            StatusCode::OK,
            Json(Readiness {
                status: "ready",
                queue_depth: Some(depth),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "readiness check could not reach the change queue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Readiness {
                    status: "queue_unavailable",
                    queue_depth: None,
                }),
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = args.pipeline_config()?;
    let templates = parse_templates(&read(&args.templates)?)?;
    let profiles = args.profiles()?;
    let process_id = args
        .process_id
        .clone()
        .unwrap_or_else(|| Ulid::new().to_string());

    tracing::info!(
        %process_id,
        templates = templates.len(),
        profiles = profiles.len(),
        "starting postflow worker"
    );

    let backends = LocalBackends::new(Arc::new(SystemClock), config, templates, profiles)?;
    let worker = backends.worker(&process_id);
    let cancel = CancellationToken::new();

    let state = AppState {
        queue: backends.queue.clone(),
        cancel: cancel.clone(),
    };
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "health endpoints listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
        signal_cancel.cancel();
    });

    let outcome = worker.run(cancel.clone()).await;
    cancel.cancel();
    server.await.context("health server task")??;
    outcome?;
    Ok(())
}
