use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tint_core::{
    config::{
        AcquireConfig, HubStrategy, RuntimeConfig, WorkerConfig, DEFAULT_HUB_CACHE,
        DEFAULT_MODEL_ID, DEFAULT_MODEL_ROOT,
    },
    DeviceMap, JobHandler, JobOutput,
};
use tokio::{net::TcpListener, sync::Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Serverless image-to-image diffusion worker")]
struct Args {
    /// Model used when a job does not name one
    #[arg(long, env = "TINT_DEFAULT_MODEL", default_value = DEFAULT_MODEL_ID)]
    default_model: String,

    /// Directory every acquired model is stored under
    #[arg(long, env = "MODEL_ROOT", default_value = DEFAULT_MODEL_ROOT)]
    model_root: PathBuf,

    /// Hub download cache
    #[arg(long, env = "HF_HUB_CACHE", default_value = DEFAULT_HUB_CACHE)]
    hub_cache: PathBuf,

    /// Hub access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hub_token: Option<String>,

    /// Marketplace (civitai) access token
    #[arg(long, env = "CIVITAI_TOKEN", hide_env_values = true)]
    marketplace_token: Option<String>,

    /// How hub models are transferred: snapshot or clone
    #[arg(long, env = "TINT_HUB_STRATEGY", default_value_t = HubStrategy::Snapshot)]
    hub_strategy: HubStrategy,

    /// Do not fall back to the other hub strategy
    #[arg(long)]
    no_hub_fallback: bool,

    /// Attempts per download backend
    #[arg(long, default_value_t = 3)]
    download_retries: usize,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Attention slice size, 0 disables slicing
    #[arg(long, default_value_t = 1)]
    attention_slice_size: usize,

    /// Jobs processed at the same time
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Largest accepted job request body, in bytes
    #[arg(long, env = "TINT_MAX_BODY_BYTES", default_value_t = 64 * 1024 * 1024)]
    max_body_bytes: usize,

    /// Acquire and load the default model before serving
    #[arg(long)]
    preload: bool,

    /// Run a single job from this JSON, print its output and exit
    #[arg(long)]
    test_input: Option<String>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            default_model: Some(self.default_model.clone()),
            acquire: AcquireConfig {
                model_root: self.model_root.clone(),
                hub_cache: self.hub_cache.clone(),
                hub_token: self.hub_token.clone(),
                marketplace_token: self.marketplace_token.clone(),
                hub_strategy: self.hub_strategy,
                hub_fallback: !self.no_hub_fallback,
                retries: self.download_retries.max(1),
                ..Default::default()
            },
            runtime: RuntimeConfig {
                device_map: DeviceMap::from_cpu_flag(self.cpu),
                attention_slice_size: (self.attention_slice_size > 0)
                    .then_some(self.attention_slice_size),
                hub_cache: self.hub_cache.clone(),
                hub_token: self.hub_token.clone(),
                ..Default::default()
            },
        }
    }
}

#[derive(Deserialize)]
struct JobRequest {
    id: Option<String>,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum JobStatus {
    Completed,
    Failed,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    status: JobStatus,
    output: JobOutput,
}

impl JobResponse {
    fn new(id: String, output: JobOutput) -> Self {
        let status = if output.is_error() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        Self { id, status, output }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: Option<String>,
}

// Application state shared by every request.
#[derive(Clone)]
struct AppState {
    handler: Arc<JobHandler>,
    permits: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
}

async fn run_job_handler(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> impl IntoResponse {
    let id = req
        .id
        .unwrap_or_else(|| format!("local-{}", state.next_id.fetch_add(1, Ordering::Relaxed)));
    info!("Received job {id}");

    let permit = match state.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            error!("Worker is shutting down: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "worker is shutting down").into_response();
        }
    };
    let handler = state.handler.clone();
    let job = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        handler.handle(&req.input)
    })
    .await;

    match job {
        Ok(output) => Json(JobResponse::new(id, output)).into_response(),
        Err(e) => {
            error!("Job {id} did not complete: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        model: state.handler.resident_model(),
    })
}

/// Base64 source images easily exceed axum's default body limit.
fn router(handler: Arc<JobHandler>, concurrency: usize, max_body_bytes: usize) -> Router {
    let state = AppState {
        handler,
        permits: Arc::new(Semaphore::new(concurrency.max(1))),
        next_id: Arc::new(AtomicU64::new(1)),
    };

    Router::new()
        .route("/runsync", post(run_job_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn serve(handler: Arc<JobHandler>, args: &Args) -> Result<()> {
    // --- Build axum router with shared state ---
    let app = router(handler, args.concurrency, args.max_body_bytes);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started worker on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.worker_config();
    info!(
        "Starting worker: default model {}, models under {:?}, hub strategy {}",
        config.default_model(),
        config.acquire.model_root,
        config.acquire.hub_strategy
    );

    // The handler is blocking, so it is built and used outside the async runtime.
    let handler = Arc::new(JobHandler::new(config)?);

    if let Some(test_input) = &args.test_input {
        let job: Value = serde_json::from_str(test_input).context("--test-input is not JSON")?;
        let input = job.get("input").cloned().unwrap_or(job);
        let output = handler.handle(&input);
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if args.preload {
        if let Err(e) = handler.preload() {
            error!("Failed to preload {}: {e}", args.default_model);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(handler.clone(), &args))?;
    runtime.shutdown_timeout(Duration::from_secs(5));

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory;
    use serde_json::json;
    use tint_core::{Acquirer, DiffusersLoader};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    /// Handler whose model can never be acquired, so jobs fail fast.
    fn offline_handler(root: &std::path::Path) -> Arc<JobHandler> {
        let config = WorkerConfig {
            default_model: Some("org/model".into()),
            ..Default::default()
        };
        let acquirer = Acquirer::new(root, vec![], 1, Duration::ZERO);
        Arc::new(JobHandler::with_parts(
            config,
            acquirer,
            Arc::new(DiffusersLoader),
        ))
    }

    async fn post_raw(addr: std::net::SocketAddr, path: &str, body: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "POST {path} HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_jobs_reach_the_handler() {
        let temp = tempfile::tempdir().unwrap();
        let app = router(offline_handler(temp.path()), 1, 16 * 1024 * 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        // Bigger than axum's 2 MB default.
        let job = json!({
            "id": "big",
            "input": {"image": "A".repeat(3 * 1024 * 1024), "prompt": "p"}
        });
        let response = post_raw(addr, "/runsync", job.to_string().as_bytes()).await;

        assert!(response.starts_with("HTTP/1.1 200"), "{}", &response[..response.len().min(200)]);
        assert!(response.contains(r#""status":"FAILED""#));
        assert!(response.contains("org/model"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bodies_over_the_limit_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let app = router(offline_handler(temp.path()), 1, 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let job = json!({"input": {"image": "A".repeat(4096), "prompt": "p"}});
        let response = post_raw(addr, "/runsync", job.to_string().as_bytes()).await;

        assert!(response.starts_with("HTTP/1.1 413"));
    }

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_worker_config() {
        let args = Args::try_parse_from([
            "tint-worker",
            "--default-model",
            "org/model",
            "--hub-strategy",
            "clone",
            "--no-hub-fallback",
            "--attention-slice-size",
            "0",
            "--cpu",
            "--hub-cache",
            "/tmp/hf",
        ])
        .unwrap();
        let config = args.worker_config();

        assert_eq!(config.default_model(), "org/model");
        assert_eq!(config.acquire.hub_strategy, HubStrategy::Clone);
        assert!(!config.acquire.hub_fallback);
        assert_eq!(config.runtime.attention_slice_size, None);
        assert_eq!(config.runtime.device_map, DeviceMap::from_cpu_flag(true));
        assert_eq!(config.runtime.hub_cache, PathBuf::from("/tmp/hf"));
        assert_eq!(config.acquire.hub_cache, config.runtime.hub_cache);
    }

    #[test]
    fn failed_outputs_mark_the_job_failed() {
        let failed = JobResponse::new(
            "job-1".into(),
            JobOutput::Failure {
                error: tint_core::ErrorPayload::Message("boom".into()),
            },
        );
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"id": "job-1", "status": "FAILED", "output": {"error": "boom"}})
        );

        let completed = JobResponse::new(
            "job-2".into(),
            JobOutput::Success {
                image: "data:image/png;base64,AA==".into(),
                prompt: "p".into(),
                processing_time: 1.0,
            },
        );
        assert_eq!(completed.status, JobStatus::Completed);
    }
}
