//! CLI command execution.
//!
//! `serve` runs the service in-process. Job commands are a thin client
//! that talks to a running server over HTTP; `purge` and `requeue-failed`
//! open the database directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::db::{JobStore, MemoryStore, SqliteStore};
use crate::models::{Job, LogLine, TranscodeRequest, VideoFormat};
use crate::scheduler::Scheduler;
use crate::server::{self, ServerState};
use crate::transcoder::{ffmpeg_available, FfmpegTranscoder};

use super::args::{Cli, Commands, ServeArgs};

pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(cli.port, args).await,
        Commands::Purge { days, db } => purge(days, db),
        Commands::RequeueFailed { db } => requeue_failed(db),
        command => run_client(cli.port, command).await,
    }
}

async fn run_client(port: Option<u16>, command: Commands) -> Result<()> {
    let client = ApiClient::new(resolve_port(port)?);
    match command {
        Commands::Submit {
            input,
            output,
            format,
            resolution,
            priority,
        } => {
            let request = TranscodeRequest {
                input_path: absolute(input)?.to_string_lossy().into_owned(),
                output_path: absolute(output)?.to_string_lossy().into_owned(),
                format,
                resolution,
                priority: Some(priority),
            };
            let job: Job = client.send_json(Method::POST, "/transcode", Some(&request)).await?;
            println!("Submitted job {}", job.id);
            print_job(&job);
        }
        Commands::Status { id } => {
            let job: Job = client.get(&format!("/transcode/status/{id}")).await?;
            print_job(&job);
        }
        Commands::Jobs { queued } => {
            let path = if queued { "/transcode/queue" } else { "/transcode/jobs" };
            let jobs: Vec<Job> = client.get(path).await?;
            print_jobs(&jobs, queued);
        }
        Commands::Cancel { id } => {
            client
                .send(Method::DELETE, &format!("/transcode/cancel/{id}"))
                .await?;
            println!("Cancelled job {id}");
        }
        Commands::Pause { id } => {
            let job: Job = client.post(&format!("/transcode/pause/{id}")).await?;
            println!("Job {} is {}", job.id, job.status);
        }
        Commands::Resume { id } => {
            let job: Job = client.post(&format!("/transcode/resume/{id}")).await?;
            println!("Job {} is {}", job.id, job.status);
        }
        Commands::Retry { id } => {
            let job: Job = client.post(&format!("/transcode/resubmit/{id}")).await?;
            println!("Requeued job {} (priority {})", job.id, job.priority);
        }
        Commands::RetryFailed => {
            #[derive(Deserialize)]
            struct Requeued {
                requeued: usize,
            }
            let result: Requeued = client.post("/transcode/resubmit-failed").await?;
            println!("Requeued {} failed job(s)", result.requeued);
        }
        Commands::Priority { id, priority } => {
            let job: Job = client
                .send_json::<(), _>(
                    Method::PATCH,
                    &format!("/transcode/priority/{id}/{priority}"),
                    None,
                )
                .await?;
            println!("Job {} now has priority {}", job.id, job.priority);
        }
        Commands::Logs { id } => {
            let logs: Vec<LogLine> = client.get(&format!("/transcode/logs/{id}")).await?;
            if logs.is_empty() {
                println!("No log lines for job {id}.");
            }
            for log in logs {
                println!("{} {}", log.at.format("%Y-%m-%d %H:%M:%S%.3f"), log.line);
            }
        }
        Commands::Formats => {
            let formats: Vec<VideoFormat> = client.get("/transcode/formats").await?;
            for format in formats {
                println!("{format}");
            }
        }
        Commands::Health => {
            let health: serde_json::Value = client.get("/health").await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Serve(_) | Commands::Purge { .. } | Commands::RequeueFailed { .. } => {
            bail!("not a client command")
        }
    }
    Ok(())
}

/// Run the service until Ctrl+C.
async fn serve(port: Option<u16>, args: ServeArgs) -> Result<()> {
    let mut config = ServiceConfig::from_env()?;
    apply_serve_args(&mut config, port, args);
    config.validate()?;

    let store: Arc<dyn JobStore> = if config.ephemeral {
        info!("Using in-memory job store");
        Arc::new(MemoryStore::new())
    } else {
        let path = database_path(config.db_path.clone())?;
        info!(path = %path.display(), "Opening job database");
        Arc::new(SqliteStore::open_at(&path)?)
    };

    if !ffmpeg_available(&config.ffmpeg_path) {
        warn!(program = %config.ffmpeg_path, "FFmpeg not found on PATH; jobs will fail until it is installed");
    }
    let transcoder =
        FfmpegTranscoder::new(config.ffmpeg_path.clone()).with_timeout(config.job_timeout);

    let scheduler = Scheduler::new(config.scheduler_config(), store, Arc::new(transcoder));
    let pool = scheduler.start();
    info!(
        transcoder = scheduler.transcoder_name(),
        workers = pool.size(),
        queue_capacity = scheduler.config().queue_capacity,
        policy = scheduler.config().policy.as_str(),
        "Scheduler running"
    );

    let recovering = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = recovering.recover().await {
            warn!("Recovery failed: {e}");
        }
    });

    let retention = chrono::Duration::days(i64::from(config.retention_days));
    let maintenance = scheduler.spawn_maintenance(config.maintenance_interval, retention);

    let state = Arc::new(ServerState {
        scheduler,
        ffmpeg_program: config.ffmpeg_path.clone(),
    });
    let served = server::start_server(state, config.port, server::shutdown_signal()).await;

    maintenance.abort();
    pool.shutdown(config.shutdown_grace).await;
    served
}

fn apply_serve_args(config: &mut ServiceConfig, port: Option<u16>, args: ServeArgs) {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue_capacity = capacity;
    }
    if let Some(policy) = args.policy {
        config.enqueue_policy = policy.into();
    }
    if let Some(ffmpeg) = args.ffmpeg {
        config.ffmpeg_path = ffmpeg;
    }
    if let Some(secs) = args.job_timeout {
        config.job_timeout = (secs > 0).then(|| std::time::Duration::from_secs(secs));
    }
    if args.db.is_some() {
        config.db_path = args.db;
    }
    config.ephemeral |= args.ephemeral;
}

fn database_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => match ServiceConfig::from_env()?.db_path {
            Some(path) => Ok(path),
            None => SqliteStore::default_path(),
        },
    }
}

fn purge(days: u32, db: Option<PathBuf>) -> Result<()> {
    if days == 0 {
        bail!("--days must be at least 1");
    }
    let path = database_path(db)?;
    let store = SqliteStore::open_at(&path)?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let purged = store.purge_completed_before(cutoff)?;
    println!("Purged {purged} completed job(s) older than {days} day(s)");
    Ok(())
}

fn requeue_failed(db: Option<PathBuf>) -> Result<()> {
    let path = database_path(db)?;
    let store = SqliteStore::open_at(&path)?;
    let reset = store.reset_failed_to_queued()?;
    println!("Marked {reset} failed job(s) as queued; they run on the next `vidq serve`");
    Ok(())
}

/// Explicit flag, then the running server, then configuration.
fn resolve_port(explicit: Option<u16>) -> Result<u16> {
    if let Some(port) = explicit {
        return Ok(port);
    }
    if let Some(port) = server::get_server_port() {
        return Ok(port);
    }
    Ok(ServiceConfig::from_env()?.port)
}

/// The server resolves paths itself, so send them absolute.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

impl ApiClient {
    fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{port}"),
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json::<(), T>(Method::GET, path, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json::<(), T>(Method::POST, path, None).await
    }

    async fn send(&self, method: Method, path: &str) -> Result<Response> {
        let resp = self
            .http
            .request(method, format!("{}{path}", self.base))
            .send()
            .await
            .with_context(|| format!("Failed to reach vidq server at {}", self.base))?;
        check(resp).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.request(method, format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to reach vidq server at {}", self.base))?;
        check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("Server returned {status}: {}", body.detail),
        Err(_) => bail!("Server returned {status}"),
    }
}

fn print_job(job: &Job) {
    println!("ID:         {}", job.id);
    println!("Status:     {}", job.status);
    println!("Progress:   {}%", job.progress);
    println!("Priority:   {}", job.priority);
    println!("Input:      {}", job.spec.input_path.display());
    println!("Output:     {}", job.spec.output_path.display());
    println!("Target:     {} {}", job.spec.format, job.spec.resolution);
    println!("Attempts:   {}", job.attempts);
    println!("Created:    {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("Started:    {}", started.to_rfc3339());
    }
    if let Some(finished) = job.finished_at {
        println!("Finished:   {}", finished.to_rfc3339());
    }
    if let Some(error) = &job.error_message {
        println!("Error:      {error}");
    }
}

fn print_jobs(jobs: &[Job], queued: bool) {
    if jobs.is_empty() {
        println!("{}", if queued { "No queued jobs." } else { "No running jobs." });
        return;
    }

    println!(
        "{:<10} {:<10} {:>8} {:>9} {:<6} {:<6}",
        "ID", "STATUS", "PRIORITY", "PROGRESS", "FORMAT", "RES"
    );
    println!("{}", "-".repeat(56));
    for job in jobs {
        println!(
            "{:<10} {:<10} {:>8} {:>8}% {:<6} {:<6}",
            &job.id[..8.min(job.id.len())],
            job.status,
            job.priority,
            job.progress,
            job.spec.format,
            job.spec.resolution,
        );
    }
}
