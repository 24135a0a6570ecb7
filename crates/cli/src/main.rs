//! `singwithme` -- upload a song and wait for its separated stems.
//!
//! ```text
//! singwithme <audio-file>     upload the file, then wait for the job
//! singwithme --job <job-id>   wait for an existing job
//! ```
//!
//! Prints the resulting track bundle as JSON on stdout. Progress and
//! delivery details go to the log (`RUST_LOG`, default
//! `singwithme=info`).
//!
//! # Environment variables
//!
//! | Variable                 | Default       | Description                          |
//! |--------------------------|---------------|--------------------------------------|
//! | `APP_ENV`                | `development` | `development`, `staging`, `production` |
//! | `API_URL`                | per env       | HTTP API base                        |
//! | `REALTIME_URL`           | per env       | Realtime WebSocket endpoint          |
//! | `FALLBACK_TIMEOUT_SECS`  | `10`          | Push silence before polling          |
//! | `POLL_INTERVAL_SECS`     | `2`           | Seconds between status polls         |
//! | `MAX_POLL_ATTEMPTS`      | `30`          | Status polls before giving up        |

use std::path::PathBuf;

use anyhow::{bail, Context};
use singwithme_client::{HttpJobsApi, JobTracker};
use singwithme_core::{DeliveryConfig, JobId, JobStatus};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Target {
    Upload(PathBuf),
    Existing(JobId),
}

fn parse_args() -> anyhow::Result<Target> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [flag, id] if flag == "--job" => Ok(Target::Existing(JobId::from(id.as_str()))),
        [path] if !path.starts_with('-') => Ok(Target::Upload(PathBuf::from(path))),
        _ => bail!("usage: singwithme <audio-file> | singwithme --job <job-id>"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "singwithme=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let target = parse_args()?;
    let config = DeliveryConfig::from_env().context("invalid delivery configuration")?;

    tracing::info!(
        environment = ?config.environment,
        api_url = %config.api_url,
        realtime_url = %config.realtime_url,
        "Starting singwithme",
    );

    let job_id = match target {
        Target::Existing(job_id) => job_id,
        Target::Upload(path) => {
            let api = HttpJobsApi::new(config.api_url.clone());
            let job_id = api
                .upload_audio(&path)
                .await
                .with_context(|| format!("failed to upload {}", path.display()))?;
            tracing::info!(job_id = %job_id, file = %path.display(), "Upload accepted");
            job_id
        }
    };

    let tracker = JobTracker::from_config(&config);
    let outcome = tokio::select! {
        outcome = tracker.watch_with_progress(job_id.clone(), log_progress) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(job_id = %job_id, "Interrupted, stopping monitor");
            None
        }
    };
    tracker.channel().disconnect();

    let bundle = match outcome {
        Some(Ok(bundle)) => bundle,
        Some(Err(e)) => return Err(e).with_context(|| format!("job {job_id} did not complete")),
        None => bail!("monitoring of job {job_id} was cancelled"),
    };

    tracing::info!(
        job_id = %job_id,
        lyric_lines = bundle.lyrics.len(),
        "Tracks ready",
    );
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

fn log_progress(status: JobStatus) {
    match status {
        JobStatus::Queued => tracing::info!("Job queued"),
        other => tracing::info!(progress = %format!("{:.0}%", other.progress() * 100.0), "Processing"),
    }
}
