//! Fallback status polling.
//!
//! When push delivery is unconfirmed, [`FallbackPoller::start_polling`]
//! asks the status endpoint on a fixed interval until the job reaches a
//! terminal state or the attempt budget runs out. A completed job costs
//! exactly one extra request to fetch its [`TrackBundle`].

use std::sync::Arc;
use std::time::Duration;

use singwithme_core::{JobError, JobId, JobStatus, TrackBundle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, JobsApi};

/// `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What a polling run reports to its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A non-terminal status was observed.
    Progress(JobStatus),
    Completed(TrackBundle),
    Failed(JobError),
}

/// Pulls job status over HTTP when push delivery cannot be relied on.
pub struct FallbackPoller {
    api: Arc<dyn JobsApi>,
}

/// Cancellation handle for a polling run. Dropping it also stops the run.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl PollHandle {
    /// Stop polling. No event is delivered to the sink afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl FallbackPoller {
    pub fn new(api: Arc<dyn JobsApi>) -> Self {
        Self { api }
    }

    /// One status request, normalized.
    pub async fn poll_once(&self, job_id: &JobId) -> Result<JobStatus, ApiError> {
        let report = self.api.fetch_status(job_id).await?;
        Ok(report.normalize())
    }

    /// Poll every `interval` (first request one interval from now) until
    /// a terminal status or `max_attempts` requests.
    ///
    /// `sink` receives progress for non-terminal statuses and exactly one
    /// final `Completed` or `Failed` event, unless the run is cancelled
    /// first.
    pub fn start_polling<F>(
        &self,
        job_id: JobId,
        interval: Duration,
        max_attempts: u32,
        sink: F,
    ) -> PollHandle
    where
        F: Fn(PollEvent) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let run = PollRun {
            api: Arc::clone(&self.api),
            job_id,
            interval: interval.max(MIN_INTERVAL),
            max_attempts: max_attempts.max(1),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(async move {
            run.execute(&sink).await;
        });

        PollHandle { cancel, task }
    }
}

/// Outcome for a completed job whose track bundle could not be fetched.
pub(crate) fn bundle_unavailable(job_id: &JobId, err: &ApiError) -> JobError {
    tracing::error!(job_id = %job_id, error = %err, "Completed job has no usable track bundle");
    JobError::Protocol(format!("track bundle unavailable: {err}"))
}

struct PollRun {
    api: Arc<dyn JobsApi>,
    job_id: JobId,
    interval: Duration,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl PollRun {
    async fn execute<F: Fn(PollEvent)>(&self, sink: &F) {
        let emit = |event: PollEvent| {
            if !self.cancel.is_cancelled() {
                sink(event);
            }
        };

        tracing::info!(
            job_id = %self.job_id,
            interval_ms = self.interval.as_millis() as u64,
            max_attempts = self.max_attempts,
            "Starting status polling",
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.api.fetch_status(&self.job_id) => result,
            };

            let status = match result {
                Ok(report) => report.normalize(),
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        attempt,
                        error = %e,
                        "Status poll failed",
                    );
                    if e.is_transport() {
                        failures += 1;
                    }
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            tracing::debug!(job_id = %self.job_id, attempt, ?status, "Polled job status");

            match status {
                JobStatus::Completed => {
                    let bundle = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return,
                        result = self.api.fetch_tracks(&self.job_id) => result,
                    };
                    emit(match bundle {
                        Ok(bundle) => PollEvent::Completed(bundle),
                        Err(e) => PollEvent::Failed(bundle_unavailable(&self.job_id, &e)),
                    });
                    return;
                }
                JobStatus::Failed { error } => {
                    tracing::warn!(job_id = %self.job_id, error = %error, "Job failed on server");
                    emit(PollEvent::Failed(JobError::Server(error)));
                    return;
                }
                other => emit(PollEvent::Progress(other)),
            }
        }

        let error = match last_error {
            Some(last) if failures == self.max_attempts => JobError::Network(last),
            _ => JobError::Timeout {
                attempts: self.max_attempts,
            },
        };
        tracing::warn!(job_id = %self.job_id, error = %error, "Status polling exhausted");
        emit(PollEvent::Failed(error));
    }
}
