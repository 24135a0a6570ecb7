//! Per-job outcome reconciliation.
//!
//! A [`JobMonitor`] waits for a job's result over the realtime channel
//! and falls back to status polling when push delivery is unconfirmed.
//! Whichever path reaches a terminal state first wins; the other is torn
//! down and the caller gets exactly one of `on_complete` / `on_error`.
//!
//! ```text
//! Idle -> AwaitingPush -> Resolving ------------> ResolvedSuccess
//!              |                 \--------------> ResolvedFailure
//!              \-> Polling ---------------------> Resolved*
//! (any live phase) -- cancel --> Cancelled
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use singwithme_core::status::DEFAULT_FAILURE_MESSAGE;
use singwithme_core::{DeliveryConfig, JobError, JobId, JobStatus, StatusReport, TrackBundle};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::{HttpJobsApi, JobsApi};
use crate::channel::{ListenerHandle, RealtimeChannel};
use crate::client::WsConnector;
use crate::events::{ChannelEvent, EventCategory};
use crate::lock;
use crate::poller::{bundle_unavailable, FallbackPoller, PollEvent, PollHandle};
use crate::reconnect::ReconnectConfig;
use crate::registry::{JobHandlers, SubscriptionRegistry, SubscriptionToken};

/// Final result of a monitored job.
pub type Outcome = Result<TrackBundle, JobError>;

type ProgressFn = Arc<dyn Fn(JobStatus) + Send + Sync>;
type OutcomeFn = Box<dyn FnOnce(Outcome) + Send>;

/// Caller hooks for one monitored job.
pub struct MonitorCallbacks {
    on_progress: Option<ProgressFn>,
    on_outcome: OutcomeFn,
}

impl MonitorCallbacks {
    pub fn new<C, E>(on_complete: C, on_error: E) -> Self
    where
        C: FnOnce(TrackBundle) + Send + 'static,
        E: FnOnce(JobError) + Send + 'static,
    {
        Self::on_outcome(move |outcome| match outcome {
            Ok(bundle) => on_complete(bundle),
            Err(e) => on_error(e),
        })
    }

    /// Single hook receiving either outcome.
    pub fn on_outcome(f: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            on_progress: None,
            on_outcome: Box::new(f),
        }
    }

    /// Called for every non-terminal status, until the monitor settles.
    pub fn with_progress(mut self, f: impl Fn(JobStatus) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Push silence tolerated before switching to polling.
    pub fallback_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for MonitorConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            fallback_timeout: config.fallback_timeout,
            poll_interval: config.poll_interval,
            max_poll_attempts: config.max_poll_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Idle,
    AwaitingPush,
    Polling,
    /// A completion was claimed; the track bundle is being fetched.
    Resolving,
    ResolvedSuccess,
    ResolvedFailure,
    Cancelled,
}

impl MonitorPhase {
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::ResolvedSuccess | Self::ResolvedFailure | Self::Cancelled
        )
    }
}

/// Starts and tracks job monitors. Clones share the same monitors.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    channel: RealtimeChannel,
    registry: SubscriptionRegistry,
    poller: FallbackPoller,
    api: Arc<dyn JobsApi>,
    config: MonitorConfig,
    /// At most one live monitor per job.
    active: Mutex<HashMap<JobId, Arc<MonitorShared>>>,
}

/// Handle to one monitored job. Dropping it does not stop monitoring.
#[derive(Clone)]
pub struct JobMonitor {
    shared: Arc<MonitorShared>,
}

struct MonitorShared {
    job_id: JobId,
    tracker: Weak<TrackerInner>,
    fallback_timeout: Duration,
    /// Stops the fallback timer and any in-flight bundle fetch.
    shutdown: CancellationToken,
    /// Held while a progress callback runs; `settle` takes it before
    /// leaving a live phase so no progress call can follow the outcome.
    delivery: Mutex<()>,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    phase: MonitorPhase,
    on_progress: Option<ProgressFn>,
    on_outcome: Option<OutcomeFn>,
    resources: Resources,
}

/// Everything a live monitor holds on to.
#[derive(Default)]
struct Resources {
    push: Option<SubscriptionToken>,
    lifecycle: Vec<ListenerHandle>,
    timer: Option<CancellationToken>,
    poll: Option<PollHandle>,
}

impl Resources {
    fn release(self, registry: Option<&SubscriptionRegistry>) {
        if let Some(timer) = self.timer {
            timer.cancel();
        }
        if let Some(poll) = self.poll {
            poll.cancel();
        }
        for handle in &self.lifecycle {
            handle.remove();
        }
        if let (Some(token), Some(registry)) = (self.push, registry) {
            registry.deregister(&token);
        }
    }
}

impl JobTracker {
    pub fn new(channel: RealtimeChannel, api: Arc<dyn JobsApi>, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                registry: SubscriptionRegistry::new(channel.clone()),
                poller: FallbackPoller::new(Arc::clone(&api)),
                channel,
                api,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Tracker wired to the configured WebSocket and HTTP endpoints.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.realtime_url.clone()));
        let channel = RealtimeChannel::new(connector, ReconnectConfig::from(config));
        let api = Arc::new(HttpJobsApi::new(config.api_url.clone()));
        Self::new(channel, api, MonitorConfig::from(config))
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.inner.channel
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        lock(&self.inner.active).contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Begin monitoring `job_id`, cancelling any earlier monitor for the
    /// same job.
    pub fn start(&self, job_id: JobId, callbacks: MonitorCallbacks) -> JobMonitor {
        let shared = Arc::new(MonitorShared {
            job_id: job_id.clone(),
            tracker: Arc::downgrade(&self.inner),
            fallback_timeout: self.inner.config.fallback_timeout,
            shutdown: CancellationToken::new(),
            delivery: Mutex::new(()),
            state: Mutex::new(MonitorState {
                phase: MonitorPhase::Idle,
                on_progress: callbacks.on_progress,
                on_outcome: Some(callbacks.on_outcome),
                resources: Resources::default(),
            }),
        });

        let previous = lock(&self.inner.active).insert(job_id.clone(), Arc::clone(&shared));
        if let Some(previous) = previous {
            tracing::info!(job_id = %job_id, "Superseding existing monitor");
            previous.cancel();
        }

        self.inner.channel.connect();
        lock(&shared.state).phase = MonitorPhase::AwaitingPush;

        let weak = Arc::downgrade(&shared);
        let handlers = JobHandlers::new()
            .on_status(forward(&weak, MonitorShared::on_push_status))
            .on_complete(forward(&weak, MonitorShared::on_push_complete))
            .on_error(forward(&weak, MonitorShared::on_push_error));
        let push = self.inner.registry.register(&job_id, handlers);
        let lifecycle = [EventCategory::Disconnect, EventCategory::ConnectionError]
            .into_iter()
            .map(|category| {
                self.inner
                    .channel
                    .add_event_listener(category, forward(&weak, MonitorShared::on_connection_lost))
            })
            .collect();
        shared.attach_push(push, lifecycle, &self.inner.registry);
        shared.arm_fallback();

        tracing::info!(job_id = %job_id, "Monitoring job");
        JobMonitor { shared }
    }

    /// Monitor `job_id` and wait for its outcome.
    ///
    /// Returns `None` if the monitor is cancelled or superseded first.
    /// Dropping the future cancels the monitor.
    pub async fn watch(&self, job_id: JobId) -> Option<Outcome> {
        self.watch_with_progress(job_id, |_| {}).await
    }

    pub async fn watch_with_progress(
        &self,
        job_id: JobId,
        on_progress: impl Fn(JobStatus) + Send + Sync + 'static,
    ) -> Option<Outcome> {
        let (tx, rx) = oneshot::channel();
        let callbacks = MonitorCallbacks::on_outcome(move |outcome| {
            let _ = tx.send(outcome);
        })
        .with_progress(on_progress);

        let monitor = self.start(job_id, callbacks);
        let _guard = CancelOnDrop(&monitor);
        rx.await.ok()
    }
}

struct CancelOnDrop<'a>(&'a JobMonitor);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        let monitors: Vec<_> = lock(&self.active).drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.abandon(&self.registry);
        }
    }
}

impl TrackerInner {
    /// Drop `monitor` from the active table unless it was already
    /// replaced.
    fn forget(&self, monitor: &Arc<MonitorShared>) {
        let mut active = lock(&self.active);
        if active
            .get(&monitor.job_id)
            .is_some_and(|current| Arc::ptr_eq(current, monitor))
        {
            active.remove(&monitor.job_id);
        }
    }
}

impl JobMonitor {
    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    pub fn phase(&self) -> MonitorPhase {
        lock(&self.shared.state).phase
    }

    pub fn is_settled(&self) -> bool {
        self.phase().is_settled()
    }

    /// Stop monitoring. No callback runs afterwards, including one whose
    /// result is already in flight. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// Listener that forwards to the monitor while it is still alive.
fn forward(
    weak: &Weak<MonitorShared>,
    f: fn(&Arc<MonitorShared>, &ChannelEvent),
) -> impl Fn(&ChannelEvent) + Send + Sync + 'static {
    let weak = weak.clone();
    move |event: &ChannelEvent| {
        if let Some(monitor) = weak.upgrade() {
            f(&monitor, event);
        }
    }
}

impl MonitorShared {
    /// Store push-side resources, or release them straight away if the
    /// monitor has already moved on.
    fn attach_push(
        &self,
        push: SubscriptionToken,
        lifecycle: Vec<ListenerHandle>,
        registry: &SubscriptionRegistry,
    ) {
        let leftover = {
            let mut state = lock(&self.state);
            match state.phase {
                MonitorPhase::AwaitingPush | MonitorPhase::Resolving => {
                    state.resources.push = Some(push);
                    state.resources.lifecycle = lifecycle;
                    None
                }
                _ => Some(Resources {
                    push: Some(push),
                    lifecycle,
                    ..Resources::default()
                }),
            }
        };
        if let Some(resources) = leftover {
            resources.release(Some(registry));
        }
    }

    /// (Re)start the fallback timer. Any earlier timer is disarmed.
    /// Returns `false` if the monitor is no longer awaiting push.
    fn arm_fallback(self: &Arc<Self>) -> bool {
        let timer = self.shutdown.child_token();
        let previous = {
            let mut state = lock(&self.state);
            if state.phase != MonitorPhase::AwaitingPush {
                return false;
            }
            state.resources.timer.replace(timer.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        let timeout = self.fallback_timeout;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(monitor) = weak.upgrade() {
                        tracing::info!(
                            job_id = %monitor.job_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Push delivery silent, falling back to polling",
                        );
                        monitor.switch_to_polling();
                    }
                }
            }
        });
        true
    }

    /// Claim a terminal push event, disarming the fallback timer. Returns
    /// `false` if the monitor was not awaiting push.
    fn claim_push(&self) -> bool {
        let timer = {
            let mut state = lock(&self.state);
            if state.phase != MonitorPhase::AwaitingPush {
                return false;
            }
            state.resources.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        true
    }

    fn on_push_status(self: &Arc<Self>, event: &ChannelEvent) {
        let status = StatusReport::from_json(&event.payload).normalize();
        tracing::debug!(job_id = %self.job_id, ?status, "Pushed status update");

        match status {
            JobStatus::Completed => self.on_push_complete(event),
            JobStatus::Failed { error } => {
                if self.claim_push() {
                    self.settle(Err(JobError::Server(error)));
                }
            }
            other => {
                // The timeout measures push silence.
                self.report_progress(other, MonitorPhase::AwaitingPush);
                self.arm_fallback();
            }
        }
    }

    fn on_push_complete(self: &Arc<Self>, _event: &ChannelEvent) {
        if !self.claim_push() {
            return;
        }
        {
            let mut state = lock(&self.state);
            if state.phase != MonitorPhase::AwaitingPush {
                return;
            }
            state.phase = MonitorPhase::Resolving;
        }
        tracing::info!(job_id = %self.job_id, "Job completed, fetching track bundle");
        self.fetch_bundle();
    }

    fn on_push_error(self: &Arc<Self>, event: &ChannelEvent) {
        if !self.claim_push() {
            return;
        }
        let message = event.error_message().unwrap_or(DEFAULT_FAILURE_MESSAGE);
        tracing::warn!(job_id = %self.job_id, error = %message, "Job failed on server");
        self.settle(Err(JobError::Server(message.to_string())));
    }

    fn on_connection_lost(self: &Arc<Self>, event: &ChannelEvent) {
        if lock(&self.state).phase != MonitorPhase::AwaitingPush {
            return;
        }
        tracing::warn!(
            job_id = %self.job_id,
            event = %event.category,
            "Realtime channel unavailable, falling back to polling",
        );
        self.switch_to_polling();
    }

    fn report_progress(&self, status: JobStatus, expected: MonitorPhase) {
        let _delivery = lock(&self.delivery);
        let on_progress = {
            let state = lock(&self.state);
            if state.phase != expected {
                return;
            }
            state.on_progress.clone()
        };
        if let Some(on_progress) = on_progress {
            on_progress(status);
        }
    }

    /// Hand the job over to the poller for good.
    fn switch_to_polling(self: &Arc<Self>) {
        let Some(tracker) = self.tracker.upgrade() else {
            return;
        };
        let push_side = {
            let mut state = lock(&self.state);
            if state.phase != MonitorPhase::AwaitingPush {
                return;
            }
            state.phase = MonitorPhase::Polling;
            Resources {
                push: state.resources.push.take(),
                lifecycle: std::mem::take(&mut state.resources.lifecycle),
                timer: state.resources.timer.take(),
                poll: None,
            }
        };
        push_side.release(Some(&tracker.registry));

        let weak = Arc::downgrade(self);
        let handle = tracker.poller.start_polling(
            self.job_id.clone(),
            tracker.config.poll_interval,
            tracker.config.max_poll_attempts,
            move |event| {
                if let Some(monitor) = weak.upgrade() {
                    monitor.on_poll_event(event);
                }
            },
        );

        let mut state = lock(&self.state);
        if state.phase == MonitorPhase::Polling {
            state.resources.poll = Some(handle);
        }
        // Otherwise the handle drops here, which stops the run.
    }

    fn on_poll_event(self: &Arc<Self>, event: PollEvent) {
        match event {
            PollEvent::Progress(status) => self.report_progress(status, MonitorPhase::Polling),
            PollEvent::Completed(bundle) => self.settle(Ok(bundle)),
            PollEvent::Failed(e) => self.settle(Err(e)),
        }
    }

    /// Fetch the bundle for a pushed completion; exactly one request.
    fn fetch_bundle(self: &Arc<Self>) {
        let Some(tracker) = self.tracker.upgrade() else {
            return;
        };
        let api = Arc::clone(&tracker.api);
        let cancel = self.shutdown.clone();
        let weak = Arc::downgrade(self);
        let job_id = self.job_id.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = api.fetch_tracks(&job_id) => result,
            };
            let Some(monitor) = weak.upgrade() else {
                return;
            };
            monitor.settle(result.map_err(|e| bundle_unavailable(&job_id, &e)));
        });
    }

    /// Deliver the terminal outcome. Only the first call has any effect.
    fn settle(self: &Arc<Self>, outcome: Outcome) {
        let (resources, on_outcome) = {
            let _delivery = lock(&self.delivery);
            let mut state = lock(&self.state);
            if state.phase.is_settled() || state.phase == MonitorPhase::Idle {
                return;
            }
            state.phase = match outcome {
                Ok(_) => MonitorPhase::ResolvedSuccess,
                Err(_) => MonitorPhase::ResolvedFailure,
            };
            state.on_progress = None;
            (
                std::mem::take(&mut state.resources),
                state.on_outcome.take(),
            )
        };

        match &outcome {
            Ok(_) => tracing::info!(job_id = %self.job_id, "Job resolved"),
            Err(e) => tracing::warn!(job_id = %self.job_id, error = %e, "Job resolved with error"),
        }

        self.teardown(resources);
        if let Some(on_outcome) = on_outcome {
            on_outcome(outcome);
        }
    }

    fn cancel(self: &Arc<Self>) {
        let resources = {
            let mut state = lock(&self.state);
            if state.phase.is_settled() {
                return;
            }
            state.phase = MonitorPhase::Cancelled;
            state.on_progress = None;
            state.on_outcome = None;
            std::mem::take(&mut state.resources)
        };
        tracing::info!(job_id = %self.job_id, "Monitor cancelled");
        self.teardown(resources);
    }

    /// Cancel on behalf of a tracker that is being dropped and can no
    /// longer be reached through `self.tracker`.
    fn abandon(&self, registry: &SubscriptionRegistry) {
        let resources = {
            let mut state = lock(&self.state);
            if state.phase.is_settled() {
                return;
            }
            state.phase = MonitorPhase::Cancelled;
            state.on_progress = None;
            state.on_outcome = None;
            std::mem::take(&mut state.resources)
        };
        tracing::info!(job_id = %self.job_id, "Tracker dropped, monitor cancelled");
        self.shutdown.cancel();
        resources.release(Some(registry));
    }

    fn teardown(self: &Arc<Self>, resources: Resources) {
        self.shutdown.cancel();
        let tracker = self.tracker.upgrade();
        resources.release(tracker.as_ref().map(|t| &t.registry));
        if let Some(tracker) = tracker {
            tracker.forget(self);
        }
    }
}
