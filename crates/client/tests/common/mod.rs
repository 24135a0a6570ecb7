#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use singwithme_client::messages::RawFrame;
use singwithme_client::{
    ApiError, ConnectError, Connection, Connector, JobTracker, JobsApi, MonitorCallbacks,
    MonitorConfig, Outcome, RealtimeChannel, ReconnectConfig,
};
use singwithme_core::{JobId, JobStatus, LyricLine, StatusReport, TrackBundle};

// ---------------------------------------------------------------------------
// Fake realtime endpoint
// ---------------------------------------------------------------------------

/// How the fake connector answers one handshake.
#[derive(Debug, Clone, Copy)]
pub enum Handshake {
    Accept,
    Refuse,
    Hang,
}

/// Connector that follows a script of handshake answers (accepting once
/// the script is used up) and hands the server end of every accepted
/// connection to the test.
pub struct FakeConnector {
    script: Mutex<VecDeque<Handshake>>,
    fallback: Handshake,
    servers: mpsc::UnboundedSender<FakeServer>,
    pub attempts: AtomicU32,
}

impl FakeConnector {
    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        Self::scripted([], Handshake::Accept)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        Self::scripted([], Handshake::Refuse)
    }

    pub fn scripted(
        script: impl IntoIterator<Item = Handshake>,
        fallback: Handshake,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            servers,
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Connection, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let answer = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match answer {
            Handshake::Accept => {
                let (outbound, sent) = mpsc::unbounded_channel();
                let (push, inbound) = mpsc::unbounded_channel();
                let _ = self.servers.send(FakeServer { sent, push });
                Ok(Connection { outbound, inbound })
            }
            Handshake::Refuse => Err(ConnectError::Connection("connection refused".into())),
            Handshake::Hang => std::future::pending().await,
        }
    }
}

/// Server side of one accepted fake connection.
pub struct FakeServer {
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<RawFrame>,
}

impl FakeServer {
    pub fn push(&self, record: Value) {
        let _ = self.push.send(RawFrame::Text(record.to_string()));
    }

    pub fn push_raw(&self, frame: RawFrame) {
        let _ = self.push.send(frame);
    }

    /// Control messages the client sent so far, decoded.
    pub fn received(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    /// `(type, jobId)` pairs of the control messages received so far.
    pub fn control_log(&mut self) -> Vec<(String, String)> {
        self.received()
            .into_iter()
            .map(|m| {
                (
                    m["type"].as_str().unwrap().to_string(),
                    m["jobId"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    /// Drop the connection from the server side.
    pub fn hang_up(self) {}
}

// ---------------------------------------------------------------------------
// Fake HTTP API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StatusReply {
    Report(Value),
    Unavailable,
}

impl StatusReply {
    pub fn processing(progress: u32) -> Self {
        Self::Report(json!({ "status": "processing", "progress": progress }))
    }

    pub fn completed() -> Self {
        Self::Report(json!({ "status": "completed", "progress": 100 }))
    }

    pub fn failed(error: &str) -> Self {
        Self::Report(json!({ "status": "failed", "error": error }))
    }
}

/// Scripted [`JobsApi`]. Status replies are consumed in order; the last
/// one repeats once the script runs out.
pub struct FakeApi {
    statuses: Mutex<VecDeque<StatusReply>>,
    last_status: Mutex<StatusReply>,
    tracks: Mutex<Option<TrackBundle>>,
    tracks_delay: Mutex<Duration>,
    started: Instant,
    status_times: Mutex<Vec<Duration>>,
    pub status_calls: AtomicU32,
    pub tracks_calls: AtomicU32,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(VecDeque::new()),
            last_status: Mutex::new(StatusReply::processing(0)),
            tracks: Mutex::new(Some(sample_bundle())),
            tracks_delay: Mutex::new(Duration::ZERO),
            started: Instant::now(),
            status_times: Mutex::new(Vec::new()),
            status_calls: AtomicU32::new(0),
            tracks_calls: AtomicU32::new(0),
        })
    }

    pub fn script_statuses(&self, replies: impl IntoIterator<Item = StatusReply>) {
        self.statuses.lock().unwrap().extend(replies);
    }

    pub fn without_tracks(&self) {
        *self.tracks.lock().unwrap() = None;
    }

    pub fn delay_tracks(&self, delay: Duration) {
        *self.tracks_delay.lock().unwrap() = delay;
    }

    /// When each status request arrived, relative to construction.
    pub fn status_times(&self) -> Vec<Duration> {
        self.status_times.lock().unwrap().clone()
    }

    pub fn status_count(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn tracks_count(&self) -> u32 {
        self.tracks_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobsApi for FakeApi {
    async fn fetch_status(&self, _job_id: &JobId) -> Result<StatusReport, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status_times
            .lock()
            .unwrap()
            .push(self.started.elapsed());

        let reply = {
            let next = self.statuses.lock().unwrap().pop_front();
            let mut last = self.last_status.lock().unwrap();
            if let Some(next) = next {
                *last = next;
            }
            last.clone()
        };

        match reply {
            StatusReply::Report(body) => Ok(StatusReport::from_json(&body)),
            StatusReply::Unavailable => Err(ApiError::Status {
                status: 503,
                body: "service unavailable".into(),
            }),
        }
    }

    async fn fetch_tracks(&self, _job_id: &JobId) -> Result<TrackBundle, ApiError> {
        self.tracks_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.tracks_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.tracks
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: "tracks not found".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Builders and helpers
// ---------------------------------------------------------------------------

pub fn sample_bundle() -> TrackBundle {
    TrackBundle {
        vocal_url: "https://cdn.example.com/abc123/vocals.mp3".into(),
        instrumental_url: "https://cdn.example.com/abc123/instrumental.mp3".into(),
        lyrics: vec![
            LyricLine {
                start_time: 0.5,
                text: "First line".into(),
            },
            LyricLine {
                start_time: 4.0,
                text: "Second line".into(),
            },
        ],
    }
}

/// Two quick handshake attempts, one second apart.
pub fn reconnect_config() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 2,
        delay: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(5),
    }
}

pub fn channel(connector: Arc<FakeConnector>) -> RealtimeChannel {
    RealtimeChannel::new(connector, reconnect_config())
}

pub fn tracker(connector: Arc<FakeConnector>, api: Arc<FakeApi>) -> JobTracker {
    tracker_with(connector, api, MonitorConfig::default())
}

pub fn tracker_with(
    connector: Arc<FakeConnector>,
    api: Arc<FakeApi>,
    config: MonitorConfig,
) -> JobTracker {
    JobTracker::new(channel(connector), api, config)
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn job(id: &str) -> JobId {
    JobId::from(id)
}

/// Collects everything a monitor reports.
#[derive(Clone, Default)]
pub struct Recorder {
    pub outcomes: Arc<Mutex<Vec<Outcome>>>,
    pub progress: Arc<Mutex<Vec<JobStatus>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> MonitorCallbacks {
        let outcomes = Arc::clone(&self.outcomes);
        let progress = Arc::clone(&self.progress);
        MonitorCallbacks::on_outcome(move |outcome| outcomes.lock().unwrap().push(outcome))
            .with_progress(move |status| progress.lock().unwrap().push(status))
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<JobStatus> {
        self.progress.lock().unwrap().clone()
    }
}
