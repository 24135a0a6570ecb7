//! The realtime job-events channel.
//!
//! [`RealtimeChannel`] owns at most one live connection to the backend's
//! realtime endpoint. A background task drives the connection (bounded
//! retry, read loop, reconnect after a drop) and fans every decoded
//! record out to the listeners registered for its [`EventCategory`].
//!
//! One instance is created per process and passed by handle to every
//! consumer; there is no global singleton. `connect` must be called from
//! within a tokio runtime.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::json;
use singwithme_core::JobId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{Connection, Connector};
use crate::events::{ChannelEvent, EventCategory};
use crate::lock;
use crate::messages::{decode_frame, ControlMessage, RawFrame};
use crate::reconnect::{connect_with_retry, ReconnectConfig, RetryOutcome};

/// Callback invoked for each event of a category.
pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Identifies one registration in the listener table.
pub type ListenerId = u64;

/// Where the channel is in its connect / retry / drop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared handle to the realtime connection. Clones refer to the same
/// connection and listener table.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    link: Mutex<LinkState>,
    listeners: Mutex<HashMap<EventCategory, Vec<(ListenerId, Listener)>>>,
    next_listener_id: AtomicU64,
}

struct LinkState {
    state: ConnectionState,
    /// Bumped on every connect/disconnect so a stale connection task
    /// cannot overwrite newer state.
    generation: u64,
    cancel: Option<CancellationToken>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Jobs subscribed on the current (or last) connection.
    subscribed: BTreeSet<JobId>,
    /// Jobs to subscribe as soon as a handshake succeeds.
    pending: BTreeSet<JobId>,
}

/// Deregistration handle returned by
/// [`RealtimeChannel::add_event_listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    category: EventCategory,
    id: ListenerId,
    channel: Weak<ChannelInner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn category(&self) -> &EventCategory {
        &self.category
    }

    /// Remove the listener. Safe to call repeatedly or after the channel
    /// has been dropped.
    pub fn remove(&self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove_listener(&self.category, self.id);
        }
    }
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn Connector>, reconnect: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                reconnect,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    cancel: None,
                    outbound: None,
                    subscribed: BTreeSet::new(),
                    pending: BTreeSet::new(),
                }),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start connecting unless a connection is already live or being
    /// established.
    ///
    /// Returns immediately; the outcome is reported through the
    /// `connect` and `error` lifecycle events.
    pub fn connect(&self) {
        let (generation, cancel) = {
            let mut link = lock(&self.inner.link);
            if link.state != ConnectionState::Disconnected {
                tracing::debug!(state = ?link.state, "Realtime channel already active");
                return;
            }
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            let cancel = CancellationToken::new();
            link.cancel = Some(cancel.clone());
            (link.generation, cancel)
        };

        tracing::info!(generation, "Opening realtime channel");
        tokio::spawn(run_connection(Arc::clone(&self.inner), generation, cancel));
    }

    /// Tear the connection down and clear all listeners and subscription
    /// bookkeeping. Listeners must be registered again after the next
    /// `connect`.
    ///
    /// If the channel was active, a `disconnect` lifecycle event is
    /// dispatched first, so listeners still learn that push delivery has
    /// stopped.
    pub fn disconnect(&self) {
        let (was, cancel) = {
            let mut link = lock(&self.inner.link);
            let was = link.state;
            link.state = ConnectionState::Disconnected;
            link.generation += 1;
            link.outbound = None;
            link.subscribed.clear();
            link.pending.clear();
            (was, link.cancel.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if was != ConnectionState::Disconnected {
            tracing::info!("Closing realtime channel");
            self.inner.dispatch(&ChannelEvent::lifecycle(
                EventCategory::Disconnect,
                json!({ "reason": "closed by client" }),
            ));
        }
        lock(&self.inner.listeners).clear();
    }

    /// Ask the server to push events for `job_id`.
    ///
    /// Returns `false` without sending when the channel is not connected.
    pub fn subscribe_to_job(&self, job_id: &JobId) -> bool {
        let mut link = lock(&self.inner.link);
        if !link.send_control(&ControlMessage::subscribe(job_id)) {
            tracing::debug!(job_id = %job_id, "Cannot subscribe, channel not connected");
            return false;
        }
        link.subscribed.insert(job_id.clone());
        tracing::debug!(job_id = %job_id, "Subscribed to job");
        true
    }

    /// Stop server pushes for `job_id`.
    ///
    /// Always forgets the job locally; returns `false` when the message
    /// could not be sent because the channel is not connected.
    pub fn unsubscribe_from_job(&self, job_id: &JobId) -> bool {
        let mut link = lock(&self.inner.link);
        link.subscribed.remove(job_id);
        link.pending.remove(job_id);
        if !link.send_control(&ControlMessage::unsubscribe(job_id)) {
            tracing::debug!(job_id = %job_id, "Cannot unsubscribe, channel not connected");
            return false;
        }
        tracing::debug!(job_id = %job_id, "Unsubscribed from job");
        true
    }

    /// Subscribe to `job_id` on the next successful handshake, or right
    /// away if the channel is connected by now.
    pub fn queue_subscription(&self, job_id: &JobId) {
        let mut link = lock(&self.inner.link);
        if link.send_control(&ControlMessage::subscribe(job_id)) {
            link.subscribed.insert(job_id.clone());
        } else {
            link.pending.insert(job_id.clone());
        }
    }

    pub fn add_event_listener<F>(&self, category: EventCategory, callback: F) -> ListenerHandle
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners)
            .entry(category.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        ListenerHandle {
            category,
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Returns whether a listener was removed.
    pub fn remove_event_listener(&self, category: &EventCategory, id: ListenerId) -> bool {
        self.inner.remove_listener(category, id)
    }

    pub fn listener_count(&self, category: &EventCategory) -> usize {
        lock(&self.inner.listeners)
            .get(category)
            .map_or(0, Vec::len)
    }
}

impl LinkState {
    fn send_control(&self, message: &ControlMessage) -> bool {
        match (&self.state, &self.outbound) {
            (ConnectionState::Connected, Some(tx)) => tx.send(message.to_text()).is_ok(),
            _ => false,
        }
    }
}

impl ChannelInner {
    fn remove_listener(&self, category: &EventCategory, id: ListenerId) -> bool {
        let mut table = lock(&self.listeners);
        let Some(entries) = table.get_mut(category) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            table.remove(category);
        }
        removed
    }

    fn is_registered(&self, category: &EventCategory, id: ListenerId) -> bool {
        lock(&self.listeners)
            .get(category)
            .is_some_and(|entries| entries.iter().any(|(entry_id, _)| *entry_id == id))
    }

    /// Deliver `event` to its category's listeners, then to wildcard
    /// listeners for server records.
    ///
    /// Works on a snapshot of the table taken without holding the lock
    /// during callbacks, so listeners may add or remove listeners
    /// (including themselves). A listener removed during dispatch is not
    /// invoked afterwards.
    fn dispatch(&self, event: &ChannelEvent) {
        let mut categories = vec![event.category.clone()];
        if !event.category.is_lifecycle() && event.category != EventCategory::Message {
            categories.push(EventCategory::Message);
        }

        let mut snapshot: Vec<(EventCategory, ListenerId, Listener)> = Vec::new();
        {
            let table = lock(&self.listeners);
            for category in categories {
                if let Some(entries) = table.get(&category) {
                    snapshot.extend(
                        entries
                            .iter()
                            .map(|(id, listener)| (category.clone(), *id, Arc::clone(listener))),
                    );
                }
            }
        }

        for (category, id, listener) in snapshot {
            if !self.is_registered(&category, id) {
                continue;
            }
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(panic) = result {
                tracing::error!(
                    event = %event.category,
                    listener_id = id,
                    panic = panic_message(panic.as_ref()),
                    "Realtime listener panicked",
                );
            }
        }
    }

    fn handle_frame(&self, frame: &RawFrame) {
        match decode_frame(frame) {
            Ok(event) => {
                tracing::debug!(
                    event = %event.category,
                    job_id = ?event.job_id,
                    "Received realtime event",
                );
                self.dispatch(&event);
            }
            Err(e) => {
                let raw_message = match frame {
                    RawFrame::Text(text) => text.clone(),
                    RawFrame::Binary(bytes) => format!("<{} binary bytes>", bytes.len()),
                };
                tracing::warn!(error = %e, raw_message = %raw_message, "Dropping undecodable realtime frame");
            }
        }
    }

    /// Record a successful handshake and flush queued subscriptions.
    /// Returns `false` when the connection belongs to a superseded cycle.
    fn mark_connected(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return false;
        }
        link.state = ConnectionState::Connected;
        link.outbound = Some(outbound);

        let pending = std::mem::take(&mut link.pending);
        link.subscribed.extend(pending);
        let failed = link
            .subscribed
            .iter()
            .filter(|job_id| !link.send_control(&ControlMessage::subscribe(job_id)))
            .count();
        if failed > 0 {
            tracing::warn!(failed, "Some queued subscriptions could not be sent");
        }
        tracing::info!(subscriptions = link.subscribed.len(), "Realtime channel connected");
        true
    }

    /// Returns `false` when the cycle was superseded.
    fn mark_reconnecting(&self, generation: u64) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return false;
        }
        link.state = ConnectionState::Connecting;
        link.outbound = None;
        true
    }

    /// Returns `false` when the cycle was superseded.
    fn mark_disconnected(&self, generation: u64) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return false;
        }
        link.state = ConnectionState::Disconnected;
        link.outbound = None;
        link.cancel = None;
        true
    }
}

/// Connection task: connect (with bounded retry) -> read until the
/// connection drops -> reconnect. Runs until cancelled or retries are
/// exhausted.
async fn run_connection(inner: Arc<ChannelInner>, generation: u64, cancel: CancellationToken) {
    loop {
        let conn = match connect_with_retry(inner.connector.as_ref(), &inner.reconnect, &cancel).await {
            RetryOutcome::Connected(conn) => conn,
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                tracing::error!(attempts, error = %last_error, "Realtime connection failed, giving up");
                if inner.mark_disconnected(generation) {
                    inner.dispatch(&ChannelEvent::lifecycle(
                        EventCategory::ConnectionError,
                        json!({ "error": last_error.to_string(), "attempts": attempts }),
                    ));
                }
                return;
            }
            RetryOutcome::Cancelled => return,
        };

        let Connection {
            outbound,
            mut inbound,
        } = conn;
        if !inner.mark_connected(generation, outbound) {
            return;
        }
        inner.dispatch(&ChannelEvent::lifecycle(EventCategory::Connect, json!({})));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(frame) => inner.handle_frame(&frame),
                    None => break,
                },
            }
        }

        if cancel.is_cancelled() || !inner.mark_reconnecting(generation) {
            return;
        }
        tracing::warn!("Realtime connection lost, reconnecting");
        inner.dispatch(&ChannelEvent::lifecycle(
            EventCategory::Disconnect,
            json!({ "reason": "connection lost" }),
        ));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
