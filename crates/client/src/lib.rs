//! Job-update delivery for the SingWithMe client.
//!
//! A [`RealtimeChannel`] carries pushed job events over WebSocket, the
//! [`SubscriptionRegistry`] scopes listeners to single jobs, the
//! [`FallbackPoller`] asks the HTTP API when push is silent, and the
//! [`JobTracker`] reconciles both into one terminal outcome per job.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod channel;
pub mod client;
pub mod events;
pub mod messages;
pub mod monitor;
pub mod poller;
pub mod reconnect;
pub mod registry;

pub use api::{ApiError, HttpJobsApi, JobsApi};
pub use channel::{ConnectionState, ListenerHandle, RealtimeChannel};
pub use client::{ConnectError, Connection, Connector, WsConnector};
pub use events::{ChannelEvent, EventCategory};
pub use monitor::{JobMonitor, JobTracker, MonitorCallbacks, MonitorConfig, MonitorPhase, Outcome};
pub use poller::{FallbackPoller, PollEvent, PollHandle};
pub use reconnect::ReconnectConfig;
pub use registry::{JobHandlers, SubscriptionRegistry, SubscriptionToken};

/// Lock a mutex, recovering the data if a panicking listener poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
