//! Decoded events delivered to realtime channel listeners.
//!
//! Server records and the channel's own lifecycle notifications share
//! one shape, [`ChannelEvent`], so that a single listener table can fan
//! both out by [`EventCategory`].

use std::fmt;

use singwithme_core::job_events::{
    EVENT_CONNECT, EVENT_CONNECTION_ERROR, EVENT_DISCONNECT, EVENT_MESSAGE,
    EVENT_PROCESSING_COMPLETE, EVENT_PROCESSING_ERROR, EVENT_STATUS_UPDATE,
};
use singwithme_core::JobId;

/// Listener key: which kind of event a callback wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Handshake succeeded.
    Connect,
    /// An established connection was lost.
    Disconnect,
    /// Reconnect attempts exhausted.
    ConnectionError,
    StatusUpdate,
    ProcessingComplete,
    ProcessingError,
    /// Wildcard: every decoded server record.
    Message,
    /// Any event name this client does not interpret.
    Other(String),
}

impl EventCategory {
    pub fn from_name(name: &str) -> Self {
        match name {
            EVENT_CONNECT => Self::Connect,
            EVENT_DISCONNECT => Self::Disconnect,
            EVENT_CONNECTION_ERROR => Self::ConnectionError,
            EVENT_STATUS_UPDATE => Self::StatusUpdate,
            EVENT_PROCESSING_COMPLETE => Self::ProcessingComplete,
            EVENT_PROCESSING_ERROR => Self::ProcessingError,
            EVENT_MESSAGE => Self::Message,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Connect => EVENT_CONNECT,
            Self::Disconnect => EVENT_DISCONNECT,
            Self::ConnectionError => EVENT_CONNECTION_ERROR,
            Self::StatusUpdate => EVENT_STATUS_UPDATE,
            Self::ProcessingComplete => EVENT_PROCESSING_COMPLETE,
            Self::ProcessingError => EVENT_PROCESSING_ERROR,
            Self::Message => EVENT_MESSAGE,
            Self::Other(name) => name,
        }
    }

    /// Categories produced by the channel itself rather than the server.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Connect | Self::Disconnect | Self::ConnectionError)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub category: EventCategory,
    /// Job the record refers to; `None` for lifecycle events.
    pub job_id: Option<JobId>,
    /// The full decoded record (or lifecycle details).
    pub payload: serde_json::Value,
}

impl ChannelEvent {
    pub fn lifecycle(category: EventCategory, payload: serde_json::Value) -> Self {
        Self {
            category,
            job_id: None,
            payload,
        }
    }

    pub fn is_for(&self, job_id: &JobId) -> bool {
        self.job_id.as_ref() == Some(job_id)
    }

    /// Server-supplied failure text (`error`, then `message`).
    pub fn error_message(&self) -> Option<&str> {
        ["error", "message"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(|v| v.as_str()))
            .filter(|msg| !msg.trim().is_empty())
    }
}
