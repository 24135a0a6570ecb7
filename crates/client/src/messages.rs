//! Realtime wire format.
//!
//! Inbound records are JSON objects of the shape
//! `{"event": "<name>", "jobId": "...", ...payload}`; outbound control
//! messages are `{"type": "subscribe"|"unsubscribe", "jobId": "...",
//! "timestamp": "..."}`.

use serde::Serialize;
use singwithme_core::job_events::{CONTROL_SUBSCRIBE, CONTROL_UNSUBSCRIBE};
use singwithme_core::{JobId, Timestamp};

use crate::events::{ChannelEvent, EventCategory};

/// A frame as read off the connection, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Why an inbound frame was dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Record has no event type")]
    MissingEvent,
}

/// Decode one inbound frame into a [`ChannelEvent`].
///
/// Binary frames are parsed as UTF-8 JSON just like text frames.
pub fn decode_frame(frame: &RawFrame) -> Result<ChannelEvent, DecodeError> {
    let record: serde_json::Value = match frame {
        RawFrame::Text(text) => serde_json::from_str(text)?,
        RawFrame::Binary(bytes) => serde_json::from_slice(bytes)?,
    };
    decode_record(record)
}

fn decode_record(record: serde_json::Value) -> Result<ChannelEvent, DecodeError> {
    let object = record.as_object().ok_or(DecodeError::NotAnObject)?;

    let category = object
        .get("event")
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty())
        .map(EventCategory::from_name)
        .ok_or(DecodeError::MissingEvent)?;

    let job_id = ["jobId", "job_id"]
        .iter()
        .find_map(|key| object.get(*key))
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(JobId::new(s.clone())),
            serde_json::Value::Number(n) => Some(JobId::new(n.to_string())),
            _ => None,
        });

    Ok(ChannelEvent {
        category,
        job_id,
        payload: record,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Subscribe,
    Unsubscribe,
}

impl ControlKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => CONTROL_SUBSCRIBE,
            Self::Unsubscribe => CONTROL_UNSUBSCRIBE,
        }
    }
}

impl Serialize for ControlKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outbound subscription control message.
#[derive(Debug, Clone, Serialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    pub timestamp: Timestamp,
}

impl ControlMessage {
    pub fn subscribe(job_id: &JobId) -> Self {
        Self::new(ControlKind::Subscribe, job_id)
    }

    pub fn unsubscribe(job_id: &JobId) -> Self {
        Self::new(ControlKind::Unsubscribe, job_id)
    }

    fn new(kind: ControlKind, job_id: &JobId) -> Self {
        Self {
            kind,
            job_id: job_id.clone(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("ControlMessage is always serialisable")
    }
}
