//! Shared data model for the SingWithMe client.
//!
//! Job identifiers and statuses, the track bundle produced by a
//! completed job, the caller-facing error taxonomy, delivery
//! configuration, realtime event names, and the playback boundary.

pub mod config;
pub mod error;
pub mod job_events;
pub mod playback;
pub mod status;
pub mod tracks;
pub mod types;

pub use config::{DeliveryConfig, Environment};
pub use error::{ConfigError, JobError};
pub use status::{JobStatus, StatusReport};
pub use tracks::{BundleError, LyricLine, TrackBundle};
pub use types::{JobId, Timestamp};
