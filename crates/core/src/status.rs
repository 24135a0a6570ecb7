//! Canonical job status and normalization of server status payloads.
//!
//! The backend is inconsistent about the shape of a status response:
//! some builds report `{"state": "processing"}`, others
//! `{"status": "processing"}`, and progress may arrive as a fraction or
//! a percentage. [`StatusReport`] captures the raw fields and
//! [`StatusReport::normalize`] folds them into a [`JobStatus`].

use serde::Serialize;

/// Message used when the server reports a failure without saying why.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Processing failed";

/// Status of a job at one instant.
///
/// `Completed` and `Failed` are terminal: once either is observed no
/// further status for the same job is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing {
        /// Fraction complete, always within `[0, 1]`.
        progress: f64,
    },
    Completed,
    Failed {
        error: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Progress as a fraction; queued jobs report `0.0`, completed `1.0`.
    pub fn progress(&self) -> f64 {
        match self {
            Self::Queued | Self::Failed { .. } => 0.0,
            Self::Processing { progress } => *progress,
            Self::Completed => 1.0,
        }
    }
}

/// Raw status fields as reported by the status endpoint or carried in a
/// pushed `status_update` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub state: Option<String>,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl StatusReport {
    /// Extract the status fields from an arbitrary JSON value.
    ///
    /// Fields of the wrong type are ignored rather than rejected so that
    /// a partially malformed response still yields a usable status.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let progress = value.get("progress").and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        Self {
            state: text("state"),
            status: text("status"),
            progress,
            error: text("error"),
            message: text("message"),
        }
    }

    /// Fold the raw fields into the canonical [`JobStatus`].
    ///
    /// The first recognised value among `state` and `status` decides the
    /// variant. Missing or unknown values mean the job is still
    /// processing.
    pub fn normalize(&self) -> JobStatus {
        let recognised = [self.state.as_deref(), self.status.as_deref()]
            .into_iter()
            .flatten()
            .find_map(StateName::parse);

        match recognised {
            Some(StateName::Queued) => JobStatus::Queued,
            Some(StateName::Completed) => JobStatus::Completed,
            Some(StateName::Failed) => JobStatus::Failed {
                error: self
                    .error
                    .clone()
                    .or_else(|| self.message.clone())
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            },
            Some(StateName::Processing) | None => JobStatus::Processing {
                progress: normalize_progress(self.progress),
            },
        }
    }
}

enum StateName {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl StateName {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Some(Self::Queued),
            "processing" | "running" => Some(Self::Processing),
            "completed" | "complete" | "done" => Some(Self::Completed),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Clamp a reported progress value into `[0, 1]`.
///
/// Values above 1 and up to 100 are percentages.
fn normalize_progress(raw: Option<f64>) -> f64 {
    match raw {
        Some(p) if p.is_nan() => 0.0,
        Some(p) if p > 1.0 && p <= 100.0 => p / 100.0,
        Some(p) => p.clamp(0.0, 1.0),
        None => 0.0,
    }
}
