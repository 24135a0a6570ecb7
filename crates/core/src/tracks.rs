//! The terminal payload of a successful job: stem URLs plus the lyric
//! timeline.

use serde::{Deserialize, Serialize};

/// References to the separated stems and the time-aligned lyrics of one
/// completed job.
///
/// Built once per completed job (see [`TrackBundle::from_json`]) and not
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackBundle {
    #[serde(default, alias = "vocal", alias = "vocalUrl")]
    pub vocal_url: String,
    #[serde(default, alias = "instrumental", alias = "instrumentalUrl")]
    pub instrumental_url: String,
    /// Lyric lines ordered by start time.
    #[serde(default)]
    pub lyrics: Vec<LyricLine>,
}

/// One line of lyrics and the offset (seconds) at which it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricLine {
    #[serde(alias = "startTime", alias = "start")]
    pub start_time: f64,
    pub text: String,
}

/// Reasons a tracks payload cannot be turned into a [`TrackBundle`].
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Malformed track bundle: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Track bundle has no {0} stream")]
    MissingStream(&'static str),
}

impl TrackBundle {
    /// Decode and validate a tracks response body.
    pub fn from_json(value: serde_json::Value) -> Result<Self, BundleError> {
        let mut bundle: TrackBundle = serde_json::from_value(value)?;
        bundle.validate()?;
        bundle
            .lyrics
            .sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        Ok(bundle)
    }

    /// A bundle without both stem URLs cannot be played back.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.vocal_url.trim().is_empty() {
            return Err(BundleError::MissingStream("vocal"));
        }
        if self.instrumental_url.trim().is_empty() {
            return Err(BundleError::MissingStream("instrumental"));
        }
        Ok(())
    }
}
