//! Boundary to the audio playback engine.
//!
//! The engine itself lives outside this workspace. A completed job's
//! [`TrackBundle`] is handed to it verbatim through [`load_bundle`];
//! [`LyricTimeline`] maps the engine's playback position to the lyric
//! line that should be highlighted.

use crate::tracks::{LyricLine, TrackBundle};

/// One of the two separated stems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stem {
    Vocal,
    Instrumental,
}

/// Errors reported by a playback engine.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Failed to load {stem:?} track: {reason}")]
    Load { stem: Stem, reason: String },

    #[error("Playback engine error: {0}")]
    Engine(String),
}

/// Operations the client needs from a playback engine.
pub trait PlaybackTransport {
    fn load_tracks(&mut self, vocal_url: &str, instrumental_url: &str) -> Result<(), PlaybackError>;
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self) -> Result<(), PlaybackError>;
    fn seek(&mut self, seconds: f64) -> Result<(), PlaybackError>;
    /// Current playback position in seconds.
    fn current_time(&self) -> f64;
    /// Set the gain of one stem; callers pass values in `[0, 1]`.
    fn set_volume(&mut self, stem: Stem, volume: f32);
    fn release(&mut self);
}

/// Hand a completed job's stems to the playback engine.
pub fn load_bundle<P: PlaybackTransport + ?Sized>(
    transport: &mut P,
    bundle: &TrackBundle,
) -> Result<(), PlaybackError> {
    transport.load_tracks(&bundle.vocal_url, &bundle.instrumental_url)
}

/// Set a stem's volume, clamped to `[0, 1]`.
pub fn set_stem_volume<P: PlaybackTransport + ?Sized>(transport: &mut P, stem: Stem, volume: f32) {
    let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    transport.set_volume(stem, volume);
}

/// Lookup of the active lyric line for a playback position.
#[derive(Debug, Clone, Copy)]
pub struct LyricTimeline<'a> {
    lines: &'a [LyricLine],
}

impl<'a> LyricTimeline<'a> {
    /// `lines` must be ordered by start time, as [`TrackBundle`] keeps them.
    pub fn new(lines: &'a [LyricLine]) -> Self {
        Self { lines }
    }

    /// Index of the last line that has started at `seconds`, if any.
    pub fn active_index(&self, seconds: f64) -> Option<usize> {
        let started = self.lines.partition_point(|line| line.start_time <= seconds);
        started.checked_sub(1)
    }

    pub fn active_line(&self, seconds: f64) -> Option<&'a LyricLine> {
        self.active_index(seconds).map(|i| &self.lines[i])
    }
}
