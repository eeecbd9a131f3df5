//! MIDI data structures for the streaming engine.
//!
//! This module turns a Standard MIDI File into the flat, playback-ready event
//! array that the audio side streams to a device:
//! - `event`: raw per-track events and the packed `MergedEvent` form
//! - `file`: the `midly`-backed file adapter and track cursors
//! - `merge`: the multi-track merge into one timeline

pub mod event;
mod file;
mod merge;

pub use event::{EventKind, MergedEvent, RawEvent};
pub use file::{MidiFile, MidiFileError, TimeDivision, TrackCursor, TrackIter};
pub use merge::merge_tracks;

#[cfg(test)]
pub(crate) use file::tests as fixtures;

/// Number of MIDI channels on a single port.
pub const CHANNEL_COUNT: usize = 16;

/// Default tempo in microseconds per quarter note (120 BPM).
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Converts a tempo in microseconds per quarter note to beats per minute.
///
/// # Arguments
///
/// * `micros_per_quarter` - Tempo as stored in the stream
///
/// # Returns
///
/// Tempo in beats per minute, or 0.0 for a zero tempo
pub fn tempo_to_bpm(micros_per_quarter: u32) -> f64 {
    if micros_per_quarter == 0 {
        return 0.0;
    }
    60_000_000.0 / micros_per_quarter as f64
}
