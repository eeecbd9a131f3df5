//! midistream - Multi-track MIDI song streaming.
//!
//! This library merges the tracks of a Standard MIDI File into one
//! delta-timed event stream and plays it through a MIDI stream device,
//! with looping, pause/resume and live volume control.

pub mod audio;
pub mod config;
pub mod midi;

// Re-export commonly used types
pub use audio::{DeviceError, EngineError, MidiDevice, MusicEngine, PlaybackState, SynthDevice};
pub use config::EngineConfig;
pub use midi::{merge_tracks, MergedEvent, MidiFile, MidiFileError, TimeDivision};
