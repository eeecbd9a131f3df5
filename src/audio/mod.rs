//! Playback side of the streaming engine.
//!
//! This module takes a merged song and streams it to a MIDI device:
//! - `volume`: the perceptual volume curve and per-channel volume state
//! - `stream`: the song cursor and the small stream window refilled from it
//! - `signal`: the wakeup primitive between device callbacks and the player
//! - `device`: the device trait the engine plays through
//! - `engine`: the `MusicEngine` playback driver
//! - `synth`: a SoundFont-backed software device

pub mod device;
pub mod engine;
pub mod signal;
pub mod stream;
pub mod synth;
pub mod volume;

pub use device::{DeviceError, MidiDevice};
pub use engine::{EngineError, MusicEngine, PlaybackState};
pub use signal::{BufferNotifier, PlayerSignal, PlayerSignals};
pub use stream::{Song, StreamWindow, STREAM_MAX_EVENTS};
pub use synth::SynthDevice;
pub use volume::{correct_volume, VolumeState, VOLUME_CORRECTION};
