//! The MIDI stream device the engine plays through.
//!
//! A device accepts small buffers of packed, delta-timed events and reports
//! asynchronously when it is done with each one. Everything above this trait
//! is device independent; [`super::synth::SynthDevice`] is the bundled
//! software implementation.

use super::signal::BufferNotifier;
use crate::midi::{MergedEvent, TimeDivision};
use thiserror::Error;

/// Errors reported by a stream device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No output endpoint could be opened.
    #[error("no MIDI output available: {0}")]
    Unavailable(String),
    /// The device has not been opened.
    #[error("MIDI stream is not open")]
    NotOpen,
    /// No stream buffer has been prepared.
    #[error("MIDI stream buffer is not prepared")]
    NotPrepared,
    /// A buffer was submitted while the previous one is still queued.
    #[error("MIDI stream buffer is still playing")]
    StillPlaying,
    /// A buffer was larger than the prepared capacity.
    #[error("buffer of {len} events exceeds prepared capacity of {capacity}")]
    BufferTooLarge { len: usize, capacity: usize },
    /// The driver rejected the call.
    #[error("MIDI driver error: {0}")]
    Driver(String),
}

/// A MIDI stream output.
///
/// Methods take `&self` because the engine calls in from both the caller's
/// thread and the player thread; implementations synchronize internally.
///
/// Contract:
/// - A freshly opened stream is paused until [`restart`](Self::restart).
/// - When a submitted buffer has been consumed the device calls
///   [`BufferNotifier::buffer_done`] from whatever context it likes.
/// - [`stop`](Self::stop) hands any queued buffer back, which counts as
///   consumed and raises the notifier.
/// - [`reset`](Self::reset) silences every note on every channel.
pub trait MidiDevice: Send + Sync + 'static {
    /// Opens the output stream. `notifier` is raised whenever a buffer is done.
    fn open(&self, notifier: BufferNotifier) -> Result<(), DeviceError>;

    /// Registers a stream buffer able to hold `capacity` events.
    fn prepare_buffer(&self, capacity: usize) -> Result<(), DeviceError>;

    /// Releases the stream buffer.
    fn unprepare_buffer(&self) -> Result<(), DeviceError>;

    /// Closes the output stream.
    fn close(&self) -> Result<(), DeviceError>;

    /// Sets the resolution delta times are measured in.
    fn set_time_division(&self, division: TimeDivision) -> Result<(), DeviceError>;

    /// Sets the current tempo, in microseconds per quarter note.
    fn set_tempo(&self, micros_per_quarter: u32) -> Result<(), DeviceError>;

    /// Queues a buffer of events for playback.
    fn stream_out(&self, events: &[MergedEvent]) -> Result<(), DeviceError>;

    /// Sends one packed short message immediately, outside the stream.
    fn short_message(&self, message: u32) -> Result<(), DeviceError>;

    /// Pauses the stream clock.
    fn pause(&self) -> Result<(), DeviceError>;

    /// Starts or resumes the stream clock.
    fn restart(&self) -> Result<(), DeviceError>;

    /// Stops the stream and returns any queued buffer.
    fn stop(&self) -> Result<(), DeviceError>;

    /// Turns off all notes.
    fn reset(&self) -> Result<(), DeviceError>;
}
