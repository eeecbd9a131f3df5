//! Music engine driving a MIDI stream device.
//!
//! The engine owns the device, the registered song and the background player
//! thread. Playback is double buffered through a small stream window: the
//! device reports each finished buffer through a [`BufferNotifier`], and the
//! player thread refills and resubmits the window in response. While the
//! player thread runs it owns the song outright, and hands it back when it
//! is joined on stop.

use super::device::{DeviceError, MidiDevice};
use super::signal::{BufferNotifier, PlayerSignal, PlayerSignals};
use super::stream::{Song, StreamWindow, STREAM_MAX_EVENTS};
use super::volume::VolumeState;
use crate::config::EngineConfig;
use crate::midi::event::main_volume_message;
use crate::midi::{merge_tracks, MidiFile, MidiFileError, TimeDivision, CHANNEL_COUNT};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Name given to the background player thread.
const PLAYER_THREAD_NAME: &str = "midi-player";

/// Errors returned by the engine's entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A device call failed.
    #[error("MIDI device error: {0}")]
    Device(#[from] DeviceError),
    /// The song bytes could not be parsed.
    #[error("failed to load song: {0}")]
    Parse(#[from] MidiFileError),
    /// `init` has not succeeded yet.
    #[error("music system is not initialized")]
    NotInitialized,
    /// The player thread currently owns the song.
    #[error("a song is currently playing")]
    SongPlaying,
    /// The player thread could not be started.
    #[error("failed to start player thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Represents the current playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No device open.
    Closed,
    /// Device open, no song registered.
    Opened,
    /// A song is registered and its first window is queued.
    Registered,
    /// The player thread is running and the stream clock is going.
    Playing,
    /// The player thread is running but the stream clock is paused.
    Paused,
}

/// A registered song together with its stream window.
///
/// Only ever touched by one thread at a time: the caller while stopped, the
/// player thread while playing.
struct SongStream {
    song: Song,
    window: StreamWindow,
    division: TimeDivision,
}

impl SongStream {
    fn new(song: Song, division: TimeDivision) -> Self {
        Self {
            song,
            window: StreamWindow::new(),
            division,
        }
    }

    /// Refills the window and submits it, skipping empty windows.
    ///
    /// # Returns
    ///
    /// Number of events submitted
    fn pump(&mut self, device: &dyn MidiDevice, volumes: &VolumeState) -> Result<usize, DeviceError> {
        let count = self.window.fill(&mut self.song, volumes);
        if count == 0 {
            tracing::debug!("end of song reached, nothing left to stream");
            return Ok(0);
        }
        device.stream_out(self.window.events())?;
        Ok(count)
    }
}

/// Logs a device error with context before handing it back.
fn report(context: &'static str) -> impl Fn(DeviceError) -> DeviceError {
    move |e| {
        tracing::error!("{}: {}", context, e);
        e
    }
}

/// Asks the scheduler to treat the calling thread as time critical.
///
/// # Returns
///
/// Whether the priority was raised. Failure is logged and otherwise ignored.
fn raise_player_priority() -> bool {
    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Could not raise player thread priority: {:?}", e);
            false
        }
    }
}

/// Player thread body: refill on every returned buffer until told to exit.
fn run_player(
    mut stream: SongStream,
    device: Arc<dyn MidiDevice>,
    volumes: Arc<VolumeState>,
    signals: Arc<PlayerSignals>,
) -> SongStream {
    let raised = raise_player_priority();
    tracing::debug!(raised_priority = raised, "player thread started");
    loop {
        match signals.wait() {
            PlayerSignal::BufferReturned => {
                if let Err(e) = stream.pump(device.as_ref(), &volumes) {
                    tracing::error!("MIDI stream out failed: {}", e);
                }
            }
            PlayerSignal::Exit => break,
        }
    }
    tracing::debug!(position = stream.song.position(), "player thread exiting");
    stream
}

/// The main engine for streaming MIDI songs to a device.
///
/// Manages the device lifecycle, the current song, the player thread and
/// live volume control. Exactly one song is registered at a time.
pub struct MusicEngine<D: MidiDevice> {
    /// The output device (shared with the player thread).
    device: Arc<D>,
    /// Engine tunables.
    config: EngineConfig,
    /// Channel volumes and global scale (shared with the player thread).
    volumes: Arc<VolumeState>,
    /// Wake-up signals for the player thread.
    signals: Arc<PlayerSignals>,
    /// Whether the device is open and its buffer prepared.
    opened: bool,
    /// The registered song while no player thread owns it.
    stream: Option<SongStream>,
    /// Event count of the registered song, for reporting while it plays.
    song_len: usize,
    /// The running player thread, which returns the song when joined.
    player: Option<JoinHandle<SongStream>>,
    /// Whether the stream clock is paused.
    paused: bool,
}

impl<D: MidiDevice> MusicEngine<D> {
    /// Creates an engine for the given device. The device is not opened
    /// until [`init`](Self::init).
    ///
    /// # Arguments
    ///
    /// * `device` - The stream device to play through
    /// * `config` - Engine tunables
    pub fn new(device: D, config: EngineConfig) -> Self {
        let volumes = Arc::new(VolumeState::new(config.default_channel_volume));
        Self {
            device: Arc::new(device),
            config,
            volumes,
            signals: PlayerSignals::new(),
            opened: false,
            stream: None,
            song_len: 0,
            player: None,
            paused: false,
        }
    }

    /// Opens the device and prepares the stream buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or the buffer cannot be
    /// prepared. Other operations stay no-ops until a later call succeeds.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.opened {
            return Ok(());
        }

        self.signals = PlayerSignals::new();
        let notifier: BufferNotifier = self.signals.notifier();

        self.device
            .open(notifier)
            .map_err(report("Failed to open MIDI stream"))?;

        if let Err(e) = self.device.prepare_buffer(STREAM_MAX_EVENTS) {
            tracing::error!("Failed to prepare MIDI stream buffer: {}", e);
            if let Err(close_err) = self.device.close() {
                tracing::error!("Failed to close MIDI stream: {}", close_err);
            }
            return Err(e.into());
        }

        self.opened = true;
        tracing::info!("MIDI stream opened");

        // A song kept across shutdown refills from its cursor on the next play
        if let Some(stream) = &self.stream {
            self.device
                .set_time_division(stream.division)
                .map_err(report("Failed to set MIDI time division"))?;
            self.device
                .set_tempo(self.config.initial_tempo)
                .map_err(report("Failed to set MIDI tempo"))?;
            self.signals.raise_buffer_returned();
        }
        Ok(())
    }

    /// Sets the global music volume.
    ///
    /// The new scale is applied to every channel's last recorded volume and
    /// sent to the device right away, so the change is audible without
    /// waiting for the song's next volume event.
    ///
    /// # Arguments
    ///
    /// * `level` - Coarse UI volume level; 0 mutes
    ///
    /// # Errors
    ///
    /// Returns the first device error; every channel is still attempted.
    pub fn set_volume(&self, level: u32) -> Result<(), EngineError> {
        let scale = self.config.volume_scale(level);
        self.volumes.set_scale(scale);
        tracing::debug!(level, scale, "music volume changed");

        if !self.opened {
            return Ok(());
        }

        let mut result = Ok(());
        for channel in 0..CHANNEL_COUNT as u8 {
            let message = main_volume_message(channel, self.volumes.corrected(channel));
            if let Err(e) = self
                .device
                .short_message(message)
                .map_err(report("Failed to send channel volume"))
            {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Loads a song from raw Standard MIDI File bytes.
    ///
    /// Channel volumes are reset, the file's time division and the initial
    /// tempo are pushed to the device, the tracks are merged, and the first
    /// window is queued so playback starts as soon as [`play_song`](Self::play_song)
    /// is called. A previously registered song is replaced.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is not initialized, a song is playing, the
    /// bytes are not a valid MIDI file (no state is changed), or a device
    /// call fails. If queuing the new song fails the previous one stays
    /// registered, with channel volumes reset.
    pub fn register_song(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if !self.opened {
            return Err(EngineError::NotInitialized);
        }
        if self.player.is_some() {
            return Err(EngineError::SongPlaying);
        }

        let file = MidiFile::parse(data).map_err(|e| {
            tracing::warn!("Failed to load MIDI: {}", e);
            e
        })?;

        if self.stream.is_some() {
            // Take back the previous song's primed window
            self.device
                .stop()
                .map_err(report("Failed to stop MIDI stream"))?;
        }

        self.volumes.reset_channels(self.config.default_channel_volume);

        self.device
            .set_time_division(file.time_division())
            .map_err(report("Failed to set MIDI time division"))?;
        self.device
            .set_tempo(self.config.initial_tempo)
            .map_err(report("Failed to set MIDI tempo"))?;

        let events = merge_tracks(file.tracks(), file.event_count());
        let mut stream = SongStream::new(Song::new(events), file.time_division());

        self.signals.reset();

        if let Err(e) = stream
            .pump(self.device.as_ref(), &self.volumes)
            .map_err(report("Failed to queue MIDI stream"))
        {
            if let Some(previous) = &self.stream {
                // Its window was taken back above, so refill it on the next play
                if let Err(e) = self.device.set_time_division(previous.division) {
                    tracing::error!("Failed to restore MIDI time division: {}", e);
                }
                self.signals.raise_buffer_returned();
            }
            return Err(e.into());
        }

        self.song_len = stream.song.len();
        self.stream = Some(stream);
        self.paused = false;

        tracing::info!(
            tracks = file.track_count(),
            events = self.song_len,
            "song registered"
        );
        Ok(())
    }

    /// Starts playing the registered song from its current position.
    ///
    /// # Arguments
    ///
    /// * `looping` - Whether to wrap to the start at the end of the song
    ///
    /// # Errors
    ///
    /// Returns error if the player thread cannot be spawned or the device
    /// fails to start.
    pub fn play_song(&mut self, looping: bool) -> Result<(), EngineError> {
        if !self.opened {
            tracing::debug!("play ignored: music system not initialized");
            return Ok(());
        }
        if self.player.is_some() {
            tracing::warn!("play ignored: a song is already playing");
            return Ok(());
        }
        let Some(mut stream) = self.stream.take() else {
            tracing::debug!("play ignored: no song registered");
            return Ok(());
        };

        stream.song.set_looping(looping);

        let device: Arc<dyn MidiDevice> = self.device.clone();
        let volumes = Arc::clone(&self.volumes);
        let signals = Arc::clone(&self.signals);

        let handle = thread::Builder::new()
            .name(PLAYER_THREAD_NAME.to_string())
            .spawn(move || run_player(stream, device, volumes, signals))
            .map_err(|e| {
                tracing::error!("Failed to spawn player thread, song discarded: {}", e);
                self.song_len = 0;
                e
            })?;
        self.player = Some(handle);
        self.paused = false;

        self.device
            .restart()
            .map_err(report("Failed to restart MIDI stream"))?;

        tracing::info!(looping, "playback started");
        Ok(())
    }

    /// Stops playback.
    ///
    /// Blocks until the player thread has exited, then stops and resets the
    /// device. The song keeps its current position. Safe to call when
    /// nothing is playing.
    ///
    /// # Errors
    ///
    /// Returns the first device error; both stop and reset are attempted.
    pub fn stop_song(&mut self) -> Result<(), EngineError> {
        if let Some(handle) = self.player.take() {
            self.signals.raise_exit();
            match handle.join() {
                Ok(stream) => self.stream = Some(stream),
                Err(_) => {
                    tracing::error!("Player thread panicked, song discarded");
                    self.song_len = 0;
                }
            }
        }
        self.paused = false;

        if !self.opened {
            return Ok(());
        }

        let stopped = self
            .device
            .stop()
            .map_err(report("Failed to stop MIDI stream"));
        let reset = self
            .device
            .reset()
            .map_err(report("Failed to reset MIDI output"));

        tracing::debug!("playback stopped");
        stopped.and(reset).map_err(EngineError::from)
    }

    /// Pauses the device stream without touching the player thread.
    pub fn pause_song(&mut self) -> Result<(), EngineError> {
        if !self.opened {
            return Ok(());
        }
        self.device
            .pause()
            .map_err(report("Failed to pause MIDI stream"))?;
        self.paused = true;
        Ok(())
    }

    /// Resumes a paused device stream.
    pub fn resume_song(&mut self) -> Result<(), EngineError> {
        if !self.opened {
            return Ok(());
        }
        self.device
            .restart()
            .map_err(report("Failed to restart MIDI stream"))?;
        self.paused = false;
        Ok(())
    }

    /// Releases the registered song.
    ///
    /// Must be preceded by [`stop_song`](Self::stop_song); while the player
    /// thread owns the song this only logs a warning. Any window still
    /// queued on the device is taken back.
    pub fn unregister_song(&mut self) {
        if self.player.is_some() {
            tracing::warn!("unregister ignored: stop the song first");
            return;
        }
        if self.stream.take().is_some() {
            if self.opened {
                if let Err(e) = self.device.stop() {
                    tracing::error!("Failed to stop MIDI stream: {}", e);
                }
            }
            tracing::debug!("song unregistered");
        }
        self.song_len = 0;
    }

    /// Stops playback and closes the device.
    ///
    /// Every teardown step is attempted even if an earlier one fails. A
    /// later [`init`](Self::init) reopens the device.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub fn shutdown_music(&mut self) -> Result<(), EngineError> {
        if !self.opened {
            return Ok(());
        }

        let stopped = self.stop_song();
        let unprepared = self
            .device
            .unprepare_buffer()
            .map_err(report("Failed to unprepare MIDI stream buffer"));
        let closed = self
            .device
            .close()
            .map_err(report("Failed to close MIDI stream"));

        self.opened = false;
        tracing::info!("MIDI stream closed");

        stopped
            .and(unprepared.map_err(EngineError::from))
            .and(closed.map_err(EngineError::from))
    }

    /// Returns the current playback state.
    pub fn playback_state(&self) -> PlaybackState {
        if !self.opened {
            PlaybackState::Closed
        } else if self.player.is_some() {
            if self.paused {
                PlaybackState::Paused
            } else {
                PlaybackState::Playing
            }
        } else if self.stream.is_some() {
            PlaybackState::Registered
        } else {
            PlaybackState::Opened
        }
    }

    /// Returns whether a song is registered.
    pub fn is_registered(&self) -> bool {
        self.stream.is_some() || self.player.is_some()
    }

    /// Returns the number of events in the registered song.
    pub fn song_len(&self) -> usize {
        self.song_len
    }

    /// Returns the song's play cursor, or `None` while the player thread
    /// owns the song or nothing is registered.
    pub fn song_position(&self) -> Option<usize> {
        self.stream.as_ref().map(|stream| stream.song.position())
    }

    /// Returns the current global volume scale.
    pub fn volume_scale(&self) -> f32 {
        self.volumes.scale()
    }

    /// Returns the last linear volume recorded for a channel.
    pub fn channel_volume(&self, channel: u8) -> u8 {
        self.volumes.channel(channel)
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the output device.
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: MidiDevice> Drop for MusicEngine<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_music() {
            tracing::warn!("Error shutting down music engine: {}", e);
        }
    }
}
