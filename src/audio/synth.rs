//! Software MIDI stream device.
//!
//! Plays streamed events on a SoundFont synthesizer (rustysynth) rendered
//! through the default audio output (rodio). A sequencer thread owns the
//! output stream, waits out each event's delta time at the current tempo,
//! and reports finished buffers through the engine's notifier.

use super::device::{DeviceError, MidiDevice};
use super::signal::BufferNotifier;
use crate::midi::{MergedEvent, TimeDivision, DEFAULT_TEMPO};
use rodio::{OutputStream, Source};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Frames rendered per block handed to the audio output.
const RENDER_FRAMES: usize = 256;

/// How far the sequencer may fall behind before it stops trying to catch up.
const MAX_LAG: Duration = Duration::from_millis(100);

/// Endless interleaved stereo stream for rodio, rendered a block at a time
/// by `render(left, right)`.
struct StereoRenderer<F> {
    render: F,
    left: Vec<f32>,
    right: Vec<f32>,
    block: Vec<f32>,
    cursor: usize,
}

impl<F: FnMut(&mut [f32], &mut [f32])> StereoRenderer<F> {
    fn new(render: F) -> Self {
        Self {
            render,
            left: vec![0.0; RENDER_FRAMES],
            right: vec![0.0; RENDER_FRAMES],
            block: Vec::with_capacity(RENDER_FRAMES * 2),
            cursor: 0,
        }
    }

    fn render_block(&mut self) {
        (self.render)(&mut self.left, &mut self.right);
        self.block.clear();
        self.block.extend(
            self.left
                .iter()
                .zip(&self.right)
                .flat_map(|(&left, &right)| [left, right]),
        );
        self.cursor = 0;
    }
}

impl<F: FnMut(&mut [f32], &mut [f32])> Iterator for StereoRenderer<F> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.cursor >= self.block.len() {
            self.render_block();
        }
        let sample = self.block[self.cursor];
        self.cursor += 1;
        Some(sample)
    }
}

impl<F: FnMut(&mut [f32], &mut [f32])> Source for StereoRenderer<F> {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Renders the next block from the shared synthesizer, or silence if its
/// lock is poisoned.
fn render_synth(synth: &Mutex<Synthesizer>, left: &mut [f32], right: &mut [f32]) {
    match synth.lock() {
        Ok(mut synth) => synth.render(left, right),
        Err(_) => {
            left.fill(0.0);
            right.fill(0.0);
        }
    }
}

/// Sends a packed short message to the synthesizer.
fn play_short(synth: &Mutex<Synthesizer>, message: u32) {
    let status = (message & 0xFF) as i32;
    let data1 = ((message >> 8) & 0x7F) as i32;
    let data2 = ((message >> 16) & 0x7F) as i32;
    if let Ok(mut synth) = synth.lock() {
        synth.process_midi_message(status & 0x0F, status & 0xF0, data1, data2);
    }
}

/// Sequencer state guarded by [`Sequencer::state`].
struct SequencerState {
    /// The device has been opened and not yet closed.
    open: bool,
    /// The sequencer thread should exit.
    closing: bool,
    /// The stream clock is running.
    running: bool,
    /// Capacity of the prepared buffer, if any.
    capacity: Option<usize>,
    /// Events of the submitted buffer not yet played.
    pending: VecDeque<MergedEvent>,
    /// A submitted buffer has not been returned yet.
    in_flight: bool,
    /// When the last event was due.
    clock: Option<Instant>,
    /// When the clock was paused.
    paused_at: Option<Instant>,
    tempo: u32,
    division: TimeDivision,
    notifier: Option<BufferNotifier>,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self {
            open: false,
            closing: false,
            running: false,
            capacity: None,
            pending: VecDeque::new(),
            in_flight: false,
            clock: None,
            paused_at: None,
            tempo: DEFAULT_TEMPO,
            division: TimeDivision::Metrical(96),
            notifier: None,
        }
    }
}

impl SequencerState {
    /// Hands the in-flight buffer back to the engine.
    fn return_buffer(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            if let Some(notifier) = &self.notifier {
                notifier.buffer_done();
            }
        }
    }
}

/// The timing half of the device, independent of audio output.
#[derive(Default)]
struct Sequencer {
    state: Mutex<SequencerState>,
    wake: Condvar,
}

impl Sequencer {
    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the state and fails unless the device is open.
    fn lock_open(&self) -> Result<MutexGuard<'_, SequencerState>, DeviceError> {
        let state = self.lock();
        if !state.open {
            return Err(DeviceError::NotOpen);
        }
        Ok(state)
    }

    fn begin(&self, notifier: BufferNotifier) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.open {
            return Err(DeviceError::Driver("MIDI stream already open".into()));
        }
        *state = SequencerState {
            open: true,
            notifier: Some(notifier),
            ..SequencerState::default()
        };
        Ok(())
    }

    fn end(&self) {
        let mut state = self.lock();
        state.closing = true;
        state.open = false;
        state.notifier = None;
        self.wake.notify_all();
    }

    fn prepare(&self, capacity: usize) -> Result<(), DeviceError> {
        self.lock_open()?.capacity = Some(capacity);
        Ok(())
    }

    fn unprepare(&self) -> Result<(), DeviceError> {
        let mut state = self.lock_open()?;
        if state.in_flight {
            return Err(DeviceError::StillPlaying);
        }
        state.capacity = None;
        Ok(())
    }

    fn set_time_division(&self, division: TimeDivision) -> Result<(), DeviceError> {
        self.lock_open()?.division = division;
        Ok(())
    }

    fn set_tempo(&self, tempo: u32) -> Result<(), DeviceError> {
        self.lock_open()?.tempo = tempo;
        Ok(())
    }

    fn submit(&self, events: &[MergedEvent]) -> Result<(), DeviceError> {
        let mut state = self.lock_open()?;
        let capacity = state.capacity.ok_or(DeviceError::NotPrepared)?;
        if events.len() > capacity {
            return Err(DeviceError::BufferTooLarge {
                len: events.len(),
                capacity,
            });
        }
        if state.in_flight {
            return Err(DeviceError::StillPlaying);
        }
        state.pending.extend(events.iter().copied());
        state.in_flight = true;
        self.wake.notify_all();
        Ok(())
    }

    fn pause(&self) -> Result<(), DeviceError> {
        let mut state = self.lock_open()?;
        if state.running {
            state.running = false;
            state.paused_at = Some(Instant::now());
        }
        Ok(())
    }

    fn restart(&self) -> Result<(), DeviceError> {
        let mut state = self.lock_open()?;
        if !state.running {
            // Shift the clock by the time spent paused
            if let (Some(clock), Some(paused_at)) = (state.clock, state.paused_at) {
                state.clock = Some(clock + paused_at.elapsed());
            }
            state.paused_at = None;
            state.running = true;
            self.wake.notify_all();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let mut state = self.lock_open()?;
        state.running = false;
        state.pending.clear();
        state.clock = None;
        state.paused_at = None;
        state.return_buffer();
        Ok(())
    }

    /// Plays submitted events in time until the device closes.
    fn run(&self, mut dispatch: impl FnMut(u32)) {
        let mut state = self.lock();
        loop {
            if state.closing {
                break;
            }
            if !state.running {
                state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            }

            let Some(event) = state.pending.front().copied() else {
                state.return_buffer();
                state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            };

            let now = Instant::now();
            let last = *state.clock.get_or_insert(now);
            let due = last + state.division.tick_duration(event.delta_time, state.tempo);
            if now < due {
                state = self
                    .wake
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                continue;
            }

            state.pending.pop_front();
            state.clock = Some(if now.duration_since(due) > MAX_LAG { now } else { due });

            if event.is_tempo() {
                state.tempo = event.tempo();
            } else {
                dispatch(event.event);
            }
        }
    }
}

/// A MIDI stream device backed by a SoundFont synthesizer.
pub struct SynthDevice {
    /// The synthesizer (shared with the audio thread).
    synth: Arc<Mutex<Synthesizer>>,
    /// Stream timing state (shared with the sequencer thread).
    sequencer: Arc<Sequencer>,
    /// Sequencer thread, which also keeps the audio output alive.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SynthDevice {
    /// Creates a device with the specified SoundFont.
    ///
    /// # Arguments
    ///
    /// * `soundfont_path` - Path to the SoundFont file (.sf2)
    ///
    /// # Errors
    ///
    /// Returns error if the SoundFont cannot be read or is invalid.
    pub fn new<P: AsRef<Path>>(soundfont_path: P) -> Result<Self, DeviceError> {
        let path = soundfont_path.as_ref();
        let mut file = BufReader::new(File::open(path).map_err(|e| {
            DeviceError::Unavailable(format!("Failed to open SoundFont {}: {}", path.display(), e))
        })?);
        let soundfont = Arc::new(SoundFont::new(&mut file).map_err(|e| {
            DeviceError::Unavailable(format!("Failed to load SoundFont: {:?}", e))
        })?);

        let settings = SynthesizerSettings::new(SAMPLE_RATE as i32);
        let synth = Synthesizer::new(&soundfont, &settings).map_err(|e| {
            DeviceError::Unavailable(format!("Failed to create synthesizer: {:?}", e))
        })?;

        Ok(Self {
            synth: Arc::new(Mutex::new(synth)),
            sequencer: Arc::new(Sequencer::default()),
            thread: Mutex::new(None),
        })
    }

    fn thread_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MidiDevice for SynthDevice {
    fn open(&self, notifier: BufferNotifier) -> Result<(), DeviceError> {
        let mut slot = self.thread_slot();
        self.sequencer.begin(notifier)?;

        let synth = Arc::clone(&self.synth);
        let sequencer = Arc::clone(&self.sequencer);
        let (ready_tx, ready_rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("midi-sequencer".to_string())
            .spawn(move || {
                // The output stream must live on this thread for as long as
                // the device is open.
                let output = OutputStream::try_default()
                    .map_err(|e| e.to_string())
                    .and_then(|(stream, handle)| {
                        let output = Arc::clone(&synth);
                        handle
                            .play_raw(StereoRenderer::new(move |left, right| {
                                render_synth(&output, left, right)
                            }))
                            .map(|_| stream)
                            .map_err(|e| e.to_string())
                    });
                let _stream = match output {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                sequencer.run(|message| play_short(&synth, message));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.sequencer.end();
                return Err(DeviceError::Driver(e.to_string()));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *slot = Some(handle);
                tracing::debug!("synth device opened");
                Ok(())
            }
            Ok(Err(e)) => {
                self.sequencer.end();
                let _ = handle.join();
                Err(DeviceError::Unavailable(e))
            }
            Err(_) => {
                self.sequencer.end();
                let _ = handle.join();
                Err(DeviceError::Driver("sequencer thread exited during open".into()))
            }
        }
    }

    fn prepare_buffer(&self, capacity: usize) -> Result<(), DeviceError> {
        self.sequencer.prepare(capacity)
    }

    fn unprepare_buffer(&self) -> Result<(), DeviceError> {
        self.sequencer.unprepare()
    }

    fn close(&self) -> Result<(), DeviceError> {
        let handle = self.thread_slot().take().ok_or(DeviceError::NotOpen)?;
        self.sequencer.end();
        handle
            .join()
            .map_err(|_| DeviceError::Driver("sequencer thread panicked".into()))?;
        if let Ok(mut synth) = self.synth.lock() {
            synth.note_off_all(true);
        }
        tracing::debug!("synth device closed");
        Ok(())
    }

    fn set_time_division(&self, division: TimeDivision) -> Result<(), DeviceError> {
        self.sequencer.set_time_division(division)
    }

    fn set_tempo(&self, micros_per_quarter: u32) -> Result<(), DeviceError> {
        self.sequencer.set_tempo(micros_per_quarter)
    }

    fn stream_out(&self, events: &[MergedEvent]) -> Result<(), DeviceError> {
        self.sequencer.submit(events)
    }

    fn short_message(&self, message: u32) -> Result<(), DeviceError> {
        drop(self.sequencer.lock_open()?);
        play_short(&self.synth, message);
        Ok(())
    }

    fn pause(&self) -> Result<(), DeviceError> {
        self.sequencer.pause()?;
        if let Ok(mut synth) = self.synth.lock() {
            synth.note_off_all(false);
        }
        Ok(())
    }

    fn restart(&self) -> Result<(), DeviceError> {
        self.sequencer.restart()
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.sequencer.stop()?;
        if let Ok(mut synth) = self.synth.lock() {
            synth.note_off_all(false);
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), DeviceError> {
        drop(self.sequencer.lock_open()?);
        if let Ok(mut synth) = self.synth.lock() {
            synth.note_off_all(true);
        }
        Ok(())
    }
}

impl Drop for SynthDevice {
    fn drop(&mut self) {
        self.sequencer.end();
        if let Some(handle) = self.thread_slot().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::signal::{PlayerSignal, PlayerSignals};
    use crate::midi::event::{pack_short, pack_tempo, STATUS_NOTE_ON};

    struct Harness {
        sequencer: Arc<Sequencer>,
        signals: Arc<PlayerSignals>,
        played: Arc<Mutex<Vec<u32>>>,
        thread: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let sequencer = Arc::new(Sequencer::default());
            let signals = PlayerSignals::new();
            sequencer.begin(signals.notifier()).unwrap();
            sequencer.prepare(4).unwrap();
            // One tick per millisecond
            sequencer.set_time_division(TimeDivision::Metrical(500)).unwrap();

            let played = Arc::new(Mutex::new(Vec::new()));
            let thread = {
                let sequencer = Arc::clone(&sequencer);
                let played = Arc::clone(&played);
                thread::spawn(move || sequencer.run(|m| played.lock().unwrap().push(m)))
            };
            Self {
                sequencer,
                signals,
                played,
                thread: Some(thread),
            }
        }

        fn played(&self) -> Vec<u32> {
            self.played.lock().unwrap().clone()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.sequencer.end();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn note(delta: u32, key: u8) -> MergedEvent {
        MergedEvent::new(delta, pack_short(STATUS_NOTE_ON, 0, key, 100))
    }

    #[test]
    fn test_plays_buffer_in_order_and_returns_it() {
        let harness = Harness::start();
        let events = [note(0, 60), MergedEvent::new(0, pack_tempo(250_000)), note(5, 62)];
        harness.sequencer.submit(&events).unwrap();
        harness.sequencer.restart().unwrap();

        assert_eq!(harness.signals.wait(), PlayerSignal::BufferReturned);
        // Tempo events are consumed by the sequencer, not dispatched
        assert_eq!(harness.played(), vec![events[0].event, events[2].event]);
        assert_eq!(harness.sequencer.lock().tempo, 250_000);
    }

    #[test]
    fn test_opened_stream_starts_paused() {
        let harness = Harness::start();
        harness.sequencer.submit(&[note(0, 60)]).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(harness.played().is_empty());

        harness.sequencer.restart().unwrap();
        assert_eq!(harness.signals.wait(), PlayerSignal::BufferReturned);
        assert_eq!(harness.played().len(), 1);
    }

    #[test]
    fn test_second_buffer_while_in_flight_is_rejected() {
        let harness = Harness::start();
        harness.sequencer.submit(&[note(0, 60)]).unwrap();
        assert!(matches!(
            harness.sequencer.submit(&[note(0, 61)]),
            Err(DeviceError::StillPlaying)
        ));
        assert!(matches!(
            harness.sequencer.submit(&[note(0, 1); 5]),
            Err(DeviceError::BufferTooLarge { len: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_stop_flushes_and_returns_buffer() {
        let harness = Harness::start();
        harness.sequencer.submit(&[note(10_000, 60)]).unwrap();
        harness.sequencer.restart().unwrap();
        harness.sequencer.stop().unwrap();

        assert_eq!(harness.signals.wait(), PlayerSignal::BufferReturned);
        assert!(harness.played().is_empty());
        assert!(harness.sequencer.lock().pending.is_empty());
    }

    #[test]
    fn test_renderer_interleaves_blocks() {
        let mut blocks = 0.0;
        let renderer = StereoRenderer::new(|left: &mut [f32], right: &mut [f32]| {
            blocks += 1.0;
            left.fill(blocks);
            right.fill(-blocks);
        });
        assert_eq!(renderer.channels(), 2);
        assert_eq!(renderer.total_duration(), None);

        let samples: Vec<f32> = renderer.take(RENDER_FRAMES * 2 + 2).collect();
        assert_eq!(&samples[..4], &[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(&samples[RENDER_FRAMES * 2..], &[2.0, -2.0]);
    }

    #[test]
    fn test_calls_fail_when_closed() {
        let sequencer = Sequencer::default();
        assert!(matches!(sequencer.prepare(4), Err(DeviceError::NotOpen)));
        assert!(matches!(sequencer.submit(&[]), Err(DeviceError::NotOpen)));

        let signals = PlayerSignals::new();
        sequencer.begin(signals.notifier()).unwrap();
        assert!(matches!(sequencer.submit(&[]), Err(DeviceError::NotPrepared)));
        assert!(sequencer.begin(signals.notifier()).is_err());
    }
}
