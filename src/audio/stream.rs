//! The song timeline and the small window streamed to the device.
//!
//! A [`Song`] owns the merged event array and a play cursor. A
//! [`StreamWindow`] is refilled from the cursor a few events at a time; the
//! window is kept small so a global volume change reaches the device
//! quickly.

use super::volume::{correct_volume, VolumeState};
use crate::midi::MergedEvent;

/// Maximum number of events submitted to the device per buffer.
pub const STREAM_MAX_EVENTS: usize = 4;

/// The currently registered composition.
#[derive(Debug, Clone, Default)]
pub struct Song {
    /// Merged events in playback order.
    events: Vec<MergedEvent>,
    /// Index of the next event to stream.
    position: usize,
    /// Whether the cursor wraps to the start at the end.
    looping: bool,
}

impl Song {
    /// Creates a song from merged events, cursor at the start.
    pub fn new(events: Vec<MergedEvent>) -> Self {
        Self {
            events,
            position: 0,
            looping: false,
        }
    }

    /// Returns the merged events.
    pub fn events(&self) -> &[MergedEvent] {
        &self.events
    }

    /// Returns the total number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the song has no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the index of the next event to stream.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns true once a non-looping song has streamed every event.
    pub fn is_finished(&self) -> bool {
        !self.looping && self.position >= self.events.len()
    }

    /// Returns whether the song loops.
    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Sets whether the song loops.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Moves the cursor back to the first event.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

/// A bounded scratch buffer of events for one device submission.
#[derive(Debug, Clone)]
pub struct StreamWindow {
    events: [MergedEvent; STREAM_MAX_EVENTS],
    filled: usize,
}

impl StreamWindow {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self {
            events: [MergedEvent::default(); STREAM_MAX_EVENTS],
            filled: 0,
        }
    }

    /// Returns the events filled by the most recent [`fill`](Self::fill).
    pub fn events(&self) -> &[MergedEvent] {
        &self.events[..self.filled]
    }

    /// Returns how many slots the last fill used.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Returns true if the last fill produced nothing.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Returns the number of slots in the window.
    pub fn capacity(&self) -> usize {
        STREAM_MAX_EVENTS
    }

    /// Refills the window from the song's cursor.
    ///
    /// At the end of the song the cursor wraps to the start if the song
    /// loops; otherwise filling stops early. Main-volume events record their
    /// linear value in `volumes` and leave the window with the corrected
    /// device value for the current global scale.
    ///
    /// # Arguments
    ///
    /// * `song` - The song to stream from (its cursor advances)
    /// * `volumes` - Shared channel volume state
    ///
    /// # Returns
    ///
    /// Number of events filled; 0 means a non-looping song has ended
    pub fn fill(&mut self, song: &mut Song, volumes: &VolumeState) -> usize {
        let mut count = 0;

        while count < STREAM_MAX_EVENTS {
            if song.position >= song.events.len() {
                if song.looping && !song.events.is_empty() {
                    song.position = 0;
                } else {
                    break;
                }
            }

            let mut event = song.events[song.position];

            if event.is_main_volume() {
                let linear = event.volume();
                volumes.set_channel(event.channel(), linear);
                event.set_volume(correct_volume(linear, volumes.scale()));
            }

            self.events[count] = event;
            song.position += 1;
            count += 1;
        }

        self.filled = count;
        count
    }
}

impl Default for StreamWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::volume::VOLUME_CORRECTION;
    use crate::midi::event::{main_volume_message, pack_short, STATUS_NOTE_ON};

    fn notes(count: usize) -> Vec<MergedEvent> {
        (0..count)
            .map(|i| MergedEvent::new(10, pack_short(STATUS_NOTE_ON, 0, i as u8, 100)))
            .collect()
    }

    fn keys(window: &StreamWindow) -> Vec<u8> {
        window.events().iter().map(|e| e.data1()).collect()
    }

    #[test]
    fn test_fill_stops_at_end_without_looping() {
        let mut song = Song::new(notes(6));
        let volumes = VolumeState::default();
        let mut window = StreamWindow::new();

        assert_eq!(window.fill(&mut song, &volumes), 4);
        assert_eq!(keys(&window), vec![0, 1, 2, 3]);

        assert_eq!(window.fill(&mut song, &volumes), 2);
        assert_eq!(keys(&window), vec![4, 5]);
        assert!(song.is_finished());

        assert_eq!(window.fill(&mut song, &volumes), 0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_fill_wraps_when_looping() {
        let mut song = Song::new(notes(3));
        song.set_looping(true);
        let volumes = VolumeState::default();
        let mut window = StreamWindow::new();

        let mut streamed = Vec::new();
        for _ in 0..3 {
            assert_eq!(window.fill(&mut song, &volumes), STREAM_MAX_EVENTS);
            streamed.extend(keys(&window));
        }

        // No gap and no duplication across the wrap point
        assert_eq!(streamed, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]);
        assert_eq!(song.position(), 3);
    }

    #[test]
    fn test_looping_empty_song_fills_nothing() {
        let mut song = Song::new(Vec::new());
        song.set_looping(true);
        let mut window = StreamWindow::new();
        assert_eq!(window.fill(&mut song, &VolumeState::default()), 0);
    }

    #[test]
    fn test_volume_events_are_corrected_and_recorded() {
        let mut song = Song::new(vec![
            MergedEvent::new(0, main_volume_message(2, 100)),
            MergedEvent::new(5, pack_short(STATUS_NOTE_ON, 2, 60, 100)),
        ]);
        let volumes = VolumeState::default();
        volumes.set_scale(0.5);
        let mut window = StreamWindow::new();

        assert_eq!(window.fill(&mut song, &volumes), 2);
        assert_eq!(volumes.channel(2), 100);
        assert_eq!(window.events()[0].volume(), VOLUME_CORRECTION[50]);
        assert_eq!(window.events()[0].channel(), 2);
        // The note passes through untouched
        assert_eq!(window.events()[1].data2(), 100);
        // The song itself keeps the unscaled value
        assert_eq!(song.events()[0].volume(), 100);
    }

    #[test]
    fn test_rewind() {
        let mut song = Song::new(notes(2));
        let mut window = StreamWindow::new();
        window.fill(&mut song, &VolumeState::default());
        assert_eq!(song.position(), 2);
        song.rewind();
        assert_eq!(song.position(), 0);
    }
}
