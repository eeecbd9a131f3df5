//! Standard MIDI File (SMF) access for the stream merger.
//!
//! Parsing itself is delegated to `midly`. This module only exposes what the
//! merger needs: the track count, per-track delta-timed iteration, the file's
//! time division, and the total event count for sizing the merged array.

use super::event::RawEvent;
use midly::{Fps, Smf, Timing};
use std::iter::Peekable;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading a MIDI file.
#[derive(Debug, Error)]
pub enum MidiFileError {
    /// The bytes are not a valid SMF container.
    #[error("MIDI parse error: {0}")]
    Parse(#[from] midly::Error),
    /// The header parsed but the file holds no tracks.
    #[error("MIDI file contains no tracks")]
    Empty,
}

/// A cursor over one source track.
///
/// The merger only ever peeks at the time until the next event and then
/// consumes it; a cursor is exhausted once `delta_time` returns `None`.
pub trait TrackIter {
    /// Ticks until the next pending event, or `None` once the track is exhausted.
    fn delta_time(&mut self) -> Option<u32>;

    /// Consumes and returns the next event.
    fn next_event(&mut self) -> Option<RawEvent>;
}

impl<I> TrackIter for Peekable<I>
where
    I: Iterator<Item = RawEvent>,
{
    fn delta_time(&mut self) -> Option<u32> {
        self.peek().map(|event| event.delta)
    }

    fn next_event(&mut self) -> Option<RawEvent> {
        self.next()
    }
}

/// A cursor over one track of a parsed file.
pub struct TrackCursor<'f, 'a> {
    events: Peekable<std::slice::Iter<'f, midly::TrackEvent<'a>>>,
}

impl TrackIter for TrackCursor<'_, '_> {
    fn delta_time(&mut self) -> Option<u32> {
        self.events.peek().map(|event| event.delta.as_int())
    }

    fn next_event(&mut self) -> Option<RawEvent> {
        self.events.next().map(RawEvent::from)
    }
}

/// The file's timing resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDivision {
    /// Ticks per quarter note.
    Metrical(u16),
    /// SMPTE timecode: frames per second and ticks per frame.
    Timecode { fps: u8, subframes: u8 },
}

impl TimeDivision {
    /// Returns the 16-bit header word, as stream devices expect it.
    ///
    /// Timecode divisions store the negated frame rate in the high byte.
    pub fn to_raw(self) -> u16 {
        match self {
            TimeDivision::Metrical(ticks) => ticks & 0x7FFF,
            TimeDivision::Timecode { fps, subframes } => {
                let high = (-(fps as i8)) as u8;
                ((high as u16) << 8) | subframes as u16
            }
        }
    }

    /// Decodes a 16-bit header word.
    pub fn from_raw(raw: u16) -> Self {
        if raw & 0x8000 == 0 {
            TimeDivision::Metrical(raw)
        } else {
            let fps = (-((raw >> 8) as u8 as i8)) as u8;
            TimeDivision::Timecode {
                fps,
                subframes: (raw & 0xFF) as u8,
            }
        }
    }

    /// Converts a tick count into wall-clock time.
    ///
    /// # Arguments
    ///
    /// * `ticks` - Number of ticks
    /// * `tempo` - Microseconds per quarter note (ignored for timecode)
    pub fn tick_duration(self, ticks: u32, tempo: u32) -> Duration {
        let micros = match self {
            TimeDivision::Metrical(0) => 0,
            TimeDivision::Metrical(tpq) => ticks as u64 * tempo as u64 / tpq as u64,
            TimeDivision::Timecode { fps, subframes } => {
                let per_second = fps as u64 * subframes.max(1) as u64;
                if per_second == 0 {
                    0
                } else {
                    ticks as u64 * 1_000_000 / per_second
                }
            }
        };
        Duration::from_micros(micros)
    }
}

impl From<Timing> for TimeDivision {
    fn from(timing: Timing) -> Self {
        match timing {
            Timing::Metrical(tpq) => TimeDivision::Metrical(tpq.as_int()),
            Timing::Timecode(fps, subframes) => TimeDivision::Timecode {
                fps: match fps {
                    Fps::Fps24 => 24,
                    Fps::Fps25 => 25,
                    Fps::Fps29 => 29,
                    Fps::Fps30 => 30,
                },
                subframes,
            },
        }
    }
}

/// A parsed multi-track MIDI file.
pub struct MidiFile<'a> {
    smf: Smf<'a>,
}

impl<'a> MidiFile<'a> {
    /// Parses raw SMF bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid MIDI container or hold
    /// no tracks.
    pub fn parse(data: &'a [u8]) -> Result<Self, MidiFileError> {
        let smf = Smf::parse(data)?;
        if smf.tracks.is_empty() {
            return Err(MidiFileError::Empty);
        }
        Ok(Self { smf })
    }

    /// Returns the number of tracks.
    pub fn track_count(&self) -> usize {
        self.smf.tracks.len()
    }

    /// Returns the total number of events across all tracks.
    pub fn event_count(&self) -> usize {
        self.smf.tracks.iter().map(|track| track.len()).sum()
    }

    /// Returns the file's time division.
    pub fn time_division(&self) -> TimeDivision {
        self.smf.header.timing.into()
    }

    /// Returns a cursor over the given track, or `None` if out of range.
    pub fn track(&self, index: usize) -> Option<TrackCursor<'_, 'a>> {
        self.smf.tracks.get(index).map(|track| TrackCursor {
            events: track.iter().peekable(),
        })
    }

    /// Returns cursors over every track, in file order.
    pub fn tracks(&self) -> Vec<TrackCursor<'_, 'a>> {
        (0..self.track_count())
            .filter_map(|index| self.track(index))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Format, Header, MetaMessage, MidiMessage, TrackEvent, TrackEventKind};

    /// A (delta, kind) description of a fixture event.
    pub(crate) enum Fixture {
        NoteOn(u8, u8),
        Volume(u8, u8),
        Tempo(u32),
        Text,
    }

    /// Writes an SMF with the given tracks using midly's own writer.
    pub(crate) fn write_smf(division: u16, tracks: &[Vec<(u32, Fixture)>]) -> Vec<u8> {
        let text: &'static [u8] = b"fixture";
        let tracks: Vec<Vec<TrackEvent<'static>>> = tracks
            .iter()
            .map(|track| {
                let mut events: Vec<TrackEvent<'static>> = track
                    .iter()
                    .map(|(delta, fixture)| TrackEvent {
                        delta: u28::new(*delta),
                        kind: match fixture {
                            Fixture::NoteOn(channel, key) => TrackEventKind::Midi {
                                channel: u4::new(*channel),
                                message: MidiMessage::NoteOn {
                                    key: u7::new(*key),
                                    vel: u7::new(100),
                                },
                            },
                            Fixture::Volume(channel, value) => TrackEventKind::Midi {
                                channel: u4::new(*channel),
                                message: MidiMessage::Controller {
                                    controller: u7::new(7),
                                    value: u7::new(*value),
                                },
                            },
                            Fixture::Tempo(tempo) => {
                                TrackEventKind::Meta(MetaMessage::Tempo(u24::new(*tempo)))
                            }
                            Fixture::Text => TrackEventKind::Meta(MetaMessage::Text(text)),
                        },
                    })
                    .collect();
                events.push(TrackEvent {
                    delta: u28::new(0),
                    kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
                });
                events
            })
            .collect();

        let smf = Smf {
            header: Header::new(Format::Parallel, Timing::Metrical(u15::new(division))),
            tracks,
        };
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).expect("writing to a Vec cannot fail");
        bytes
    }

    #[test]
    fn test_parse_reports_counts_and_division() {
        let bytes = write_smf(
            96,
            &[
                vec![(0, Fixture::Tempo(400_000)), (10, Fixture::NoteOn(0, 60))],
                vec![(5, Fixture::NoteOn(1, 64))],
            ],
        );
        let file = MidiFile::parse(&bytes).unwrap();

        assert_eq!(file.track_count(), 2);
        // Two events + end of track, one event + end of track
        assert_eq!(file.event_count(), 5);
        assert_eq!(file.time_division(), TimeDivision::Metrical(96));
        assert!(file.track(2).is_none());
    }

    #[test]
    fn test_track_cursor_peeks_before_consuming() {
        let bytes = write_smf(96, &[vec![(7, Fixture::NoteOn(0, 60))]]);
        let file = MidiFile::parse(&bytes).unwrap();
        let mut cursor = file.track(0).unwrap();

        assert_eq!(cursor.delta_time(), Some(7));
        assert_eq!(cursor.delta_time(), Some(7));
        let event = cursor.next_event().unwrap();
        assert_eq!(event.delta, 7);

        // End of track meta remains, then exhaustion
        assert_eq!(cursor.delta_time(), Some(0));
        assert!(cursor.next_event().is_some());
        assert_eq!(cursor.delta_time(), None);
        assert!(cursor.next_event().is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            MidiFile::parse(b"not a midi file"),
            Err(MidiFileError::Parse(_))
        ));
    }

    #[test]
    fn test_time_division_raw_words() {
        assert_eq!(TimeDivision::Metrical(480).to_raw(), 480);
        assert_eq!(TimeDivision::from_raw(480), TimeDivision::Metrical(480));

        let smpte = TimeDivision::Timecode { fps: 25, subframes: 40 };
        assert_eq!(smpte.to_raw(), 0xE728);
        assert_eq!(TimeDivision::from_raw(0xE728), smpte);
    }

    #[test]
    fn test_tick_duration() {
        // 480 ticks at 120 BPM is half a second
        let division = TimeDivision::Metrical(480);
        assert_eq!(division.tick_duration(480, 500_000), Duration::from_millis(500));

        let smpte = TimeDivision::Timecode { fps: 25, subframes: 40 };
        assert_eq!(smpte.tick_duration(1000, 500_000), Duration::from_secs(1));
    }
}
