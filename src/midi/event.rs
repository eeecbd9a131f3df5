//! MIDI event representations.
//!
//! Two forms are used on the way from file to device:
//! - [`RawEvent`]: a delta-timed event as read from a single source track.
//! - [`MergedEvent`]: the flat, playback-ready form stored in a song, with a
//!   packed 32-bit event word laid out the way stream devices consume it.

use midly::{MetaMessage, MidiMessage, TrackEvent, TrackEventKind};

/// Event tag for a packed short (channel voice) message.
pub const EVENT_TAG_SHORT: u32 = 0x00;

/// Event tag for a packed tempo change.
pub const EVENT_TAG_TEMPO: u32 = 0x01;

/// Status nibbles for channel voice messages.
pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_AFTERTOUCH: u8 = 0xA0;
pub const STATUS_CONTROLLER: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_CHANNEL_AFTERTOUCH: u8 = 0xD0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;

/// Controller number for channel main volume (CC7).
pub const CONTROLLER_MAIN_VOLUME: u8 = 7;

/// The kind of a raw track event, with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Note off: channel, key, velocity
    NoteOff { channel: u8, key: u8, velocity: u8 },
    /// Note on: channel, key, velocity (velocity 0 is passed through untouched)
    NoteOn { channel: u8, key: u8, velocity: u8 },
    /// Polyphonic key pressure: channel, key, pressure
    Aftertouch { channel: u8, key: u8, pressure: u8 },
    /// Control change: channel, controller, value
    Controller { channel: u8, controller: u8, value: u8 },
    /// Program change: channel, program
    ProgramChange { channel: u8, program: u8 },
    /// Channel pressure: channel, pressure
    ChannelAftertouch { channel: u8, pressure: u8 },
    /// Pitch bend split into its 7-bit halves.
    PitchBend { channel: u8, lsb: u8, msb: u8 },
    /// Set tempo meta event, in microseconds per quarter note (24-bit).
    Tempo(u32),
    /// Anything the stream has no use for (SysEx, text, end of track, ...).
    Other,
}

/// A single event from one source track, timed relative to the previous
/// event of the same track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Ticks since the previous event in the same track.
    pub delta: u32,
    /// What the event does.
    pub kind: EventKind,
}

impl RawEvent {
    /// Creates a new raw event.
    pub fn new(delta: u32, kind: EventKind) -> Self {
        Self { delta, kind }
    }

    /// Packs the event into its stream word, or `None` for kinds the stream
    /// drops.
    pub fn pack(&self) -> Option<u32> {
        let word = match self.kind {
            EventKind::Tempo(tempo) => pack_tempo(tempo),
            EventKind::NoteOff { channel, key, velocity } => {
                pack_short(STATUS_NOTE_OFF, channel, key, velocity)
            }
            EventKind::NoteOn { channel, key, velocity } => {
                pack_short(STATUS_NOTE_ON, channel, key, velocity)
            }
            EventKind::Aftertouch { channel, key, pressure } => {
                pack_short(STATUS_AFTERTOUCH, channel, key, pressure)
            }
            EventKind::Controller { channel, controller, value } => {
                pack_short(STATUS_CONTROLLER, channel, controller, value)
            }
            EventKind::PitchBend { channel, lsb, msb } => {
                pack_short(STATUS_PITCH_BEND, channel, lsb, msb)
            }
            // One data byte only; the second is forced to zero
            EventKind::ProgramChange { channel, program } => {
                pack_short(STATUS_PROGRAM_CHANGE, channel, program, 0)
            }
            EventKind::ChannelAftertouch { channel, pressure } => {
                pack_short(STATUS_CHANNEL_AFTERTOUCH, channel, pressure, 0)
            }
            EventKind::Other => return None,
        };
        Some(word)
    }
}

impl From<&TrackEvent<'_>> for RawEvent {
    fn from(event: &TrackEvent<'_>) -> Self {
        let kind = match event.kind {
            TrackEventKind::Midi { channel, message } => {
                let channel = channel.as_int();
                match message {
                    MidiMessage::NoteOff { key, vel } => EventKind::NoteOff {
                        channel,
                        key: key.as_int(),
                        velocity: vel.as_int(),
                    },
                    MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                        channel,
                        key: key.as_int(),
                        velocity: vel.as_int(),
                    },
                    MidiMessage::Aftertouch { key, vel } => EventKind::Aftertouch {
                        channel,
                        key: key.as_int(),
                        pressure: vel.as_int(),
                    },
                    MidiMessage::Controller { controller, value } => EventKind::Controller {
                        channel,
                        controller: controller.as_int(),
                        value: value.as_int(),
                    },
                    MidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                        channel,
                        program: program.as_int(),
                    },
                    MidiMessage::ChannelAftertouch { vel } => EventKind::ChannelAftertouch {
                        channel,
                        pressure: vel.as_int(),
                    },
                    MidiMessage::PitchBend { bend } => {
                        let raw = bend.0.as_int();
                        EventKind::PitchBend {
                            channel,
                            lsb: (raw & 0x7F) as u8,
                            msb: ((raw >> 7) & 0x7F) as u8,
                        }
                    }
                }
            }
            TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => EventKind::Tempo(tempo.as_int()),
            _ => EventKind::Other,
        };

        Self {
            delta: event.delta.as_int(),
            kind,
        }
    }
}

/// Packs a channel voice message into a stream word.
pub fn pack_short(status: u8, channel: u8, data1: u8, data2: u8) -> u32 {
    (status & 0xF0) as u32
        | (channel & 0x0F) as u32
        | ((data1 as u32) << 8)
        | ((data2 as u32) << 16)
        | (EVENT_TAG_SHORT << 24)
}

/// Packs a tempo change into a stream word.
pub fn pack_tempo(micros_per_quarter: u32) -> u32 {
    (micros_per_quarter & 0x00FF_FFFF) | (EVENT_TAG_TEMPO << 24)
}

/// Builds the immediate main-volume message for a channel.
pub fn main_volume_message(channel: u8, volume: u8) -> u32 {
    pack_short(STATUS_CONTROLLER, channel, CONTROLLER_MAIN_VOLUME, volume & 0x7F)
}

/// A playback-ready event: delta time from the previous merged event, a
/// stream identifier, and the packed event word.
///
/// The layout matches the short form of a stream device event record, so a
/// slice of these can be handed to a driver as-is.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergedEvent {
    /// Ticks since the previous merged event.
    pub delta_time: u32,
    /// Always 0: there is a single logical stream.
    pub stream_id: u32,
    /// Packed event word.
    pub event: u32,
}

impl MergedEvent {
    /// Creates a merged event on stream 0.
    pub fn new(delta_time: u32, event: u32) -> Self {
        Self {
            delta_time,
            stream_id: 0,
            event,
        }
    }

    /// Returns the event tag (short message or tempo).
    pub fn tag(&self) -> u32 {
        self.event >> 24
    }

    /// Returns true if this is a tempo change.
    pub fn is_tempo(&self) -> bool {
        self.tag() == EVENT_TAG_TEMPO
    }

    /// Returns the tempo in microseconds per quarter note (tempo events only).
    pub fn tempo(&self) -> u32 {
        self.event & 0x00FF_FFFF
    }

    /// Returns the full status byte of a short message.
    pub fn status(&self) -> u8 {
        (self.event & 0xFF) as u8
    }

    /// Returns the message type nibble (e.g. `0xB0` for a controller).
    pub fn message_type(&self) -> u8 {
        (self.event & 0xF0) as u8
    }

    /// Returns the MIDI channel (0-15).
    pub fn channel(&self) -> u8 {
        (self.event & 0x0F) as u8
    }

    /// Returns the first data byte.
    pub fn data1(&self) -> u8 {
        ((self.event >> 8) & 0xFF) as u8
    }

    /// Returns the second data byte.
    pub fn data2(&self) -> u8 {
        ((self.event >> 16) & 0xFF) as u8
    }

    /// Returns the 7-bit volume field of a controller message.
    pub fn volume(&self) -> u8 {
        ((self.event & 0x007F_0000) >> 16) as u8
    }

    /// Returns true if this is a main-volume controller message.
    pub fn is_main_volume(&self) -> bool {
        !self.is_tempo()
            && self.message_type() == STATUS_CONTROLLER
            && self.data1() == CONTROLLER_MAIN_VOLUME
    }

    /// Overwrites the volume field in place, leaving every other bit alone.
    pub fn set_volume(&mut self, volume: u8) {
        self.event = (self.event & 0xFF00_FFFF) | (((volume & 0x7F) as u32) << 16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_short_layout() {
        let word = pack_short(STATUS_NOTE_ON, 3, 60, 100);
        assert_eq!(word, 0x0064_3C93);

        let event = MergedEvent::new(0, word);
        assert!(!event.is_tempo());
        assert_eq!(event.message_type(), STATUS_NOTE_ON);
        assert_eq!(event.channel(), 3);
        assert_eq!(event.data1(), 60);
        assert_eq!(event.data2(), 100);
    }

    #[test]
    fn test_pack_tempo_layout() {
        let event = MergedEvent::new(0, pack_tempo(500_000));
        assert!(event.is_tempo());
        assert_eq!(event.tempo(), 500_000);
        assert_eq!(event.event, 0x0107_A120);
    }

    #[test]
    fn test_single_byte_messages_zero_second_byte() {
        let program = RawEvent::new(0, EventKind::ProgramChange { channel: 2, program: 40 });
        assert_eq!(program.pack(), Some(0x0000_28C2));

        let pressure = RawEvent::new(0, EventKind::ChannelAftertouch { channel: 1, pressure: 90 });
        assert_eq!(pressure.pack(), Some(0x0000_5AD1));
    }

    #[test]
    fn test_other_events_are_dropped() {
        assert_eq!(RawEvent::new(10, EventKind::Other).pack(), None);
    }

    #[test]
    fn test_main_volume_detection_and_rewrite() {
        let mut event = MergedEvent::new(5, main_volume_message(9, 100));
        assert!(event.is_main_volume());
        assert_eq!(event.volume(), 100);

        event.set_volume(42);
        assert_eq!(event.volume(), 42);
        assert_eq!(event.channel(), 9);
        assert_eq!(event.data1(), CONTROLLER_MAIN_VOLUME);
        assert_eq!(event.delta_time, 5);

        let pan = MergedEvent::new(0, pack_short(STATUS_CONTROLLER, 0, 10, 64));
        assert!(!pan.is_main_volume());
    }

    #[test]
    fn test_tempo_word_is_never_mistaken_for_volume() {
        // 0x0007B0 in the low bytes looks like CC7 on channel 0
        let event = MergedEvent::new(0, pack_tempo(0x0007B0));
        assert!(!event.is_main_volume());
    }

    #[test]
    fn test_pitch_bend_from_midly() {
        use midly::num::{u14, u28, u4};
        use midly::PitchBend;

        let event = TrackEvent {
            delta: u28::new(12),
            kind: TrackEventKind::Midi {
                channel: u4::new(5),
                message: MidiMessage::PitchBend {
                    bend: PitchBend(u14::new(0x2000)),
                },
            },
        };
        let raw = RawEvent::from(&event);
        assert_eq!(raw.delta, 12);
        assert_eq!(
            raw.kind,
            EventKind::PitchBend {
                channel: 5,
                lsb: 0x00,
                msb: 0x40
            }
        );
    }
}
