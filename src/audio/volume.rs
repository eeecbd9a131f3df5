//! Perceptual volume remapping.
//!
//! Stream devices tend to follow a steep loudness curve, so channel volumes
//! are passed through a fixed correction table after being scaled by the
//! global volume factor. The table values are part of observable output and
//! must not be recomputed from a formula.

use crate::midi::CHANNEL_COUNT;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Linear channel volume (0-127) to device volume (0-127).
pub const VOLUME_CORRECTION: [u8; 128] = [
    0, 4, 7, 11, 13, 14, 16, 18, //
    21, 22, 23, 24, 24, 24, 25, 25, //
    25, 26, 26, 27, 27, 27, 28, 28, //
    29, 29, 29, 30, 30, 31, 31, 32, //
    32, 32, 33, 33, 34, 34, 35, 35, //
    36, 37, 37, 38, 38, 39, 39, 40, //
    40, 41, 42, 42, 43, 43, 44, 45, //
    45, 46, 47, 47, 48, 49, 49, 50, //
    51, 52, 52, 53, 54, 55, 56, 56, //
    57, 58, 59, 60, 61, 62, 62, 63, //
    64, 65, 66, 67, 68, 69, 70, 71, //
    72, 73, 74, 75, 77, 78, 79, 80, //
    81, 82, 84, 85, 86, 87, 89, 90, //
    91, 92, 94, 95, 96, 98, 99, 101, //
    102, 104, 105, 107, 108, 110, 112, 113, //
    115, 117, 118, 120, 122, 123, 125, 127, //
];

/// Corrects a linear channel volume for the device at the given scale.
///
/// The scaled value is truncated toward zero before the table lookup.
///
/// # Arguments
///
/// * `linear` - Channel volume as sent by the song (0-127)
/// * `scale` - Global volume factor (0.0-1.0)
pub fn correct_volume(linear: u8, scale: f32) -> u8 {
    let index = (linear.min(127) as f32 * scale) as usize;
    VOLUME_CORRECTION[index.min(127)]
}

/// Volume state shared between the caller and the player thread.
///
/// Channel volumes are written by the player thread as volume events stream
/// out, and read by the caller whenever the global scale changes. Every field
/// is a single atomic word, so readers never see a torn value.
#[derive(Debug)]
pub struct VolumeState {
    /// Last linear volume seen on each channel.
    channels: [AtomicU8; CHANNEL_COUNT],
    /// Global scale factor, stored as `f32` bits.
    scale: AtomicU32,
}

impl VolumeState {
    /// Creates a volume state with every channel at `default_volume` and a
    /// scale of 1.0.
    pub fn new(default_volume: u8) -> Self {
        Self {
            channels: std::array::from_fn(|_| AtomicU8::new(default_volume.min(127))),
            scale: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Resets every channel to `volume`.
    pub fn reset_channels(&self, volume: u8) {
        for channel in &self.channels {
            channel.store(volume.min(127), Ordering::Relaxed);
        }
    }

    /// Records the last linear volume for a channel.
    pub fn set_channel(&self, channel: u8, volume: u8) {
        if let Some(slot) = self.channels.get(channel as usize) {
            slot.store(volume.min(127), Ordering::Relaxed);
        }
    }

    /// Returns the last linear volume for a channel.
    pub fn channel(&self, channel: u8) -> u8 {
        self.channels
            .get(channel as usize)
            .map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Returns the current global scale factor.
    pub fn scale(&self) -> f32 {
        f32::from_bits(self.scale.load(Ordering::Relaxed))
    }

    /// Sets the global scale factor.
    pub fn set_scale(&self, scale: f32) {
        self.scale.store(scale.to_bits(), Ordering::Relaxed);
    }

    /// Returns the device volume for a channel at the current scale.
    pub fn corrected(&self, channel: u8) -> u8 {
        correct_volume(self.channel(channel), self.scale())
    }
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_monotonic() {
        assert!(VOLUME_CORRECTION.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(VOLUME_CORRECTION[0], 0);
        assert_eq!(VOLUME_CORRECTION[127], 127);
    }

    #[test]
    fn test_correction_monotonic_at_fixed_scale() {
        for scale in [0.2f32, 0.5, 0.75, 1.0] {
            let values: Vec<u8> = (0..=127u8).map(|v| correct_volume(v, scale)).collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]), "scale {}", scale);
        }
    }

    #[test]
    fn test_correction_truncates() {
        // 100 * 0.75 = 75
        assert_eq!(correct_volume(100, 0.75), VOLUME_CORRECTION[75]);
        // 127 * 0.2 = 25.4 -> 25
        assert_eq!(correct_volume(127, 0.2), VOLUME_CORRECTION[25]);
        assert_eq!(correct_volume(127, 1.0), 127);
    }

    #[test]
    fn test_mute_is_exact() {
        let state = VolumeState::new(100);
        state.set_channel(3, 127);
        state.set_scale(0.0);
        for channel in 0..CHANNEL_COUNT as u8 {
            assert_eq!(state.corrected(channel), 0);
        }
    }

    #[test]
    fn test_channel_bookkeeping() {
        let state = VolumeState::new(100);
        assert_eq!(state.channel(0), 100);
        assert_eq!(state.scale(), 1.0);

        state.set_channel(5, 64);
        assert_eq!(state.channel(5), 64);

        // Out-of-range channels are ignored
        state.set_channel(16, 1);
        assert_eq!(state.channel(16), 0);

        state.reset_channels(100);
        assert_eq!(state.channel(5), 100);
    }
}
