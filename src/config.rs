//! Engine configuration.
//!
//! Holds the tunables of the streaming engine. Stored as JSON so a host
//! application can ship its own volume mapping without recompiling.

use crate::midi::DEFAULT_TEMPO;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunable settings for the music engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Volume scale at the lowest audible UI level (level 1).
    pub min_volume_scale: f32,

    /// Volume scale at the highest UI level.
    pub max_volume_scale: f32,

    /// Highest coarse UI volume level. Level 0 always mutes.
    pub max_volume_level: u32,

    /// Tempo pushed to the device on every registration, in microseconds
    /// per quarter note.
    pub initial_tempo: u32,

    /// Linear volume assumed for every channel until the song sets one (0-127).
    pub default_channel_volume: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_volume_scale: 0.20,
            max_volume_scale: 0.75,
            max_volume_level: 15,
            initial_tempo: DEFAULT_TEMPO,
            default_channel_volume: 100,
        }
    }
}

impl EngineConfig {
    /// Maps a coarse UI volume level onto a continuous scale factor.
    ///
    /// Level 0 mutes (exactly 0.0). Levels 1 through `max_volume_level`
    /// interpolate linearly between the minimum and maximum scale; higher
    /// levels are clamped.
    ///
    /// # Arguments
    ///
    /// * `level` - UI volume level
    ///
    /// # Returns
    ///
    /// The scale factor applied to channel volumes
    pub fn volume_scale(&self, level: u32) -> f32 {
        if level == 0 {
            return 0.0;
        }

        let steps = self.max_volume_level.saturating_sub(1);
        if steps == 0 {
            return self.max_volume_scale;
        }

        let level = level.min(self.max_volume_level);
        let t = (level - 1) as f32 / steps as f32;
        self.min_volume_scale * (1.0 - t) + self.max_volume_scale * t
    }

    /// Serializes the configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Saves the configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_scale_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.volume_scale(0), 0.0);
        // The end points are exact
        assert_eq!(config.volume_scale(1), 0.20);
        assert_eq!(config.volume_scale(15), 0.75);
        assert_eq!(config.volume_scale(99), 0.75);
        assert!((config.volume_scale(8) - 0.475).abs() < 1e-6);
    }

    #[test]
    fn test_volume_scale_is_increasing() {
        let config = EngineConfig::default();
        let scales: Vec<f32> = (0..=config.max_volume_level)
            .map(|level| config.volume_scale(level))
            .collect();
        assert!(scales.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "max_volume_level": 10 }"#).unwrap();
        assert_eq!(config.max_volume_level, 10);
        assert_eq!(config.initial_tempo, DEFAULT_TEMPO);
        assert_eq!(config.default_channel_volume, 100);
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig {
            max_volume_scale: 0.9,
            ..EngineConfig::default()
        };
        let parsed = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
