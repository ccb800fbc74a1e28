//! Loudness samples and the RMS integration window
//!
//! The capture pipeline hands over one mean-square value per audio block; the
//! [`RmsWindow`] averages the most recent `rms_seconds` worth of blocks and turns
//! the result into a dBFS reading.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// Reading reported for digital silence, in dBFS
pub const SILENCE_FLOOR_DB: f32 = -100.0;

/// Errors for the RMS window parameter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    #[error("rms_seconds must be a positive finite number, got {0}")]
    NotPositive(f32),
}

/// Latest loudness reading in dBFS, wire shape `{ "loudness": f32 }`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "LoudnessWire")]
pub struct LoudnessSample {
    loudness: f32,
}

#[derive(Deserialize)]
struct LoudnessWire {
    loudness: f32,
}

impl From<LoudnessWire> for LoudnessSample {
    fn from(wire: LoudnessWire) -> Self {
        LoudnessSample::new(wire.loudness)
    }
}

impl LoudnessSample {
    /// Build a sample, mapping silence and NaN onto the floor so the value
    /// always survives JSON encoding.
    pub fn new(db: f32) -> Self {
        let loudness = if db.is_nan() {
            SILENCE_FLOOR_DB
        } else {
            db.max(SILENCE_FLOOR_DB)
        };
        Self { loudness }
    }

    /// Convert a linear mean-square power into dBFS
    pub fn from_mean_square(mean_square: f32) -> Self {
        let rms = if mean_square.is_finite() {
            mean_square.max(0.0).sqrt().min(1.0)
        } else {
            0.0
        };
        if rms <= 0.0 {
            Self::new(SILENCE_FLOOR_DB)
        } else {
            Self::new(20.0 * rms.log10())
        }
    }

    pub fn db(&self) -> f32 {
        self.loudness
    }

    /// Position on a 0..=100 meter spanning the floor to full scale
    pub fn meter_percent(&self) -> f32 {
        (self.loudness - SILENCE_FLOOR_DB).clamp(0.0, 100.0)
    }
}

/// RMS integration window length
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct RmsSeconds(f32);

impl RmsSeconds {
    pub const DEFAULT: RmsSeconds = RmsSeconds(3.0);

    pub fn new(seconds: f32) -> Result<Self, WindowError> {
        if seconds.is_finite() && seconds > 0.0 {
            Ok(Self(seconds))
        } else {
            Err(WindowError::NotPositive(seconds))
        }
    }

    pub fn seconds(&self) -> f32 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f32(self.0).unwrap_or(Duration::MAX)
    }
}

impl Default for RmsSeconds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f32> for RmsSeconds {
    type Error = WindowError;

    fn try_from(seconds: f32) -> Result<Self, Self::Error> {
        Self::new(seconds)
    }
}

impl From<RmsSeconds> for f32 {
    fn from(window: RmsSeconds) -> Self {
        window.0
    }
}

/// Sliding mean over per-block mean-square values
#[derive(Debug, Clone)]
pub struct RmsWindow {
    blocks: VecDeque<f32>,
    block_rate_hz: f32,
}

impl RmsWindow {
    /// `block_rate_hz` is how many blocks the capture delivers per second
    /// (sample rate divided by block length).
    pub fn new(block_rate_hz: f32) -> Self {
        Self {
            blocks: VecDeque::new(),
            block_rate_hz,
        }
    }

    /// Number of blocks covering `window`, never less than one
    pub fn target_len(&self, window: RmsSeconds) -> usize {
        let blocks = (self.block_rate_hz * window.seconds()).round();
        if blocks.is_finite() && blocks >= 1.0 {
            blocks as usize
        } else {
            1
        }
    }

    /// Add one block and return the loudness over the current window
    pub fn push(&mut self, mean_square: f32, window: RmsSeconds) -> LoudnessSample {
        let mean_square = if mean_square.is_finite() {
            mean_square.max(0.0)
        } else {
            0.0
        };
        self.blocks.push_back(mean_square);

        let target = self.target_len(window);
        if self.blocks.len() > target {
            let excess = self.blocks.len() - target;
            self.blocks.drain(..excess);
        }

        let mean = self.blocks.iter().sum::<f32>() / self.blocks.len() as f32;
        LoudnessSample::from_mean_square(mean)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// Mean-square power of one block of samples
pub fn mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_is_zero_db() {
        let sample = LoudnessSample::from_mean_square(1.0);
        assert!(sample.db().abs() < 1e-6);

        // Clipped input cannot exceed full scale
        assert!(LoudnessSample::from_mean_square(4.0).db().abs() < 1e-6);
    }

    #[test]
    fn test_silence_maps_to_floor() {
        assert_eq!(LoudnessSample::from_mean_square(0.0).db(), SILENCE_FLOOR_DB);
        assert_eq!(LoudnessSample::new(f32::NEG_INFINITY).db(), SILENCE_FLOOR_DB);
        assert_eq!(LoudnessSample::new(f32::NAN).db(), SILENCE_FLOOR_DB);
    }

    #[test]
    fn test_minus_twenty_db() {
        // rms 0.1 -> -20 dB
        let sample = LoudnessSample::from_mean_square(0.01);
        assert!((sample.db() + 20.0).abs() < 1e-4);
        assert!((sample.meter_percent() - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_rms_seconds_validation() {
        assert!(RmsSeconds::new(0.0).is_err());
        assert!(RmsSeconds::new(-1.0).is_err());
        assert!(RmsSeconds::new(f32::INFINITY).is_err());
        assert_eq!(RmsSeconds::new(2.5).unwrap().seconds(), 2.5);
        assert!(serde_json::from_str::<RmsSeconds>("-3.0").is_err());
    }

    #[test]
    fn test_window_length_follows_rms_seconds() {
        // 48 kHz with 4000-frame blocks
        let mut window = RmsWindow::new(12.0);
        let three = RmsSeconds::new(3.0).unwrap();
        assert_eq!(window.target_len(three), 36);

        for _ in 0..50 {
            window.push(0.01, three);
        }
        assert_eq!(window.len(), 36);

        // Shrinking the window trims from the front on the next block
        let one = RmsSeconds::new(1.0).unwrap();
        window.push(0.01, one);
        assert_eq!(window.len(), 12);
    }

    #[test]
    fn test_window_never_empty() {
        let mut window = RmsWindow::new(1.0);
        let tiny = RmsSeconds::new(0.01).unwrap();
        assert_eq!(window.target_len(tiny), 1);
        let sample = window.push(1.0, tiny);
        assert!(sample.db().abs() < 1e-6);
    }

    #[test]
    fn test_window_averages_power() {
        let mut window = RmsWindow::new(2.0);
        let one = RmsSeconds::new(1.0).unwrap();
        window.push(0.0, one);
        let sample = window.push(0.02, one);
        // mean power 0.01 -> -20 dB
        assert!((sample.db() + 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_mean_square_of_block() {
        assert_eq!(mean_square(&[]), 0.0);
        assert!((mean_square(&[0.5, -0.5, 0.5, -0.5]) - 0.25).abs() < 1e-6);
    }
}
