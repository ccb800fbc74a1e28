//! Threshold model for the loudness comfort band
//!
//! A [`ThresholdSet`] is the `{too_loud, too_quiet, grace}` triple in dB relative
//! to digital full scale. It is never patched in place: field replacement and
//! relative shifts both produce a complete new value that has already passed
//! validation, so every copy in circulation is usable as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThresholdError>;

/// Errors produced when building or editing a threshold set
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("{field} must be a finite number of decibels, got {value}")]
    NonFinite { field: ThresholdField, value: f32 },

    #[error("grace must not be negative, got {0} dB")]
    NegativeGrace(f32),

    #[error("too_quiet ({too_quiet} dB) must be below too_loud ({too_loud} dB)")]
    Inverted { too_loud: f32, too_quiet: f32 },

    #[error("shift must be a finite number of decibels, got {0}")]
    NonFiniteShift(f32),

    #[error("unknown threshold field: {0}")]
    UnknownField(String),
}

/// Names one field of a [`ThresholdSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdField {
    TooLoud,
    TooQuiet,
    Grace,
}

impl ThresholdField {
    pub const ALL: [ThresholdField; 3] = [
        ThresholdField::TooLoud,
        ThresholdField::TooQuiet,
        ThresholdField::Grace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdField::TooLoud => "too_loud",
            ThresholdField::TooQuiet => "too_quiet",
            ThresholdField::Grace => "grace",
        }
    }
}

impl fmt::Display for ThresholdField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdField {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "too_loud" | "too-loud" => Ok(ThresholdField::TooLoud),
            // `too_quite` is the legacy spelling some producers still emit
            "too_quiet" | "too-quiet" | "too_quite" => Ok(ThresholdField::TooQuiet),
            "grace" => Ok(ThresholdField::Grace),
            other => Err(ThresholdError::UnknownField(other.to_string())),
        }
    }
}

/// Relative shift command issued by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Adjustment {
    Louder,
    Quieter,
}

impl Adjustment {
    /// Default shift applied per command, in dB
    pub const DEFAULT_STEP_DB: f32 = 6.0;

    /// Signed shift for a step size
    pub fn delta(self, step_db: f32) -> f32 {
        match self {
            Adjustment::Louder => step_db,
            Adjustment::Quieter => -step_db,
        }
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::Louder => f.write_str("louder"),
            Adjustment::Quieter => f.write_str("quieter"),
        }
    }
}

/// Comfort band thresholds with their hysteresis margin
///
/// Invariants: every field is finite, `grace >= 0` and `too_quiet < too_loud`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholds")]
pub struct ThresholdSet {
    too_loud: f32,
    too_quiet: f32,
    grace: f32,
}

#[derive(Deserialize)]
struct RawThresholds {
    too_loud: f32,
    #[serde(alias = "too_quite")]
    too_quiet: f32,
    grace: f32,
}

impl TryFrom<RawThresholds> for ThresholdSet {
    type Error = ThresholdError;

    fn try_from(raw: RawThresholds) -> Result<Self> {
        Self::new(raw.too_loud, raw.too_quiet, raw.grace)
    }
}

impl ThresholdSet {
    /// Seed used by the viewer surface
    pub const VIEWER_SEED: ThresholdSet = ThresholdSet {
        too_loud: -20.0,
        too_quiet: -80.0,
        grace: 8.0,
    };

    /// Seed used by the admin surface
    pub const ADMIN_SEED: ThresholdSet = ThresholdSet {
        too_loud: -35.0,
        too_quiet: -75.0,
        grace: 6.0,
    };

    pub fn new(too_loud: f32, too_quiet: f32, grace: f32) -> Result<Self> {
        for (field, value) in [
            (ThresholdField::TooLoud, too_loud),
            (ThresholdField::TooQuiet, too_quiet),
            (ThresholdField::Grace, grace),
        ] {
            if !value.is_finite() {
                return Err(ThresholdError::NonFinite { field, value });
            }
        }
        if grace < 0.0 {
            return Err(ThresholdError::NegativeGrace(grace));
        }
        if too_quiet >= too_loud {
            return Err(ThresholdError::Inverted { too_loud, too_quiet });
        }
        Ok(Self {
            too_loud,
            too_quiet,
            grace,
        })
    }

    pub fn too_loud(&self) -> f32 {
        self.too_loud
    }

    pub fn too_quiet(&self) -> f32 {
        self.too_quiet
    }

    pub fn grace(&self) -> f32 {
        self.grace
    }

    pub fn get(&self, field: ThresholdField) -> f32 {
        match field {
            ThresholdField::TooLoud => self.too_loud,
            ThresholdField::TooQuiet => self.too_quiet,
            ThresholdField::Grace => self.grace,
        }
    }

    /// Replace one field, producing a complete new set
    pub fn with_field(&self, field: ThresholdField, value: f32) -> Result<Self> {
        let mut next = *self;
        match field {
            ThresholdField::TooLoud => next.too_loud = value,
            ThresholdField::TooQuiet => next.too_quiet = value,
            ThresholdField::Grace => next.grace = value,
        }
        Self::new(next.too_loud, next.too_quiet, next.grace)
    }

    /// Move both thresholds by `delta` dB, leaving grace untouched
    pub fn shifted(&self, delta: f32) -> Result<Self> {
        if !delta.is_finite() {
            return Err(ThresholdError::NonFiniteShift(delta));
        }
        Self::new(self.too_loud + delta, self.too_quiet + delta, self.grace)
    }

    pub fn apply(&self, adjustment: Adjustment, step_db: f32) -> Result<Self> {
        self.shifted(adjustment.delta(step_db))
    }

    /// Entry condition for `TooLoud`
    pub fn is_too_loud(&self, loudness: f32) -> bool {
        loudness >= self.too_loud
    }

    /// Entry condition for `TooQuiet`
    pub fn is_too_quiet(&self, loudness: f32) -> bool {
        loudness <= self.too_quiet
    }

    /// Exit condition from `TooLoud`
    pub fn released_from_too_loud(&self, loudness: f32) -> bool {
        loudness <= self.too_loud - self.grace
    }

    /// Exit condition from `TooQuiet`
    pub fn released_from_too_quiet(&self, loudness: f32) -> bool {
        loudness >= self.too_quiet + self.grace
    }
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self::VIEWER_SEED
    }
}

impl fmt::Display for ThresholdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "too_loud={:.1} dB, too_quiet={:.1} dB, grace={:.1} dB",
            self.too_loud, self.too_quiet, self.grace
        )
    }
}

/// Inclusive numeric range an operator input is clamped to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Clamp a finite value into the range; non-finite values pass through so
    /// validation downstream can reject them.
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_finite() {
            value.max(self.min).min(self.max)
        } else {
            value
        }
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Per-surface clamp ranges for absolute edits
///
/// The valid range is a deployment decision, not a universal constant: some
/// deployments express `too_loud` on a `[0, 100]` scale, others on `[-100, 0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EditBounds {
    pub too_loud: ValueRange,
    pub too_quiet: ValueRange,
    pub grace: ValueRange,
    pub rms_seconds: ValueRange,
}

impl EditBounds {
    /// Both thresholds on the dBFS scale
    pub const FULL_SCALE: EditBounds = EditBounds {
        too_loud: ValueRange::new(-100.0, 0.0),
        too_quiet: ValueRange::new(-100.0, 0.0),
        grace: ValueRange::new(0.0, 20.0),
        rms_seconds: ValueRange::new(0.5, 10.0),
    };

    pub fn range(&self, field: ThresholdField) -> ValueRange {
        match field {
            ThresholdField::TooLoud => self.too_loud,
            ThresholdField::TooQuiet => self.too_quiet,
            ThresholdField::Grace => self.grace,
        }
    }

    pub fn clamp(&self, field: ThresholdField, value: f32) -> f32 {
        self.range(field).clamp(value)
    }

    pub fn clamp_window(&self, seconds: f32) -> f32 {
        self.rms_seconds.clamp(seconds)
    }

    /// Names the first malformed range, if any
    pub fn invalid_range(&self) -> Option<&'static str> {
        [
            ("too_loud", self.too_loud),
            ("too_quiet", self.too_quiet),
            ("grace", self.grace),
            ("rms_seconds", self.rms_seconds),
        ]
        .into_iter()
        .find(|(_, range)| !range.is_valid())
        .map(|(name, _)| name)
    }
}

impl Default for EditBounds {
    fn default() -> Self {
        Self::FULL_SCALE
    }
}
