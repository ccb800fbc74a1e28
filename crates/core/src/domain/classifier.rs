//! Hysteresis classifier for loudness samples
//!
//! The analysis process is the single authority for classification; surfaces
//! only display the `state` it broadcasts. The grace margin creates a dead band
//! around each threshold so the state does not flap while the signal hovers at
//! a boundary:
//!
//! ```text
//!             loudness >= too_loud               loudness <= too_quiet
//!   TooLoud <------------------- Acceptable -------------------> TooQuiet
//!           ------------------->            <-------------------
//!        loudness <= too_loud - grace    loudness >= too_quiet + grace
//! ```
//!
//! A missing sample changes nothing: the last state holds indefinitely.

use crate::domain::thresholds::ThresholdSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Classification broadcast on the `state` channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClassificationState {
    TooLoud,
    #[default]
    Acceptable,
    TooQuiet,
}

impl ClassificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationState::TooLoud => "TooLoud",
            ClassificationState::Acceptable => "Acceptable",
            ClassificationState::TooQuiet => "TooQuiet",
        }
    }
}

impl fmt::Display for ClassificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TooLoud" => Ok(ClassificationState::TooLoud),
            "Acceptable" => Ok(ClassificationState::Acceptable),
            "TooQuiet" => Ok(ClassificationState::TooQuiet),
            other => Err(format!("unknown classification state: {other}")),
        }
    }
}

/// A state change caused by one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: ClassificationState,
    pub to: ClassificationState,
    pub loudness: f32,
}

/// Hysteresis state machine, initially `Acceptable`
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    state: ClassificationState,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ClassificationState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ClassificationState {
        self.state
    }

    /// Transition rule, independent of any classifier instance
    pub fn next_state(
        state: ClassificationState,
        loudness: f32,
        thresholds: &ThresholdSet,
    ) -> ClassificationState {
        match state {
            ClassificationState::Acceptable if thresholds.is_too_loud(loudness) => {
                ClassificationState::TooLoud
            }
            ClassificationState::Acceptable if thresholds.is_too_quiet(loudness) => {
                ClassificationState::TooQuiet
            }
            ClassificationState::TooLoud if thresholds.released_from_too_loud(loudness) => {
                ClassificationState::Acceptable
            }
            ClassificationState::TooQuiet if thresholds.released_from_too_quiet(loudness) => {
                ClassificationState::Acceptable
            }
            unchanged => unchanged,
        }
    }

    /// Feed one sample; returns the transition if the state changed
    pub fn observe(&mut self, loudness: f32, thresholds: &ThresholdSet) -> Option<Transition> {
        let next = Self::next_state(self.state, loudness, thresholds);
        if next == self.state {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
            loudness,
        };
        debug!(
            from = %transition.from,
            to = %transition.to,
            loudness,
            "Classification changed"
        );
        self.state = next;
        Some(transition)
    }
}
