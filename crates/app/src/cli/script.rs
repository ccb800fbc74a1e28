//! Scripted sessions for `decibender simulate`
//!
//! One step per line; `#` starts a comment.
//!
//! ```text
//! -15              # loudness reading in dBFS (same as `sample -15`)
//! louder           # viewer issues louder/quieter
//! set too_loud -30 # admin replaces one threshold field
//! rms 1.5          # admin changes the RMS window
//! wait 250         # pause, in milliseconds
//! ```

use decibender_core::domain::{Adjustment, ThresholdField};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Sample(f32),
    Adjust(Adjustment),
    Set(ThresholdField, f32),
    Window(f32),
    Wait(Duration),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Sample(db) => write!(f, "sample {db:.1} dB"),
            Step::Adjust(adjustment) => write!(f, "{adjustment}"),
            Step::Set(field, value) => write!(f, "set {field} {value:.1}"),
            Step::Window(seconds) => write!(f, "rms {seconds:.1} s"),
            Step::Wait(duration) => write!(f, "wait {} ms", duration.as_millis()),
        }
    }
}

fn number(word: Option<&str>, what: &str) -> Result<f32, String> {
    let word = word.ok_or_else(|| format!("missing {what}"))?;
    word.parse::<f32>()
        .map_err(|_| format!("'{word}' is not a valid {what}"))
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let head = words.next().ok_or("empty step")?;

        let step = match head {
            "sample" => Step::Sample(number(words.next(), "loudness")?),
            "louder" => Step::Adjust(Adjustment::Louder),
            "quieter" => Step::Adjust(Adjustment::Quieter),
            "set" => {
                let field = words
                    .next()
                    .ok_or("missing field")?
                    .parse::<ThresholdField>()
                    .map_err(|e| e.to_string())?;
                Step::Set(field, number(words.next(), "value")?)
            }
            "rms" => Step::Window(number(words.next(), "window")?),
            "wait" => {
                let millis = words
                    .next()
                    .ok_or("missing duration")?
                    .parse::<u64>()
                    .map_err(|_| "duration must be whole milliseconds".to_string())?;
                Step::Wait(Duration::from_millis(millis))
            }
            other => match other.parse::<f32>() {
                Ok(db) => Step::Sample(db),
                Err(_) => return Err(format!("unknown step '{other}'")),
            },
        };

        if let Some(extra) = words.next() {
            return Err(format!("unexpected '{extra}'"));
        }
        Ok(step)
    }
}

pub fn parse_script(text: &str) -> Result<Vec<Step>, ScriptError> {
    text.lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let line = raw.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then_some((index + 1, line))
        })
        .map(|(line, text)| {
            text.parse::<Step>()
                .map_err(|message| ScriptError::Parse { line, message })
        })
        .collect()
}

/// Session run when no script is given
pub fn demo() -> Vec<Step> {
    vec![
        Step::Sample(-40.0),
        Step::Sample(-15.0),
        Step::Sample(-25.0),
        Step::Sample(-29.0),
        Step::Set(ThresholdField::TooLoud, -30.0),
        Step::Sample(-29.0),
        Step::Adjust(Adjustment::Louder),
        Step::Sample(-29.0),
        Step::Window(1.5),
        Step::Sample(-85.0),
    ]
}
