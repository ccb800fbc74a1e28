//! Wire protocol carried by the sync channel
//!
//! Every message travels as an [`Event`]: a channel name plus an optional JSON
//! payload. [`Message::decode`] is the only way inbound payloads enter the
//! domain; it validates shape and invariants and fails per message.
//!
//! | Channel       | Payload                                   | Direction        |
//! |---------------|-------------------------------------------|------------------|
//! | `thresholds`  | `{too_loud, too_quiet, grace, ...}`       | bidirectional    |
//! | `rms-seconds` | `{rms_seconds}`                           | surface → analysis |
//! | `loudness`    | `{loudness}`                              | analysis → surface |
//! | `state`       | `"TooLoud" \| "Acceptable" \| "TooQuiet"` | analysis → surface |
//! | `louder`      | none, or `{origin, request}`              | surface → analysis |
//! | `quieter`     | none, or `{origin, request}`              | surface → analysis |
//!
//! A `thresholds` payload carrying `revision` is an authoritative broadcast from
//! the analysis process; one without is an edit request from a surface. The
//! quiet field is written as `too_quiet` and also read under its legacy
//! spelling `too_quite`.

use crate::domain::classifier::ClassificationState;
use crate::domain::loudness::{LoudnessSample, RmsSeconds, WindowError};
use crate::domain::thresholds::{Adjustment, ThresholdError, ThresholdSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding one inbound event
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("channel '{0}' requires a payload")]
    MissingPayload(Channel),

    #[error("malformed payload on '{channel}': {source}")]
    Malformed {
        channel: Channel,
        source: serde_json::Error,
    },

    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),

    #[error("invalid window: {0}")]
    Window(#[from] WindowError),

    #[error("loudness must be finite, got {0}")]
    NonFiniteLoudness(f32),

    #[error("request tag on '{0}' needs both origin and request")]
    PartialTag(Channel),
}

/// Named channels of the sync protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Thresholds,
    RmsSeconds,
    Loudness,
    State,
    Louder,
    Quieter,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Thresholds,
        Channel::RmsSeconds,
        Channel::Loudness,
        Channel::State,
        Channel::Louder,
        Channel::Quieter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Thresholds => "thresholds",
            Channel::RmsSeconds => "rms-seconds",
            Channel::Loudness => "loudness",
            Channel::State => "state",
            Channel::Louder => "louder",
            Channel::Quieter => "quieter",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.name() == name)
    }

    /// Channels whose payload is a full snapshot, so only the latest value matters
    pub fn is_snapshot(self) -> bool {
        matches!(self, Channel::Thresholds | Channel::RmsSeconds)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One message as it crosses the sync channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    /// JSON text; `None` for bare commands
    pub payload: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }
}

/// Identifies the surface that authored an edit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates a surface's edit with the broadcast that applied it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTag {
    pub origin: SurfaceId,
    pub request: u64,
}

/// Edit request published by a surface
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEdit {
    pub thresholds: ThresholdSet,
    pub tag: Option<RequestTag>,
}

/// Authoritative threshold broadcast from the analysis process
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBroadcast {
    pub thresholds: ThresholdSet,
    /// Identifies one run of the analysis process; later runs carry larger values
    pub session: u64,
    /// Counts changes within `session`, starting at 0
    pub revision: u64,
    /// Edit this revision answers, if it answers a tagged one
    pub ack: Option<RequestTag>,
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    EditThresholds(ThresholdEdit),
    Thresholds(ThresholdBroadcast),
    RmsSeconds(RmsSeconds),
    Loudness(LoudnessSample),
    State(ClassificationState),
    Adjust {
        adjustment: Adjustment,
        tag: Option<RequestTag>,
    },
}

#[derive(Serialize, Deserialize)]
struct ThresholdsWire {
    too_loud: f32,
    #[serde(alias = "too_quite")]
    too_quiet: f32,
    grace: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<RequestTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<SurfaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<u64>,
}

impl ThresholdsWire {
    fn new(thresholds: &ThresholdSet) -> Self {
        Self {
            too_loud: thresholds.too_loud(),
            too_quiet: thresholds.too_quiet(),
            grace: thresholds.grace(),
            session: None,
            revision: None,
            ack: None,
            origin: None,
            request: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RmsSecondsWire {
    rms_seconds: f32,
}

#[derive(Default, Serialize, Deserialize)]
struct AdjustWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<SurfaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<u64>,
}

fn join_tag(
    channel: Channel,
    origin: Option<SurfaceId>,
    request: Option<u64>,
) -> Result<Option<RequestTag>, DecodeError> {
    match (origin, request) {
        (Some(origin), Some(request)) => Ok(Some(RequestTag { origin, request })),
        (None, None) => Ok(None),
        _ => Err(DecodeError::PartialTag(channel)),
    }
}

fn parse<T: DeserializeOwned>(channel: Channel, payload: &str) -> Result<T, DecodeError> {
    serde_json::from_str(payload).map_err(|source| DecodeError::Malformed { channel, source })
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::EditThresholds(_) | Message::Thresholds(_) => Channel::Thresholds,
            Message::RmsSeconds(_) => Channel::RmsSeconds,
            Message::Loudness(_) => Channel::Loudness,
            Message::State(_) => Channel::State,
            Message::Adjust {
                adjustment: Adjustment::Louder,
                ..
            } => Channel::Louder,
            Message::Adjust {
                adjustment: Adjustment::Quieter,
                ..
            } => Channel::Quieter,
        }
    }

    /// Encode into an event ready to publish
    pub fn to_event(&self) -> serde_json::Result<Event> {
        let name = self.channel().name();
        let payload = match self {
            Message::EditThresholds(edit) => {
                let mut wire = ThresholdsWire::new(&edit.thresholds);
                if let Some(tag) = &edit.tag {
                    wire.origin = Some(tag.origin.clone());
                    wire.request = Some(tag.request);
                }
                serde_json::to_string(&wire)?
            }
            Message::Thresholds(broadcast) => {
                let mut wire = ThresholdsWire::new(&broadcast.thresholds);
                wire.session = Some(broadcast.session);
                wire.revision = Some(broadcast.revision);
                wire.ack = broadcast.ack.clone();
                serde_json::to_string(&wire)?
            }
            Message::RmsSeconds(window) => serde_json::to_string(&RmsSecondsWire {
                rms_seconds: window.seconds(),
            })?,
            Message::Loudness(sample) => serde_json::to_string(sample)?,
            Message::State(state) => serde_json::to_string(state)?,
            Message::Adjust { tag: None, .. } => return Ok(Event::bare(name)),
            Message::Adjust { tag: Some(tag), .. } => serde_json::to_string(&AdjustWire {
                origin: Some(tag.origin.clone()),
                request: Some(tag.request),
            })?,
        };
        Ok(Event::new(name, payload))
    }

    /// Decode and validate one inbound event
    pub fn decode(event: &Event) -> Result<Message, DecodeError> {
        let channel = Channel::from_name(&event.name)
            .ok_or_else(|| DecodeError::UnknownChannel(event.name.clone()))?;
        let payload = event.payload.as_deref();

        match channel {
            Channel::Louder | Channel::Quieter => {
                let adjustment = if channel == Channel::Louder {
                    Adjustment::Louder
                } else {
                    Adjustment::Quieter
                };
                let wire = match payload {
                    None => AdjustWire::default(),
                    Some(text) => parse::<Option<AdjustWire>>(channel, text)?.unwrap_or_default(),
                };
                let tag = join_tag(channel, wire.origin, wire.request)?;
                Ok(Message::Adjust { adjustment, tag })
            }
            Channel::Thresholds => {
                let wire: ThresholdsWire = parse(channel, require(channel, payload)?)?;
                let thresholds = ThresholdSet::new(wire.too_loud, wire.too_quiet, wire.grace)?;
                match wire.revision {
                    Some(revision) => Ok(Message::Thresholds(ThresholdBroadcast {
                        thresholds,
                        session: wire.session.unwrap_or(0),
                        revision,
                        ack: wire.ack,
                    })),
                    None => Ok(Message::EditThresholds(ThresholdEdit {
                        thresholds,
                        tag: join_tag(channel, wire.origin, wire.request)?,
                    })),
                }
            }
            Channel::RmsSeconds => {
                let wire: RmsSecondsWire = parse(channel, require(channel, payload)?)?;
                Ok(Message::RmsSeconds(RmsSeconds::new(wire.rms_seconds)?))
            }
            Channel::Loudness => {
                let sample: LoudnessSample = parse(channel, require(channel, payload)?)?;
                if !sample.db().is_finite() {
                    return Err(DecodeError::NonFiniteLoudness(sample.db()));
                }
                Ok(Message::Loudness(sample))
            }
            Channel::State => Ok(Message::State(parse(channel, require(channel, payload)?)?)),
        }
    }
}

fn require(channel: Channel, payload: Option<&str>) -> Result<&str, DecodeError> {
    payload.ok_or(DecodeError::MissingPayload(channel))
}

/// One-time handshake sent to the analysis process when a surface starts
///
/// Both fields are optional: a viewer sends only its thresholds, an admin
/// surface also sends its window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub initial_thresholds: Option<ThresholdSet>,
    #[serde(default)]
    pub initial_rms_seconds: Option<RmsSeconds>,
}
