//! # Wire Protocol
//!
//! The streaming protocol uses the WebSocket frame kind as its only
//! discriminator:
//!
//! | Direction        | Frame  | Payload                                   |
//! |------------------|--------|-------------------------------------------|
//! | server → client  | text   | `{"loaded_models": ["hey_jarvis", ...]}`  |
//! | client → server  | text   | decimal sample rate, e.g. `44100`         |
//! | client → server  | binary | signed 16-bit little-endian mono PCM      |
//! | server → client  | text   | `{"activations": ["hey_jarvis", ...]}`    |
//!
//! The handshake is always the first server message. Activations are only
//! sent when at least one keyword crossed [`ACTIVATION_THRESHOLD`] for the
//! most recent audio frame; silence is never acknowledged.

use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};

/// Sample rate every window is normalized to before classification.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Sample rate assumed until the client sends a control frame.
pub const DEFAULT_SAMPLE_RATE: u32 = TARGET_SAMPLE_RATE;

/// Minimum score for a keyword to be reported.
pub const ACTIVATION_THRESHOLD: f32 = 0.5;

/// One inbound frame, already stripped of transport details.
///
/// Transport-level pings are answered by the WebSocket adapter and never
/// reach the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text frame: a sample rate declaration
    Control(String),
    /// Binary frame: PCM samples
    Audio(Bytes),
    /// Orderly closure requested by the peer
    Close,
    /// The transport failed while receiving
    Error(String),
    /// A frame kind the protocol does not define
    Other,
}

/// Messages the server sends. Serialized without a tag so the JSON is exactly
/// `{"loaded_models": [...]}` or `{"activations": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Handshake { loaded_models: Vec<String> },
    Activations { activations: Vec<String> },
}

impl ServerMessage {
    pub fn handshake(keywords: &[String]) -> Self {
        ServerMessage::Handshake {
            loaded_models: keywords.to_vec(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Why a control payload was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRejection {
    NotAnInteger(String),
    OutOfRange { rate: i64, min: u32, max: u32 },
}

impl std::fmt::Display for ControlRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlRejection::NotAnInteger(payload) => {
                write!(f, "control payload {:?} is not an integer", payload)
            }
            ControlRejection::OutOfRange { rate, min, max } => {
                write!(f, "sample rate {} outside accepted range {}..={}", rate, min, max)
            }
        }
    }
}

/// Parse a control payload into a sample rate.
///
/// Surrounding whitespace and a leading `+` are accepted, matching how
/// clients commonly format the number.
pub fn parse_sample_rate(payload: &str, min: u32, max: u32) -> Result<u32, ControlRejection> {
    let trimmed = payload.trim();
    let rate: i64 = trimmed
        .parse()
        .map_err(|_| ControlRejection::NotAnInteger(truncate(trimmed, 32)))?;

    if rate < min as i64 || rate > max as i64 {
        return Err(ControlRejection::OutOfRange { rate, min, max });
    }

    Ok(rate as u32)
}

// Keeps log lines bounded when a client sends something large as text.
fn truncate(payload: &str, limit: usize) -> String {
    payload.chars().take(limit).collect()
}
