//! # Audio Pipeline
//!
//! Everything between a binary WebSocket frame and the classifier.
//!
//! ## Key Components:
//! - **Processor**: byte alignment and PCM decoding
//! - **Resample**: sample-rate normalization to 16 kHz
//! - **Session**: per-connection protocol state and the session manager
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit little-endian PCM
//! - **Channels**: mono
//! - **Sample Rate**: whatever the client last declared (16 kHz by default)

pub mod processor; // PCM padding and decoding
pub mod resample; // Sample-rate conversion
pub mod session; // Session state machine and manager

pub use session::{FrameOutcome, Session, SessionManager, SessionSlot, SessionState};
