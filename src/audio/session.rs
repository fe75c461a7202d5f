//! # Connection Session
//!
//! Protocol state for one WebSocket connection, and the manager that tracks
//! how many of them are alive.
//!
//! ## Session Lifecycle:
//! 1. **HandshakeSent**: session created, the keyword list has been produced
//! 2. **Listening**: control and audio frames are accepted in any order
//! 3. **Closed**: peer closed, transport failed or the pipeline failed; every
//!    later frame is dropped
//!
//! A `Session` is owned by exactly one actor and is never shared, so it needs
//! no locking. The only shared piece is the `SessionManager`, which counts
//! live sessions for admission control and the HTTP surface.

use crate::audio::processor::decode_pcm16le;
use crate::audio::resample::Resample;
use crate::classifier::Classifier;
use crate::error::{AppError, AppResult};
use crate::protocol::{
    parse_sample_rate, Frame, ServerMessage, ACTIVATION_THRESHOLD, DEFAULT_SAMPLE_RATE,
    TARGET_SAMPLE_RATE,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    HandshakeSent,
    Listening,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::HandshakeSent => "handshake_sent",
            SessionState::Listening => "listening",
            SessionState::Closed => "closed",
        }
    }
}

/// What the adapter should do after a frame was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Control frame accepted; nothing to send
    RateUpdated(u32),
    /// Control frame could not be used; nothing to send
    ControlIgnored,
    /// Audio classified, no keyword crossed the threshold
    Silent,
    /// Audio classified; send this message
    Activation(ServerMessage),
    /// Frame kind outside the protocol
    Ignored,
    /// Stop processing and tear the connection down
    Terminate,
}

/// Protocol state machine for one connection.
pub struct Session {
    id: String,
    state: SessionState,
    sample_rate: u32,
    classifier: Option<Box<dyn Classifier>>,
    resampler: Box<dyn Resample>,
    keywords: Vec<String>,
    min_sample_rate: u32,
    max_sample_rate: u32,
}

impl Session {
    /// Create the session and the handshake it must send first.
    pub fn open(
        id: String,
        keywords: Vec<String>,
        classifier: Box<dyn Classifier>,
        resampler: Box<dyn Resample>,
        sample_rate_range: (u32, u32),
    ) -> (Self, ServerMessage) {
        let handshake = ServerMessage::handshake(&keywords);
        let session = Self {
            id,
            state: SessionState::HandshakeSent,
            sample_rate: DEFAULT_SAMPLE_RATE,
            classifier: Some(classifier),
            resampler,
            keywords,
            min_sample_rate: sample_rate_range.0,
            max_sample_rate: sample_rate_range.1,
        };
        (session, handshake)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Handle one inbound frame.
    ///
    /// An `Err` is fatal: the caller must close the connection. The session
    /// is already `Closed` when this returns an error.
    pub fn handle_frame(&mut self, frame: Frame) -> AppResult<FrameOutcome> {
        if self.state == SessionState::Closed {
            return Ok(FrameOutcome::Terminate);
        }
        self.state = SessionState::Listening;

        match frame {
            Frame::Control(payload) => Ok(self.handle_control(&payload)),
            Frame::Audio(bytes) => self.handle_audio(&bytes).map_err(|err| {
                self.close();
                err
            }),
            Frame::Close => {
                self.close();
                Ok(FrameOutcome::Terminate)
            }
            Frame::Error(reason) => {
                warn!(session_id = %self.id, %reason, "Transport error, closing session");
                self.close();
                Ok(FrameOutcome::Terminate)
            }
            Frame::Other => Ok(FrameOutcome::Ignored),
        }
    }

    fn handle_control(&mut self, payload: &str) -> FrameOutcome {
        match parse_sample_rate(payload, self.min_sample_rate, self.max_sample_rate) {
            Ok(rate) => {
                if rate != self.sample_rate {
                    debug!(session_id = %self.id, from = self.sample_rate, to = rate, "Sample rate updated");
                }
                self.sample_rate = rate;
                FrameOutcome::RateUpdated(rate)
            }
            Err(rejection) => {
                warn!(session_id = %self.id, %rejection, "Ignoring control frame");
                FrameOutcome::ControlIgnored
            }
        }
    }

    fn handle_audio(&mut self, payload: &[u8]) -> AppResult<FrameOutcome> {
        let samples = decode_pcm16le(payload);
        let window = if self.sample_rate == TARGET_SAMPLE_RATE {
            samples
        } else {
            self.resampler
                .resample(&samples, self.sample_rate, TARGET_SAMPLE_RATE)?
        };

        let classifier = self
            .classifier
            .as_mut()
            .ok_or_else(|| AppError::Internal("classifier already released".to_string()))?;
        let result = classifier.classify(&window)?;

        let activations = result.activations(ACTIVATION_THRESHOLD);
        if activations.is_empty() {
            return Ok(FrameOutcome::Silent);
        }

        debug!(session_id = %self.id, keywords = ?activations, "Keyword activation");
        Ok(FrameOutcome::Activation(ServerMessage::Activations { activations }))
    }

    /// Move to `Closed` and release the classifier.
    ///
    /// Returns `true` only for the call that actually closed the session.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.classifier = None;
        true
    }
}

/// Bookkeeping kept for each live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Tracks live sessions and enforces the concurrency limit.
///
/// ## Thread Safety:
/// Uses RwLock so the HTTP handlers can read while the WebSocket upgrades
/// add and remove entries.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    max_concurrent_sessions: usize,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Reserve a slot for a new connection.
    ///
    /// The slot is released when the returned guard is dropped.
    pub fn open(self: &Arc<Self>, peer: Option<String>) -> AppResult<SessionSlot> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(AppError::CapacityExceeded(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        sessions.insert(
            session_id.clone(),
            SessionInfo {
                session_id: session_id.clone(),
                peer,
                opened_at: Utc::now(),
            },
        );

        Ok(SessionSlot {
            session_id,
            manager: Arc::clone(self),
        })
    }

    fn release(&self, session_id: &str) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Live sessions, oldest first.
    pub fn summaries(&self) -> Vec<SessionInfo> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by_key(|info| info.opened_at);
        list
    }
}

/// A reserved session slot. Dropping it frees the slot exactly once.
pub struct SessionSlot {
    session_id: String,
    manager: Arc<SessionManager>,
}

impl SessionSlot {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if self.manager.release(&self.session_id) {
            debug!(session_id = %self.session_id, "Session slot released");
        }
    }
}
