//! # WebSocket Streaming Handler
//!
//! Adapts actix WebSocket messages to the session protocol. Clients connect
//! to the configured path (default `/ws`):
//!
//! 1. **Upgrade**: a session slot is reserved and a classifier is built; a
//!    full server answers 503 before any WebSocket traffic
//! 2. **Handshake**: the first server message lists the loaded keywords
//! 3. **Streaming**: text frames declare the sample rate, binary frames carry
//!    PCM audio; activations are sent back when a keyword fires
//! 4. **Teardown**: on close, transport error or pipeline failure the session
//!    is closed and its slot released exactly once
//!
//! Fragmented text and binary messages are joined before they reach the
//! session, so a fragmented audio message is classified like any other.
//!
//! Each connection is one actor. The actor handles one stream item at a time
//! and classifies synchronously inside the handler, so frames of a session
//! are processed strictly in order.

use crate::audio::resample::PolynomialResampler;
use crate::audio::session::{FrameOutcome, Session, SessionSlot};
use crate::error::AppError;
use crate::protocol::{Frame, ServerMessage};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::web::{Bytes, BytesMut};
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

/// Turns transport messages into protocol frames, reassembling fragmented
/// text and binary messages.
///
/// The codec caps each frame at `max_message_bytes`; the assembler applies
/// the same cap to the joined payload. Ping and pong are handled by the
/// actor and never reach this type.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Option<MessageKind>,
    buffer: BytesMut,
    max_message_bytes: usize,
}

impl FrameAssembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            pending: None,
            buffer: BytesMut::new(),
            max_message_bytes,
        }
    }

    /// Map one transport message to a frame.
    ///
    /// Returns `None` while a fragmented message is still incomplete.
    pub fn assemble(&mut self, msg: Result<ws::Message, ws::ProtocolError>) -> Option<Frame> {
        match msg {
            Ok(ws::Message::Text(text)) => Some(self.unfragmented(Frame::Control(text.to_string()))),
            Ok(ws::Message::Binary(data)) => Some(self.unfragmented(Frame::Audio(data))),
            Ok(ws::Message::Continuation(item)) => self.continuation(item),
            Ok(ws::Message::Close(_)) => Some(Frame::Close),
            Ok(ws::Message::Nop) | Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) => {
                Some(Frame::Other)
            }
            Err(err) => Some(Frame::Error(err.to_string())),
        }
    }

    /// A data frame may not interleave with a fragmented message.
    fn unfragmented(&mut self, frame: Frame) -> Frame {
        if self.pending.is_some() {
            return self.abort("data frame arrived inside a fragmented message");
        }
        frame
    }

    fn continuation(&mut self, item: actix_http::ws::Item) -> Option<Frame> {
        match item {
            actix_http::ws::Item::FirstText(data) => self.begin(MessageKind::Text, data),
            actix_http::ws::Item::FirstBinary(data) => self.begin(MessageKind::Binary, data),
            actix_http::ws::Item::Continue(data) => self.append(data),
            actix_http::ws::Item::Last(data) => {
                if let Some(frame) = self.append(data) {
                    return Some(frame);
                }
                let payload = self.buffer.split().freeze();
                match self.pending.take() {
                    Some(MessageKind::Binary) => Some(Frame::Audio(payload)),
                    Some(MessageKind::Text) => Some(match String::from_utf8(payload.to_vec()) {
                        Ok(text) => Frame::Control(text),
                        Err(_) => Frame::Error("fragmented text message is not valid UTF-8".to_string()),
                    }),
                    None => Some(self.abort("continuation without a first fragment")),
                }
            }
        }
    }

    fn begin(&mut self, kind: MessageKind, data: Bytes) -> Option<Frame> {
        if self.pending.is_some() {
            return Some(self.abort("fragmented message started before the previous one ended"));
        }
        self.pending = Some(kind);
        self.buffer.clear();
        self.append(data)
    }

    fn append(&mut self, data: Bytes) -> Option<Frame> {
        if self.pending.is_none() {
            return Some(self.abort("continuation without a first fragment"));
        }
        if self.buffer.len() + data.len() > self.max_message_bytes {
            let reason = format!(
                "fragmented message exceeds {} bytes",
                self.max_message_bytes
            );
            return Some(self.abort(&reason));
        }
        self.buffer.extend_from_slice(&data);
        None
    }

    fn abort(&mut self, reason: &str) -> Frame {
        self.pending = None;
        self.buffer.clear();
        Frame::Error(reason.to_string())
    }
}

/// One WebSocket connection.
pub struct WakewordWebSocket {
    session: Session,
    frames: FrameAssembler,
    handshake: Option<ServerMessage>,
    app_state: web::Data<AppState>,
    /// Released when the actor is dropped or stopped
    slot: Option<SessionSlot>,
}

impl WakewordWebSocket {
    pub fn new(
        session: Session,
        handshake: ServerMessage,
        app_state: web::Data<AppState>,
        slot: SessionSlot,
    ) -> Self {
        let frames = FrameAssembler::new(app_state.config.audio.max_frame_bytes);
        Self {
            session,
            frames,
            handshake: Some(handshake),
            app_state,
            slot: Some(slot),
        }
    }

    fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session.id(), "Failed to encode message: {}", err),
        }
    }

    /// Close the connection with 1011 after a classifier or resampler failure.
    fn fail(&mut self, err: AppError, ctx: &mut ws::WebsocketContext<Self>) {
        error!(
            session_id = %self.session.id(),
            error_type = err.error_type(),
            "Audio pipeline failed, closing session: {}",
            err
        );
        self.app_state.record_pipeline_failure();
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(err.error_type().to_string()),
        }));
        ctx.stop();
    }
}

impl Actor for WakewordWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.session.id(),
            keywords = ?self.session.keywords(),
            "WebSocket session started"
        );

        if let Some(handshake) = self.handshake.take() {
            self.send(&handshake, ctx);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.close();
        if self.slot.take().is_some() {
            self.app_state.record_session_closed();
            info!(
                session_id = %self.session.id(),
                active_sessions = self.app_state.sessions.active_count(),
                "WebSocket session stopped"
            );
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WakewordWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if let Ok(ws::Message::Ping(data)) = &msg {
            ctx.pong(data);
            return;
        }

        let Some(frame) = self.frames.assemble(msg) else {
            return;
        };
        match self.session.handle_frame(frame) {
            Ok(outcome) => {
                self.app_state.record_outcome(&outcome);
                match outcome {
                    FrameOutcome::Activation(message) => self.send(&message, ctx),
                    FrameOutcome::Terminate => {
                        debug!(session_id = %self.session.id(), "Session terminated by peer");
                        ctx.stop();
                    }
                    FrameOutcome::RateUpdated(_)
                    | FrameOutcome::ControlIgnored
                    | FrameOutcome::Silent
                    | FrameOutcome::Ignored => {}
                }
            }
            Err(err) => self.fail(err, ctx),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session.id(), "Client stream finished");
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// Refuses the upgrade with 503 when the session limit is reached and with
/// 500 when no classifier can be built. Inbound frames may be as large as
/// `audio.max_frame_bytes`.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);

    let slot = match app_state.sessions.open(peer.clone()) {
        Ok(slot) => slot,
        Err(err) => {
            warn!(peer = ?peer, "Refusing WebSocket upgrade: {}", err);
            app_state.record_session_rejected();
            return Err(err.into());
        }
    };

    let classifier = app_state.models.create_classifier().map_err(|err| {
        error!(session_id = %slot.session_id(), "Failed to create classifier: {}", err);
        err
    })?;

    let audio = &app_state.config.audio;
    let (session, handshake) = Session::open(
        slot.session_id().to_string(),
        app_state.models.keywords().to_vec(),
        classifier,
        Box::new(PolynomialResampler),
        (audio.min_sample_rate, audio.max_sample_rate),
    );

    info!(session_id = %session.id(), peer = ?peer, "Accepted WebSocket connection");
    app_state.record_session_opened();

    let max_frame_bytes = audio.max_frame_bytes;
    let websocket = WakewordWebSocket::new(session, handshake, app_state.clone(), slot);
    ws::WsResponseBuilder::new(websocket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
