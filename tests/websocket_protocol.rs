//! End-to-end protocol tests: a real actix server on an ephemeral port driven
//! by a tokio-tungstenite client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wakeword_server::classifier::{ActivationResult, Classifier, ClassifierFactory, ModelRegistry};
use wakeword_server::config::AppConfig;
use wakeword_server::configure_routes;
use wakeword_server::error::{AppError, AppResult};
use wakeword_server::state::AppState;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Scores `hey_test` high when the window sums to a positive value, and
/// records the length of every window it sees.
struct Probe {
    windows: Arc<Mutex<Vec<usize>>>,
    fail: bool,
}

impl Classifier for Probe {
    fn classify(&mut self, window: &[i16]) -> AppResult<ActivationResult> {
        if self.fail {
            return Err(AppError::Classifier("scripted failure".to_string()));
        }
        self.windows.lock().unwrap().push(window.len());

        let hot = window.iter().map(|&s| i64::from(s)).sum::<i64>() > 0;
        let mut result = ActivationResult::new();
        result.push("hey_test", if hot { 0.7 } else { 0.3 });
        result.push("other", 0.2);
        Ok(result)
    }
}

struct ProbeFactory {
    keywords: Vec<String>,
    windows: Arc<Mutex<Vec<usize>>>,
    fail: bool,
}

impl ClassifierFactory for ProbeFactory {
    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn backend(&self) -> &str {
        "probe"
    }

    fn create(&self) -> AppResult<Box<dyn Classifier>> {
        Ok(Box::new(Probe {
            windows: Arc::clone(&self.windows),
            fail: self.fail,
        }))
    }
}

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    state: web::Data<AppState>,
    windows: Arc<Mutex<Vec<usize>>>,
}

impl TestServer {
    async fn start(max_sessions: usize, fail: bool) -> Self {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        Self::start_with(config, fail).await
    }

    async fn start_with(config: AppConfig, fail: bool) -> Self {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let factory = ProbeFactory {
            keywords: vec!["hey_test".to_string(), "other".to_string()],
            windows: Arc::clone(&windows),
            fail,
        };

        let ws_path = config.server.ws_path.clone();
        let state = web::Data::new(AppState::new(
            config,
            ModelRegistry::with_factory(Box::new(factory)),
        ));

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(|cfg| configure_routes(cfg, &ws_path))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            addr,
            handle,
            state,
            windows,
        }
    }

    async fn connect(&self) -> Result<Client, WsError> {
        connect_async(format!("ws://{}/ws", self.addr))
            .await
            .map(|(stream, _)| stream)
    }

    async fn stop(self) {
        self.handle.stop(true).await;
    }
}

fn pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

async fn next_text(client: &mut Client) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("transport error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {:?}", other),
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let waited = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
    assert!(waited.is_err(), "expected no message, got {:?}", waited);
}

#[actix_web::test]
async fn test_handshake_lists_loaded_models() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();

    let handshake = next_text(&mut client).await;
    assert_eq!(
        handshake,
        serde_json::json!({"loaded_models": ["hey_test", "other"]})
    );

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_activation_and_silence() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    // Below threshold: nothing comes back
    client.send(Message::Binary(pcm(&[-5; 1280]))).await.unwrap();
    assert_silent(&mut client).await;

    client.send(Message::Binary(pcm(&[5; 1280]))).await.unwrap();
    let activation = next_text(&mut client).await;
    assert_eq!(activation, serde_json::json!({"activations": ["hey_test"]}));

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_control_frame_switches_rate() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    client.send(Message::Text("8000".to_string())).await.unwrap();
    client.send(Message::Text("not a rate".to_string())).await.unwrap();
    // 640 bytes = 320 samples at 8 kHz
    client.send(Message::Binary(pcm(&[5; 320]))).await.unwrap();

    let activation = next_text(&mut client).await;
    assert_eq!(activation["activations"][0], "hey_test");
    assert_eq!(server.windows.lock().unwrap().as_slice(), &[640]);

    let metrics = server.state.get_metrics_snapshot();
    assert_eq!(metrics.control_updates, 1);
    assert_eq!(metrics.control_ignored, 1);

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_odd_length_frame_is_accepted() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    let mut payload = pcm(&[-1; 640]);
    payload.push(0x01);
    client.send(Message::Binary(payload)).await.unwrap();
    assert_silent(&mut client).await;

    assert_eq!(server.windows.lock().unwrap().as_slice(), &[641]);

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_large_frame_is_classified() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    // One second at 48 kHz: 96 000 bytes, above the 64 KiB codec default
    client.send(Message::Text("48000".to_string())).await.unwrap();
    client.send(Message::Binary(pcm(&[5; 48_000]))).await.unwrap();

    let activation = next_text(&mut client).await;
    assert_eq!(activation, serde_json::json!({"activations": ["hey_test"]}));
    assert_eq!(server.windows.lock().unwrap().as_slice(), &[16_000]);

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_frame_above_configured_limit_closes_session() {
    let mut config = AppConfig::default();
    config.audio.max_frame_bytes = 1024;
    let server = TestServer::start_with(config, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    client.send(Message::Binary(pcm(&[5; 1280]))).await.ok();

    let mut released = false;
    for _ in 0..50 {
        if server.state.sessions.active_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "oversized frame did not end the session");
    assert!(server.windows.lock().unwrap().is_empty());

    server.stop().await;
}

#[actix_web::test]
async fn test_fragmented_audio_is_reassembled() {
    let server = TestServer::start(4, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    let payload = pcm(&[5; 1280]);
    let (first, rest) = payload.split_at(1280);
    client
        .send(Message::Frame(Frame::message(
            first.to_vec(),
            OpCode::Data(Data::Binary),
            false,
        )))
        .await
        .unwrap();
    client
        .send(Message::Frame(Frame::message(
            rest.to_vec(),
            OpCode::Data(Data::Continue),
            true,
        )))
        .await
        .unwrap();

    let activation = next_text(&mut client).await;
    assert_eq!(activation, serde_json::json!({"activations": ["hey_test"]}));
    assert_eq!(server.windows.lock().unwrap().as_slice(), &[1280]);

    client.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_session_limit_refuses_upgrade() {
    let server = TestServer::start(1, false).await;
    let mut first = server.connect().await.unwrap();
    next_text(&mut first).await;

    match server.connect().await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        other => panic!("expected a 503 refusal, got {:?}", other.map(|_| ())),
    }
    assert_eq!(server.state.get_metrics_snapshot().sessions_rejected, 1);

    first.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_disconnect_releases_slot() {
    let server = TestServer::start(1, false).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;
    assert_eq!(server.state.sessions.active_count(), 1);

    client.close(None).await.ok();
    drop(client);

    let mut released = false;
    for _ in 0..50 {
        if server.state.sessions.active_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "session slot was not released");
    assert_eq!(server.state.get_metrics_snapshot().sessions_closed, 1);

    // The freed slot can be used again
    let mut again = server.connect().await.unwrap();
    next_text(&mut again).await;

    again.close(None).await.ok();
    server.stop().await;
}

#[actix_web::test]
async fn test_classifier_failure_closes_with_internal_error() {
    let server = TestServer::start(4, true).await;
    let mut client = server.connect().await.unwrap();
    next_text(&mut client).await;

    client.send(Message::Binary(pcm(&[5; 1280]))).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("transport error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Error),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert_eq!(server.state.get_metrics_snapshot().pipeline_failures, 1);

    server.stop().await;
}
