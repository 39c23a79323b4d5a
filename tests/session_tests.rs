//! End-to-end session scenarios against a local WebSocket server and an
//! in-memory audio backend.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::Level;
use voicelink::audio::SPECTRUM_BINS;
use voicelink::audio::backend::{
    AudioBackend, CaptureError, CapturePipeline, PlaybackSink, SpectrumCell, SpectrumTap,
};
use voicelink::config::Config;
use voicelink::protocol::Role;
use voicelink::session::{SessionEvent, SessionManager};

type ServerWs = WebSocketStream<TcpStream>;

struct ServerConn {
    path: String,
    ws: ServerWs,
}

/// Accepts every incoming WebSocket and hands it over with its request path.
async fn start_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let accepted =
                    tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                        path = req.uri().to_string();
                        Ok(resp)
                    })
                    .await;
                if let Ok(ws) = accepted {
                    let _ = conn_tx.send(ServerConn { path, ws });
                }
            });
        }
    });
    (format!("ws://{addr}"), conn_rx)
}

fn test_config(server_url: String, reconnect_ms: u64) -> Config {
    Config {
        server_url,
        reconnect_delay: Duration::from_millis(reconnect_ms),
        log_level: Level::INFO,
    }
}

async fn accept_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    timeout(Duration::from_secs(5), conns.recv())
        .await
        .expect("timed out waiting for a client connection")
        .expect("server task ended")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event stream closed")
}

async fn next_event_skipping_levels(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEvent {
    loop {
        match next_event(events).await {
            SessionEvent::AudioLevelChanged(_) => continue,
            event => return event,
        }
    }
}

async fn recv_json(ws: &mut ServerWs) -> serde_json::Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Delivers a fixed set of capture chunks and swallows playback.
#[derive(Default)]
struct FakeBackend {
    chunks: Vec<Bytes>,
}

impl AudioBackend for FakeBackend {
    fn start_capture(&self) -> Result<CapturePipeline, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone());
        }
        let cell: SpectrumCell = Arc::new(Mutex::new([51u8; SPECTRUM_BINS]));
        let tap = SpectrumTap::new(&cell);
        Ok(CapturePipeline {
            frames: rx,
            tap,
            // Keeping the sender alive keeps the pipeline open until teardown.
            guard: Box::new((tx, cell)),
        })
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, CaptureError> {
        Ok(Box::new(NullSink))
    }
}

struct NullSink;

impl PlaybackSink for NullSink {
    fn play(&mut self, _pcm: Bytes) {}
}

/// A backend with no usable device.
struct FailingBackend;

impl AudioBackend for FailingBackend {
    fn start_capture(&self) -> Result<CapturePipeline, CaptureError> {
        Err(CaptureError::NoDevice)
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, CaptureError> {
        Err(CaptureError::NoDevice)
    }
}

#[tokio::test]
async fn test_text_round_trip_and_turn_completion() {
    let (url, mut conns) = start_server().await;
    let (session, mut events) =
        SessionManager::spawn(test_config(url, 200), Arc::new(FakeBackend::default()));

    let conn = accept_conn(&mut conns).await;
    assert!(conn.path.starts_with("/ws/"));
    assert!(conn.path.ends_with("is_audio=false"));
    let mut ws = conn.ws;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    session.send_text("hi").await.unwrap();
    let sent = recv_json(&mut ws).await;
    assert_eq!(
        sent,
        json!({"mime_type": "text/plain", "data": "hi", "role": "user"})
    );

    send_json(
        &mut ws,
        json!({"mime_type": "text/plain", "data": "hello", "role": "model"}),
    )
    .await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ProcessingChanged(true)
    ));
    match next_event(&mut events).await {
        SessionEvent::TextMessage { role, content, .. } => {
            assert!(matches!(role, Role::Model));
            assert_eq!(content, "hello");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    send_json(&mut ws, json!({"turn_complete": true, "interrupted": false})).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ProcessingChanged(false)
    ));

    session.shutdown().await;
}

#[tokio::test]
async fn test_voice_toggle_streams_captured_chunks() {
    let (url, mut conns) = start_server().await;
    let chunk = Bytes::from(vec![7u8; 320]);
    let backend = FakeBackend {
        chunks: vec![chunk.clone(), chunk.clone(), chunk],
    };
    let (session, mut events) =
        SessionManager::spawn(test_config(url, 200), Arc::new(backend));

    let text_conn = accept_conn(&mut conns).await;
    assert!(text_conn.path.ends_with("is_audio=false"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    session.toggle_voice().await.unwrap();
    assert!(matches!(
        next_event_skipping_levels(&mut events).await,
        SessionEvent::RecordingChanged(true)
    ));
    assert!(matches!(
        next_event_skipping_levels(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    // The capture renegotiation lands as a fresh audio-mode connection.
    let audio_conn = accept_conn(&mut conns).await;
    assert!(audio_conn.path.ends_with("is_audio=true"));
    let mut audio_ws = audio_conn.ws;

    // One audio envelope per captured chunk, no role tag.
    for _ in 0..3 {
        let sent = recv_json(&mut audio_ws).await;
        assert_eq!(sent["mime_type"], "audio/pcm");
        assert!(sent.get("role").is_none());
        let decoded = voicelink::codec::decode(sent["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded.len(), 320);
    }

    // The level monitor publishes while recording.
    let mut saw_level = false;
    for _ in 0..50 {
        if let SessionEvent::AudioLevelChanged(level) = next_event(&mut events).await {
            assert!((0.0..=1.0).contains(&level));
            saw_level = true;
            break;
        }
    }
    assert!(saw_level);

    session.toggle_voice().await.unwrap();
    assert!(matches!(
        next_event_skipping_levels(&mut events).await,
        SessionEvent::RecordingChanged(false)
    ));

    // Level resets to zero, then the text-mode connection comes back.
    let mut saw_zero_level = false;
    loop {
        match next_event(&mut events).await {
            SessionEvent::AudioLevelChanged(level) if level == 0.0 => saw_zero_level = true,
            SessionEvent::AudioLevelChanged(_) => {}
            SessionEvent::ConnectionChanged(true) => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_zero_level);

    let fallback_conn = accept_conn(&mut conns).await;
    assert!(fallback_conn.path.ends_with("is_audio=false"));

    // Zero audio envelopes after stop: the audio connection only drains to
    // its close, with no further frames.
    let mut late_frames = 0;
    loop {
        match timeout(Duration::from_secs(5), audio_ws.next()).await.unwrap() {
            Some(Ok(Message::Text(_))) => late_frames += 1,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
    assert_eq!(late_frames, 0);

    session.shutdown().await;
}

#[tokio::test]
async fn test_unintentional_close_triggers_single_delayed_reconnect() {
    let (url, mut conns) = start_server().await;
    let (session, mut events) =
        SessionManager::spawn(test_config(url, 100), Arc::new(FakeBackend::default()));

    let conn = accept_conn(&mut conns).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    // Remote-initiated drop.
    drop(conn);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(false)
    ));

    // Exactly one reconnect attempt arrives, in the same mode.
    let reconn = accept_conn(&mut conns).await;
    assert!(reconn.path.ends_with("is_audio=false"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(conns.try_recv().is_err());

    session.shutdown().await;
}

#[tokio::test]
async fn test_intentional_close_suppresses_reconnect() {
    let (url, mut conns) = start_server().await;
    let (session, mut events) =
        SessionManager::spawn(test_config(url, 100), Arc::new(FakeBackend::default()));

    let _conn = accept_conn(&mut conns).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    session.shutdown().await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(false)
    ));

    // Well past the reconnect delay: no new connection attempt.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(conns.try_recv().is_err());
}

#[tokio::test]
async fn test_send_text_while_disconnected_is_harmless() {
    // Bind and immediately release a port so nothing is listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (session, mut events) = SessionManager::spawn(
        test_config(format!("ws://{addr}"), 5000),
        Arc::new(FakeBackend::default()),
    );
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(false)
    ));

    session.send_text("hello?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    session.shutdown().await;
}

#[tokio::test]
async fn test_capture_failure_rolls_back_to_text_mode() {
    let (url, mut conns) = start_server().await;
    let (session, mut events) =
        SessionManager::spawn(test_config(url, 200), Arc::new(FailingBackend));

    let _text_conn = accept_conn(&mut conns).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    session.toggle_voice().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RecordingChanged(true)
    ));

    // The audio-mode connect succeeds before the device acquisition fails.
    let audio_conn = accept_conn(&mut conns).await;
    assert!(audio_conn.path.ends_with("is_audio=true"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RecordingChanged(false)
    ));
    match next_event(&mut events).await {
        SessionEvent::Error { message } => assert!(message.contains("voice start failed")),
        other => panic!("unexpected event: {other:?}"),
    }

    // The session falls back to a text-only connection and stays alive.
    let fallback = accept_conn(&mut conns).await;
    assert!(fallback.path.ends_with("is_audio=false"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionChanged(true)
    ));

    session.send_text("still here").await.unwrap();
    let mut ws = fallback.ws;
    let sent = recv_json(&mut ws).await;
    assert_eq!(sent["data"], "still here");

    session.shutdown().await;
}
