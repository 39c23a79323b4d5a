//! The session state machine and its façade.
//!
//! One spawned task owns the transport, the capture pipeline, and all
//! session state; commands and inbound envelopes are serialized through its
//! event loop, so no state field is ever mutated from two call paths at
//! once. The presentation layer talks to the task through a cloneable
//! [`SessionHandle`] and observes it through the [`SessionEvent`] stream.

use crate::audio::backend::{AudioBackend, CaptureError, PlaybackSink};
use crate::audio::level::spawn_level_monitor;
use crate::codec;
use crate::config::Config;
use crate::protocol::{Envelope, MimeType, Role};
use crate::transport::{Transport, TransportError, TransportEvent};
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the presentation layer can observe.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(bool),
    RecordingChanged(bool),
    ProcessingChanged(bool),
    /// Normalized loudness in [0, 1], at display-refresh cadence while
    /// recording; reset to 0 when recording stops.
    AudioLevelChanged(f32),
    /// One inbound text envelope, in arrival order. Fragments of the same
    /// model turn share `turn`; the session never concatenates them.
    TextMessage {
        role: Role,
        content: String,
        turn: Uuid,
    },
    /// A non-fatal failure the collaborator should surface.
    Error { message: String },
}

/// Commands into the session task.
#[derive(Debug)]
enum Command {
    ToggleVoice,
    SendText(String),
    Shutdown,
}

/// The session task has shut down and can no longer accept commands.
#[derive(Debug, thiserror::Error)]
#[error("session task has shut down")]
pub struct SessionClosed;

/// Cloneable command surface over a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Starts voice when idle, stops it when recording. Safe to call from
    /// any task; concurrent toggles are queued, never interleaved.
    pub async fn toggle_voice(&self) -> Result<(), SessionClosed> {
        self.commands
            .send(Command::ToggleVoice)
            .await
            .map_err(|_| SessionClosed)
    }

    /// Sends one user text message. A no-op on the wire while disconnected.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.commands
            .send(Command::SendText(text.into()))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Performs an intentional close and ends the session task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

pub struct SessionManager;

impl SessionManager {
    /// Spawns the session task: generates the per-process session token,
    /// opens the initial text-mode connection, and runs until shutdown.
    pub fn spawn(
        config: Config,
        backend: Arc<dyn AudioBackend>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(config, backend, command_rx, event_tx));
        (
            SessionHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }
}

/// Opaque per-process token naming the logical conversation across reconnects.
fn new_session_token() -> String {
    rand::random::<u64>().to_string()
}

/// The {connection, recording, processing} flags. Recording and processing
/// are independent booleans over the connected/disconnected axis, not one
/// enum: both can be true at once.
#[derive(Debug, Default)]
struct SessionState {
    audio_mode: bool,
    recording: bool,
    processing: bool,
    audio_level: f32,
    current_turn: Option<Uuid>,
}

/// State plus event emission; the only place session flags are mutated.
struct SessionCore {
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
    playback: Option<Box<dyn PlaybackSink>>,
    chunks_sent: u64,
    bytes_sent: u64,
}

impl SessionCore {
    fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            state: SessionState::default(),
            events,
            playback: None,
            chunks_sent: 0,
            bytes_sent: 0,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_recording(&mut self, recording: bool) {
        if self.state.recording != recording {
            self.state.recording = recording;
            self.emit(SessionEvent::RecordingChanged(recording));
        }
    }

    fn set_processing(&mut self, processing: bool) {
        if self.state.processing != processing {
            self.state.processing = processing;
            self.emit(SessionEvent::ProcessingChanged(processing));
        }
    }

    fn set_level(&mut self, level: f32) {
        self.state.audio_level = level;
        self.emit(SessionEvent::AudioLevelChanged(level));
    }

    fn reset_audio_stats(&mut self) {
        self.chunks_sent = 0;
        self.bytes_sent = 0;
    }

    fn note_chunk_sent(&mut self, payload_len: usize) {
        self.chunks_sent += 1;
        self.bytes_sent += payload_len as u64;
        debug!(
            chunk = self.chunks_sent,
            bytes = payload_len,
            total_bytes = self.bytes_sent,
            "audio chunk sent"
        );
    }

    /// Interprets one inbound envelope.
    fn handle_inbound(&mut self, envelope: Envelope) {
        // A turn boundary carries no payload and has no other effect.
        if envelope.is_turn_boundary() {
            self.state.current_turn = None;
            self.set_processing(false);
            return;
        }

        let Some(mime_type) = envelope.mime_type else {
            warn!("inbound envelope with no payload kind, skipped");
            return;
        };

        // First payload envelope of a turn starts the processing indicator.
        self.set_processing(true);

        match mime_type {
            MimeType::AudioPcm => {
                let Some(sink) = self.playback.as_mut() else {
                    return;
                };
                let Some(data) = envelope.data else {
                    warn!("audio envelope with no data, skipped");
                    return;
                };
                match codec::decode(&data) {
                    Ok(pcm) => sink.play(Bytes::from(pcm)),
                    // Decode failure drops the frame; the session stays up.
                    Err(e) => warn!(error = %e, "dropping malformed audio frame"),
                }
            }
            MimeType::TextPlain => {
                let turn = *self.state.current_turn.get_or_insert_with(Uuid::new_v4);
                let role = envelope.role.unwrap_or(Role::Model);
                let content = envelope.data.unwrap_or_default();
                self.emit(SessionEvent::TextMessage {
                    role,
                    content,
                    turn,
                });
            }
        }
    }
}

/// The live capture side of a voice activation.
struct CaptureState {
    frames: mpsc::UnboundedReceiver<Bytes>,
    live: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
    _guard: Box<dyn Any + Send>,
}

async fn run_session(
    config: Config,
    backend: Arc<dyn AudioBackend>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let token = new_session_token();
    info!(session = %token, "starting session");
    let mut transport = Transport::new(config.server_url, token, config.reconnect_delay);
    let mut core = SessionCore::new(events);
    let mut capture: Option<CaptureState> = None;

    report_connect(transport.connect(false).await, &core);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::ToggleVoice) => {
                    if core.state.recording {
                        stop_voice(&mut transport, &mut core, &mut capture).await;
                    } else {
                        start_voice(&mut transport, &mut core, &mut capture, &backend).await;
                    }
                }
                Some(Command::SendText(text)) => {
                    transport.send(&Envelope::user_text(text)).await;
                }
                Some(Command::Shutdown) | None => break,
            },
            event = transport.next_event() => match event {
                TransportEvent::Inbound(envelope) => core.handle_inbound(envelope),
                TransportEvent::Closed => core.emit(SessionEvent::ConnectionChanged(false)),
                TransportEvent::ReconnectDue => {
                    info!("reconnecting");
                    report_connect(transport.connect(core.state.audio_mode).await, &core);
                }
            },
            frame = next_frame(&mut capture) => match frame {
                Some(frame) => {
                    let envelope = Envelope::audio_chunk(&frame);
                    core.note_chunk_sent(frame.len());
                    transport.send(&envelope).await;
                }
                None => {
                    // The device stream ended on its own; unwind as a stop.
                    warn!("capture pipeline ended unexpectedly");
                    core.emit(SessionEvent::Error {
                        message: "capture pipeline ended unexpectedly".to_string(),
                    });
                    stop_voice(&mut transport, &mut core, &mut capture).await;
                }
            },
        }
    }

    // Page-unload equivalent: intentional close plus pipeline teardown.
    teardown_capture(&mut core, &mut capture);
    core.playback = None;
    transport.close(true).await;
    core.emit(SessionEvent::ConnectionChanged(false));
    info!("session closed");
}

/// Pends while no capture pipeline is active.
async fn next_frame(capture: &mut Option<CaptureState>) -> Option<Bytes> {
    match capture.as_mut() {
        Some(state) => state.frames.recv().await,
        None => std::future::pending().await,
    }
}

fn report_connect(result: Result<(), TransportError>, core: &SessionCore) {
    match result {
        Ok(()) => core.emit(SessionEvent::ConnectionChanged(true)),
        Err(e) => {
            warn!(error = %e, "connect failed; retry scheduled");
            core.emit(SessionEvent::ConnectionChanged(false));
        }
    }
}

async fn start_voice(
    transport: &mut Transport,
    core: &mut SessionCore,
    capture: &mut Option<CaptureState>,
    backend: &Arc<dyn AudioBackend>,
) {
    core.state.audio_mode = true;
    core.set_recording(true);
    core.reset_audio_stats();

    match activate_capture(transport, core, backend).await {
        Ok(state) => {
            *capture = Some(state);
            info!("voice capture active");
        }
        Err(e) => {
            warn!(error = %e, "voice start failed, rolling back");
            core.state.audio_mode = false;
            core.set_recording(false);
            core.playback = None;
            core.emit(SessionEvent::Error {
                message: format!("voice start failed: {e}"),
            });
            if transport.is_open() {
                // Capture failed after the audio-mode connect succeeded;
                // fall back to a text-mode connection.
                report_connect(transport.connect(false).await, core);
            } else {
                core.emit(SessionEvent::ConnectionChanged(false));
            }
        }
    }
}

/// Reconnects in audio mode, then brings up playback, capture, and the
/// level monitor.
async fn activate_capture(
    transport: &mut Transport,
    core: &mut SessionCore,
    backend: &Arc<dyn AudioBackend>,
) -> Result<CaptureState, StartVoiceError> {
    transport.connect(true).await?;
    core.emit(SessionEvent::ConnectionChanged(true));

    let playback = backend.open_playback()?;
    let pipeline = backend.start_capture()?;
    core.playback = Some(playback);

    let live = Arc::new(AtomicBool::new(true));
    let events = core.events.clone();
    let monitor = spawn_level_monitor(pipeline.tap, live.clone(), move |level| {
        let _ = events.send(SessionEvent::AudioLevelChanged(level));
    });

    Ok(CaptureState {
        frames: pipeline.frames,
        live,
        monitor,
        _guard: pipeline.guard,
    })
}

#[derive(Debug, thiserror::Error)]
enum StartVoiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

async fn stop_voice(
    transport: &mut Transport,
    core: &mut SessionCore,
    capture: &mut Option<CaptureState>,
) {
    teardown_capture(core, capture);
    core.playback = None;
    core.state.audio_mode = false;
    core.set_recording(false);
    core.set_level(0.0);

    // Renegotiate back to a text-only connection.
    report_connect(transport.connect(false).await, core);
}

/// Tears the pipeline down before `recording` is observed false anywhere:
/// the liveness flag clears, the monitor is aborted, and dropping the
/// pipeline stops the device stream and detaches the tap.
fn teardown_capture(core: &SessionCore, capture: &mut Option<CaptureState>) {
    if let Some(state) = capture.take() {
        state.live.store(false, Ordering::Relaxed);
        state.monitor.abort();
        info!(
            chunks = core.chunks_sent,
            bytes = core.bytes_sent,
            "capture stopped"
        );
    }
}
