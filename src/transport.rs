//! Owns the single duplex WebSocket connection to the agent endpoint,
//! including the fixed-delay reconnect schedule.

use crate::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite,
    tungstenite::protocol::Message,
};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The open handshake was rejected or failed on the network.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket open failed: {0}")]
    Open(#[from] tungstenite::Error),
}

/// What the session loop observes from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed inbound envelope, in delivery order.
    Inbound(Envelope),
    /// The connection was lost unintentionally; one reconnect is now scheduled.
    Closed,
    /// The reconnect delay elapsed; the caller should connect again.
    ReconnectDue,
}

pub struct Transport {
    endpoint: String,
    session: String,
    reconnect_delay: Duration,
    stream: Option<WsStream>,
    reconnect_at: Option<Instant>,
}

impl Transport {
    pub fn new(endpoint: String, session: String, reconnect_delay: Duration) -> Self {
        Self {
            endpoint,
            session,
            reconnect_delay,
            stream: None,
            reconnect_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect target, parameterized by session identity and audio mode.
    /// Reconnecting with a different `audio_mode` is how capability
    /// renegotiation happens; there is no in-band renegotiation message.
    fn target_url(&self, audio_mode: bool) -> String {
        format!(
            "{}/ws/{}?is_audio={}",
            self.endpoint.trim_end_matches('/'),
            self.session,
            audio_mode
        )
    }

    /// Opens a new connection, discarding any existing connection and any
    /// pending reconnect first. Resolves only once the open handshake
    /// completes. On failure one reconnect attempt is scheduled.
    pub async fn connect(&mut self, audio_mode: bool) -> Result<(), TransportError> {
        self.disconnect().await;
        self.reconnect_at = None;

        let url = self.target_url(audio_mode);
        debug!(%url, "opening websocket");
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                self.stream = Some(stream);
                info!(audio_mode, "websocket open");
                Ok(())
            }
            Err(e) => {
                self.arm_reconnect();
                Err(TransportError::Open(e))
            }
        }
    }

    /// Closes the current connection. An intentional close suppresses the
    /// reconnect that would otherwise be scheduled. The suppression is
    /// one-shot: the next unintentional close schedules again.
    pub async fn close(&mut self, intentional: bool) {
        self.disconnect().await;
        if intentional {
            self.reconnect_at = None;
        } else {
            self.arm_reconnect();
        }
    }

    /// Sends one envelope. Silently drops it when no connection is open:
    /// for a live media stream, late delivery of a stale frame is worse
    /// than losing it.
    pub async fn send(&mut self, envelope: &Envelope) {
        let Some(stream) = self.stream.as_mut() else {
            trace!("send with no open connection, dropped");
            return;
        };
        match serde_json::to_string(envelope) {
            Ok(json) => {
                if let Err(e) = stream.send(Message::Text(json.into())).await {
                    warn!(error = %e, "websocket send failed");
                }
            }
            Err(e) => warn!(error = %e, "envelope serialization failed"),
        }
    }

    /// Yields the next transport event. Pends forever when there is neither
    /// a connection nor a scheduled reconnect. Unparseable inbound text and
    /// non-text frames are skipped.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            if let Some(stream) = self.stream.as_mut() {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => return TransportEvent::Inbound(envelope),
                            Err(e) => warn!(error = %e, "unparseable inbound frame, skipped"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "server closed connection");
                        self.stream = None;
                        self.arm_reconnect();
                        return TransportEvent::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        self.stream = None;
                        self.arm_reconnect();
                        return TransportEvent::Closed;
                    }
                    None => {
                        self.stream = None;
                        self.arm_reconnect();
                        return TransportEvent::Closed;
                    }
                }
            } else if let Some(at) = self.reconnect_at {
                sleep_until(at).await;
                self.reconnect_at = None;
                return TransportEvent::ReconnectDue;
            } else {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn arm_reconnect(&mut self) {
        self.reconnect_at = Some(Instant::now() + self.reconnect_delay);
    }
}
