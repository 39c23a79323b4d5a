//! Interactive terminal client for a voicelink session.
//!
//! Plays the part of the presentation layer: prints agent text as it
//! streams in, reports connection/recording state, and turns typed lines
//! into commands. `/voice` toggles the microphone, `/quit` exits.

use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use voicelink::audio::backend::AudioBackend;
use voicelink::config::Config;
use voicelink::session::{SessionEvent, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Keep stdout clean for the conversation itself.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr)
        .init();

    #[cfg(feature = "audio-io")]
    let backend: Arc<dyn AudioBackend> = Arc::new(voicelink::audio::device::CpalBackend::new());
    #[cfg(not(feature = "audio-io"))]
    let backend: Arc<dyn AudioBackend> = Arc::new(voicelink::audio::backend::NullBackend);

    let (session, mut events) = SessionManager::spawn(config, backend);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::TextMessage { content, .. } => {
                    print!("{content}");
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::ProcessingChanged(false) => println!(),
                SessionEvent::ProcessingChanged(true) => {}
                SessionEvent::ConnectionChanged(connected) => info!(connected, "connection"),
                SessionEvent::RecordingChanged(recording) => info!(recording, "recording"),
                SessionEvent::AudioLevelChanged(_) => {}
                SessionEvent::Error { message } => error!(%message, "session error"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "" => {}
                    "/voice" => session.toggle_voice().await?,
                    "/quit" => break,
                    text => session.send_text(text).await?,
                },
                None => break,
            },
        }
    }

    session.shutdown().await;
    printer.abort();
    info!("session closed");
    Ok(())
}
