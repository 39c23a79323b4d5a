//! Seam between the session and the host audio device.
//!
//! The session only ever sees this trait surface: a capture pipeline
//! delivering PCM16 frames plus an analysis tap, and a playback sink for
//! inbound model audio. The `cpal` implementation lives in
//! [`crate::audio::device`]; tests substitute in-memory implementations.

use crate::audio::SPECTRUM_BINS;
use bytes::Bytes;
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Reported when the microphone cannot be acquired or the device stream fails.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDevice,
    #[error("capture device failure: {0}")]
    Device(String),
}

/// Latest spectrum snapshot, written by the capture side and read by the
/// level monitor.
pub type SpectrumCell = Arc<Mutex<[u8; SPECTRUM_BINS]>>;

/// Read handle onto a capture pipeline's spectrum cell.
///
/// Holds only a weak reference: once the pipeline is torn down the tap
/// reports itself gone, which is how the level monitor notices teardown.
pub struct SpectrumTap {
    cell: Weak<Mutex<[u8; SPECTRUM_BINS]>>,
}

impl SpectrumTap {
    pub fn new(cell: &SpectrumCell) -> Self {
        Self {
            cell: Arc::downgrade(cell),
        }
    }

    /// Copies the current snapshot into `out`. Returns false once the
    /// backing pipeline is gone.
    pub fn snapshot(&self, out: &mut [u8; SPECTRUM_BINS]) -> bool {
        let Some(cell) = self.cell.upgrade() else {
            return false;
        };
        match cell.lock() {
            Ok(bins) => {
                out.copy_from_slice(&*bins);
                true
            }
            Err(_) => false,
        }
    }
}

/// Sink for inbound model audio, installed only while voice is active.
pub trait PlaybackSink: Send {
    /// Queues one decoded PCM16 buffer for immediate rendering.
    fn play(&mut self, pcm: Bytes);
}

/// The live microphone-to-frames path.
///
/// Dropping the pipeline stops the device stream and detaches the tap.
pub struct CapturePipeline {
    /// PCM16 mono frames at the wire sample rate, in capture order.
    pub frames: mpsc::UnboundedReceiver<Bytes>,
    pub tap: SpectrumTap,
    /// Keeps the device resources alive; dropped on teardown.
    pub guard: Box<dyn Any + Send>,
}

/// Audio capture/playback backend.
pub trait AudioBackend: Send + Sync {
    /// Acquires the microphone and starts delivering frames.
    fn start_capture(&self) -> Result<CapturePipeline, CaptureError>;

    /// Opens the playback path for inbound model audio.
    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, CaptureError>;
}

/// Backend used when no audio device support is compiled in. Voice commands
/// fail cleanly and the session stays in text mode.
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn start_capture(&self) -> Result<CapturePipeline, CaptureError> {
        Err(CaptureError::NoDevice)
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, CaptureError> {
        Err(CaptureError::NoDevice)
    }
}
