//! `cpal`-backed capture and playback.
//!
//! `cpal` streams are not `Send`, so each stream lives on its own dedicated
//! thread and talks to the session through channels and the shared spectrum
//! cell. Device sample rates rarely match the wire convention, so both
//! directions resample through `rubato`.

use crate::audio::{
    self, PCM_SAMPLE_RATE, SPECTRUM_BINS,
    backend::{AudioBackend, CaptureError, CapturePipeline, PlaybackSink, SpectrumCell, SpectrumTap},
};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

const RESAMPLER_CHUNK: usize = 512;

/// Sets its flag on drop, telling the owning device thread to shut down.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Buffers incoming samples and resamples them in fixed-size chunks,
/// carrying the remainder to the next call. Pass-through when the rates
/// already match.
struct ChunkResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl ChunkResampler {
    fn new(in_rate: f64, out_rate: f64) -> Result<Self, CaptureError> {
        if (in_rate - out_rate).abs() < f64::EPSILON {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
            });
        }
        let inner = FastFixedIn::<f32>::new(
            out_rate / in_rate,
            1.0,
            PolynomialDegree::Cubic,
            RESAMPLER_CHUNK,
            1,
        )
        .map_err(|e| CaptureError::Device(format!("resampler init failed: {e}")))?;
        Ok(Self {
            inner: Some(inner),
            pending: Vec::new(),
        })
    }

    fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= RESAMPLER_CHUNK {
            let chunk: Vec<f32> = self.pending.drain(..RESAMPLER_CHUNK).collect();
            match resampler.process(&[chunk], None) {
                Ok(resampled) => out.extend_from_slice(&resampled[0]),
                Err(e) => warn!(error = %e, "resampler dropped a chunk"),
            }
        }
        out
    }
}

/// Default host capture/playback backend.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn start_capture(&self) -> Result<CapturePipeline, CaptureError> {
        let (frames_tx, frames_rx) = tokio::sync::mpsc::unbounded_channel();
        let cell: SpectrumCell = Arc::new(Mutex::new([0u8; SPECTRUM_BINS]));
        let tap = SpectrumTap::new(&cell);
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_cell = cell.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || {
            run_capture_thread(frames_tx, thread_cell, thread_stop, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CaptureError::Device(
                    "capture thread exited during startup".to_string(),
                ));
            }
        }

        Ok(CapturePipeline {
            frames: frames_rx,
            tap,
            guard: Box::new((StopOnDrop(stop), cell)),
        })
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, CaptureError> {
        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_queue = queue.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || {
            run_playback_thread(thread_queue, thread_stop, ready_tx);
        });

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CaptureError::Device(
                    "playback thread exited during startup".to_string(),
                ));
            }
        };

        let resampler = ChunkResampler::new(PCM_SAMPLE_RATE, device_rate)?;
        Ok(Box::new(CpalPlayback {
            queue,
            resampler,
            _stop: StopOnDrop(stop),
        }))
    }
}

fn run_capture_thread(
    frames: tokio::sync::mpsc::UnboundedSender<Bytes>,
    cell: SpectrumCell,
    stop: Arc<AtomicBool>,
    ready: std::sync::mpsc::Sender<Result<(), CaptureError>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready.send(Err(CaptureError::NoDevice));
        return;
    };
    let config: cpal::StreamConfig = match device.default_input_config() {
        Ok(config) => config.into(),
        Err(e) => {
            let _ = ready.send(Err(CaptureError::Device(format!("no input config: {e}"))));
            return;
        }
    };
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0 as f64;
    let mut resampler = match ChunkResampler::new(device_rate, PCM_SAMPLE_RATE) {
        Ok(resampler) => resampler,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate = device_rate,
        channels,
        "capture device open"
    );

    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = if channels == 1 {
                data.to_vec()
            } else {
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            };
            if let Ok(mut bins) = cell.lock() {
                audio::rectified_spectrum(&mono, &mut bins);
            }
            let resampled = resampler.push(&mono);
            if !resampled.is_empty() {
                let pcm = audio::convert_f32_to_i16(&resampled);
                // Receiver gone means recording stopped; frames are dropped
                // until the stop flag lands here.
                let _ = frames.send(Bytes::from(audio::pcm16_to_bytes(&pcm)));
            }
        },
        |err| error!(error = %err, "capture stream error"),
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(CaptureError::Device(format!(
                "failed to build input stream: {e}"
            ))));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(CaptureError::Device(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    info!("capture device closed");
}

fn run_playback_thread(
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: Arc<AtomicBool>,
    ready: std::sync::mpsc::Sender<Result<f64, CaptureError>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err(CaptureError::NoDevice));
        return;
    };
    let config: cpal::StreamConfig = match device.default_output_config() {
        Ok(config) => config.into(),
        Err(e) => {
            let _ = ready.send(Err(CaptureError::Device(format!("no output config: {e}"))));
            return;
        }
    };
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0 as f64;

    let callback_queue = queue.clone();
    let stream = match device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = match callback_queue.lock() {
                Ok(queue) => queue,
                Err(_) => return,
            };
            for frame in data.chunks_mut(channels) {
                let sample = queue.pop_front().unwrap_or(0.0);
                for out in frame {
                    *out = sample;
                }
            }
        },
        |err| error!(error = %err, "playback stream error"),
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(CaptureError::Device(format!(
                "failed to build output stream: {e}"
            ))));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(CaptureError::Device(format!(
            "failed to start output stream: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(device_rate));
    info!(rate = device_rate, channels, "playback device open");

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    info!("playback device closed");
}

struct CpalPlayback {
    queue: Arc<Mutex<VecDeque<f32>>>,
    resampler: ChunkResampler,
    _stop: StopOnDrop,
}

impl PlaybackSink for CpalPlayback {
    fn play(&mut self, pcm: Bytes) {
        let samples = audio::convert_i16_to_f32(&audio::bytes_to_pcm16(&pcm));
        let resampled = self.resampler.push(&samples);
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(resampled);
        }
    }
}
