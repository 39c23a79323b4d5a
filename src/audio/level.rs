//! The loudness-sampling loop feeding the audio-level observer.

use crate::audio::SPECTRUM_BINS;
use crate::audio::backend::SpectrumTap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Display-refresh cadence (~60Hz).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Spawns the periodic loudness reduction over a capture pipeline's tap.
///
/// Each tick reads one spectrum snapshot, reduces it to the mean bin
/// magnitude normalized into [0, 1], and hands it to `on_level`. The loop
/// checks liveness on every iteration and exits on its own when recording
/// stops or the tap is gone; teardown additionally aborts the task.
pub fn spawn_level_monitor(
    tap: SpectrumTap,
    live: Arc<AtomicBool>,
    on_level: impl Fn(f32) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bins = [0u8; SPECTRUM_BINS];
        loop {
            ticker.tick().await;
            if !live.load(Ordering::Relaxed) {
                break;
            }
            if !tap.snapshot(&mut bins) {
                break;
            }
            let sum: u32 = bins.iter().map(|&b| b as u32).sum();
            let level = sum as f32 / bins.len() as f32 / 255.0;
            on_level(level);
        }
    })
}
