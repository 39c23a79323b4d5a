pub mod backend;
#[cfg(feature = "audio-io")]
pub mod device;
pub mod level;

// Fixed convention for the wire: 16-bit little-endian mono PCM at 24kHz.
pub const PCM_SAMPLE_RATE: f64 = 24000.0;

/// Number of magnitude bins in one spectrum snapshot from the analysis tap.
pub const SPECTRUM_BINS: usize = 256;

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Packs i16 samples into the little-endian byte layout used on the wire.
pub fn pcm16_to_bytes(pcm16: &[i16]) -> Vec<u8> {
    pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect()
}

/// Unpacks little-endian wire bytes into i16 samples. A trailing odd byte is dropped.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Reduces one frame of mono samples to a fixed-size magnitude snapshot.
///
/// Bin magnitudes are the rectified mean amplitude of equal slices of the
/// frame, scaled to the 0..=255 range the level reduction normalizes by.
pub fn rectified_spectrum(samples: &[f32], bins: &mut [u8; SPECTRUM_BINS]) {
    for (i, bin) in bins.iter_mut().enumerate() {
        let start = i * samples.len() / SPECTRUM_BINS;
        let end = (i + 1) * samples.len() / SPECTRUM_BINS;
        if start == end {
            *bin = 0;
            continue;
        }
        let mean: f32 =
            samples[start..end].iter().map(|s| s.abs()).sum::<f32>() / (end - start) as f32;
        *bin = (mean * 255.0).clamp(0.0, 255.0) as u8;
    }
}
