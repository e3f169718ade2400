//! PCM conversions between the capture domain (normalized `f32`) and the wire
//! (little-endian PCM16 wrapped in base64 text).

use crate::error::SessionError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate of every frame exchanged with the agent.
pub const WIRE_SAMPLE_RATE: u32 = 16_000;

/// A buffer "has audio" once any sample rises above this magnitude.
pub const SILENCE_THRESHOLD: f32 = 0.01;

/// Raw bytes encoded per base64 pass. A multiple of 3 so no padding lands mid-stream.
const ENCODE_CHUNK_BYTES: usize = 3 * 0x4000;

/// Encodes capture samples into the base64 PCM16 text carried by `user_audio_chunk`.
///
/// Samples are clamped to [-1, 1] and scaled by `i16::MAX` with truncation toward
/// zero. The byte buffer is encoded in bounded chunks so large captures never need a
/// second full-size intermediate.
pub fn encode_outbound(samples: &[f32]) -> String {
    let pcm16 = convert_f32_to_pcm16_bytes(samples);
    let mut encoded = String::with_capacity(pcm16.len().div_ceil(3) * 4);
    for chunk in pcm16.chunks(ENCODE_CHUNK_BYTES) {
        base64::engine::general_purpose::STANDARD.encode_string(chunk, &mut encoded);
    }
    encoded
}

/// Decodes an inbound `audio_base_64` payload into the raw PCM bytes the renderer
/// consumes. Empty input yields an empty buffer.
pub fn decode_inbound(base64_fragment: &str) -> Result<Vec<u8>, SessionError> {
    if base64_fragment.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(base64_fragment)
        .map_err(|e| SessionError::MalformedMessage(format!("invalid base64 audio: {e}")))
}

/// Returns true when any sample exceeds [`SILENCE_THRESHOLD`] in magnitude.
pub fn has_audio(samples: &[f32]) -> bool {
    samples.iter().any(|s| s.abs() > SILENCE_THRESHOLD)
}

/// Converts normalized samples to PCM16, truncating toward zero. `NaN` maps to 0.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

fn convert_f32_to_pcm16_bytes(pcm32: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm32.len() * 2);
    for sample in convert_f32_to_i16(pcm32) {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Reads little-endian PCM16 bytes back into samples. A trailing odd byte is ignored.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Averages interleaved frames down to a single channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Creates a mono resampler converting between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}
