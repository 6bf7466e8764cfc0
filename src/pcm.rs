//! PCM frame codec for the live audio pipeline.
//!
//! The streaming API speaks base64-encoded 16-bit little-endian PCM in both
//! directions. Capture frames arrive as f32 samples in [-1.0, 1.0] and are
//! quantized on the way out; model audio comes back the same way and is
//! rescaled to f32 for playback.

use base64::engine::general_purpose;
use base64::Engine;
use thiserror::Error;

/// MIME type attached to microphone audio sent upstream.
pub const PCM_MIME_16K: &str = "audio/pcm;rate=16000";

/// Errors from decoding a received audio payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    Format(#[from] base64::DecodeError),
    #[error("PCM payload truncated mid-sample ({0} bytes)")]
    IncompleteSample(usize),
}

/// A base64-encoded PCM payload plus its MIME type, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Encode one capture frame as 16-bit little-endian PCM, base64.
///
/// Samples outside [-1.0, 1.0] saturate; they never wrap.
pub fn encode_frame(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    EncodedChunk {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: PCM_MIME_16K.to_string(),
    }
}

/// Decode a base64 audio payload to raw bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(data)?)
}

/// Interpret raw bytes as 16-bit little-endian PCM, rescaled to f32.
pub fn samples_from_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::IncompleteSample(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

/// Root-mean-square level of a frame, 0.0 for an empty one.
///
/// Feeds the capture level meter; stays in [0, 1] for in-range input.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_quantization_step() {
        // Sweep every 16-bit level; re-encoding a decoded stream must stay
        // within one step of the original value.
        let mut bytes = Vec::with_capacity(65536 * 2);
        for v in i16::MIN..=i16::MAX {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let samples = samples_from_pcm16(&bytes).unwrap();
        let chunk = encode_frame(&samples);
        let round = samples_from_pcm16(&decode_base64(&chunk.data).unwrap()).unwrap();
        assert_eq!(round.len(), samples.len());
        for (orig, rt) in samples.iter().zip(round.iter()) {
            let err = (*orig as f64 - *rt as f64).abs();
            assert!(
                err <= 1.0 / 32768.0,
                "sample {} round-tripped to {} (error {})",
                orig,
                rt,
                err
            );
        }
    }

    #[test]
    fn test_encode_saturates_out_of_range() {
        let chunk = encode_frame(&[2.0, -2.0, 1.0, -1.0]);
        let bytes = decode_base64(&chunk.data).unwrap();
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![32767, -32767, 32767, -32767]);
    }

    #[test]
    fn test_encode_carries_input_mime() {
        let chunk = encode_frame(&[0.0; 4]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = decode_base64("definitely not base64!!!").unwrap_err();
        assert!(matches!(err, CodecError::Format(_)));
    }

    #[test]
    fn test_odd_byte_count_is_incomplete_sample() {
        let err = samples_from_pcm16(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, CodecError::IncompleteSample(3)));
    }

    #[test]
    fn test_empty_frame_is_fine() {
        let chunk = encode_frame(&[]);
        assert!(decode_base64(&chunk.data).unwrap().is_empty());
        assert!(samples_from_pcm16(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_rms_of_known_signals() {
        assert_eq!(rms_level(&[]), 0.0);
        assert!((rms_level(&[0.5; 64]) - 0.5).abs() < 1e-6);
        let alternating: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((rms_level(&alternating) - 1.0).abs() < 1e-6);
    }
}
