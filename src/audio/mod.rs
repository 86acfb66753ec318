//! Pure audio codec functions: µ-law/linear-PCM conversion, 8kHz↔16kHz resampling, and
//! provider-frame chunking (§4.2). No I/O; every failure is `ErrorKind::AudioFormat`.
//!
//! The resampler uses linear interpolation, a reasonable trade-off for speech-band audio
//! at these rates; a future pass could swap in `rubato` for higher quality if the quality
//! bar rises. It runs in both directions at the 8kHz/16kHz rates the telephony wire format
//! actually needs.

use thiserror::Error;

pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;
pub const INFERENCE_SAMPLE_RATE: u32 = 16_000;
/// 100ms @ 8kHz, 16-bit mono, little-endian (§3 invariant).
pub const FRAME_BYTES_MULTIPLE: usize = 320;
pub const FRAME_MAX_BYTES: usize = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioFormatError {
    #[error("audio buffer length {0} is not a multiple of 2 bytes (i16 samples)")]
    MisalignedBuffer(usize),
    #[error("frame payload length {0} exceeds the maximum of {FRAME_MAX_BYTES}")]
    FrameTooLarge(usize),
}

// ITU-T G.711 µ-law tables (standard 8-bit companding of 14-bit linear PCM).
const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Encode one linear PCM sample (16-bit, but effectively 14-bit dynamic range per G.711)
/// to its 8-bit µ-law byte.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80u8 } else { 0x00u8 };
    let mut magnitude = if sample < 0 {
        (-(sample as i32)).min(MULAW_CLIP as i32) as i16
    } else {
        sample.min(MULAW_CLIP)
    };
    magnitude += MULAW_BIAS;

    let mut exponent: u8 = 7;
    for (exp, threshold) in MULAW_EXP_THRESHOLDS.iter().enumerate() {
        if magnitude <= *threshold {
            exponent = exp as u8;
            break;
        }
    }
    let shift = exponent + 3;
    let mantissa = ((magnitude >> shift) & 0x0F) as u8;
    let byte = !(sign | (exponent << 4) | mantissa);
    byte
}

const MULAW_EXP_THRESHOLDS: [i16; 8] = [
    0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF,
];

/// Decode one µ-law byte back to a linear PCM sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let magnitude = ((mantissa as i32) << 1 | 1) << (exponent + 2);
    let sample = magnitude - MULAW_BIAS as i32;
    let sample = if sign != 0 { -sample } else { sample };
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Decode an 8kHz µ-law byte stream to 16kHz linear PCM (the working rate for AI providers).
pub fn decode_mulaw_8k(bytes: &[u8]) -> Vec<i16> {
    let pcm_8k: Vec<i16> = bytes.iter().map(|&b| mulaw_to_linear(b)).collect();
    resample(&pcm_8k, TELEPHONY_SAMPLE_RATE, INFERENCE_SAMPLE_RATE)
}

/// Encode 16kHz linear PCM down to 8kHz µ-law. Kept for providers whose wire format is
/// µ-law; the default outbound telephony frame (§6) is linear PCM 8kHz LE, produced by
/// [`downsample_to_telephony`] instead.
pub fn encode_mulaw_8k(pcm_16k: &[i16]) -> Vec<u8> {
    let pcm_8k = resample(pcm_16k, INFERENCE_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE);
    pcm_8k.iter().map(|&s| linear_to_mulaw(s)).collect()
}

/// Resample 16kHz linear PCM (the AI-provider working rate) down to 8kHz linear PCM for
/// the outbound telephony frame, which §6 specifies as "linear PCM 8 kHz mono LE" — no
/// µ-law encoding on the outbound leg.
pub fn downsample_to_telephony(pcm_16k: &[i16]) -> Vec<i16> {
    resample(pcm_16k, INFERENCE_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE)
}

/// Linear-interpolation resampler between arbitrary rates. Quality is adequate for
/// speech at telephony rates; see module docs for the production-upgrade note.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos as usize;

        if src_idx + 1 < samples.len() {
            let frac = src_pos - src_idx as f64;
            let s1 = samples[src_idx] as f64;
            let s2 = samples[src_idx + 1] as f64;
            let interpolated = s1 + (s2 - s1) * frac;
            output.push(interpolated.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        } else if let Some(&last) = samples.last() {
            output.push(last);
        }
    }

    output
}

/// Convert little-endian PCM bytes to `i16` samples, rejecting misaligned buffers.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, AudioFormatError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioFormatError::MisalignedBuffer(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Split an 8kHz-LE16 PCM byte buffer into frames whose length is a positive multiple of
/// [`FRAME_BYTES_MULTIPLE`] and at most [`FRAME_MAX_BYTES`]; the final short frame is
/// zero-padded up to the next multiple (§3, §4.2, §8).
pub fn frame_for_provider(pcm_8k_le16: &[u8]) -> Result<Vec<Vec<u8>>, AudioFormatError> {
    if pcm_8k_le16.len() % 2 != 0 {
        return Err(AudioFormatError::MisalignedBuffer(pcm_8k_le16.len()));
    }

    const MAX_SAMPLES_PER_FRAME: usize = (FRAME_MAX_BYTES / FRAME_BYTES_MULTIPLE) * FRAME_BYTES_MULTIPLE;

    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < pcm_8k_le16.len() {
        let remaining = pcm_8k_le16.len() - offset;
        let take = remaining.min(MAX_SAMPLES_PER_FRAME);
        let mut frame = pcm_8k_le16[offset..offset + take].to_vec();

        let padded_len = frame.len().div_ceil(FRAME_BYTES_MULTIPLE) * FRAME_BYTES_MULTIPLE;
        frame.resize(padded_len, 0);

        if frame.len() > FRAME_MAX_BYTES {
            return Err(AudioFormatError::FrameTooLarge(frame.len()));
        }

        frames.push(frame);
        offset += take;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_roundtrip_is_within_companding_tolerance() {
        for sample in [-30000i16, -1000, -1, 0, 1, 1000, 30000] {
            let encoded = linear_to_mulaw(sample);
            let decoded = mulaw_to_linear(encoded);
            let diff = (decoded as i32 - sample as i32).unsigned_abs();
            assert!(diff < 512, "sample {sample} decoded to {decoded}, diff {diff}");
        }
    }

    #[test]
    fn resample_noop_when_rates_match() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(resample(&samples, 8000, 8000), samples);
    }

    #[test]
    fn resample_upsamples_to_expected_length() {
        let samples = vec![0i16; 800]; // 100ms @ 8kHz
        let up = resample(&samples, 8000, 16000);
        assert_eq!(up.len(), 1600); // 100ms @ 16kHz
    }

    #[test]
    fn downsample_to_telephony_halves_sample_count_without_companding() {
        let pcm_16k = vec![1000i16; 1600]; // 100ms @ 16kHz
        let pcm_8k = downsample_to_telephony(&pcm_16k);
        assert_eq!(pcm_8k.len(), 800);
        assert!(pcm_8k.iter().all(|&s| (s - 1000).abs() < 5));
    }

    #[test]
    fn frame_lengths_are_multiples_of_320_and_capped() {
        let pcm = vec![0u8; 321]; // deliberately not aligned to the frame multiple
        let frames = frame_for_provider(&pcm).unwrap_err();
        assert_eq!(frames, AudioFormatError::MisalignedBuffer(321));

        let pcm = vec![1u8; 500]; // 250 samples, odd alignment but even byte length
        let frames = frame_for_provider(&pcm).unwrap();
        for f in &frames {
            assert_eq!(f.len() % FRAME_BYTES_MULTIPLE, 0);
            assert!(f.len() <= FRAME_MAX_BYTES);
            assert!(!f.is_empty());
        }
    }

    #[test]
    fn large_buffer_splits_into_multiple_capped_frames() {
        let pcm = vec![7u8; FRAME_MAX_BYTES + FRAME_BYTES_MULTIPLE * 3];
        let frames = frame_for_provider(&pcm).unwrap();
        assert!(frames.len() >= 2);
        for f in &frames {
            assert!(f.len() <= FRAME_MAX_BYTES);
        }
    }

    proptest::proptest! {
        #[test]
        fn mulaw_never_panics_and_stays_in_range(sample: i16) {
            let encoded = linear_to_mulaw(sample);
            let decoded = mulaw_to_linear(encoded);
            proptest::prop_assert!(decoded >= i16::MIN && decoded <= i16::MAX);
        }

        #[test]
        fn framing_always_produces_aligned_capped_nonempty_frames(len in 0usize..=4000) {
            let pcm = vec![0u8; len * 2];
            if let Ok(frames) = frame_for_provider(&pcm) {
                for f in &frames {
                    proptest::prop_assert_eq!(f.len() % FRAME_BYTES_MULTIPLE, 0);
                    proptest::prop_assert!(f.len() <= FRAME_MAX_BYTES);
                    proptest::prop_assert!(!f.is_empty());
                }
            }
        }
    }
}
