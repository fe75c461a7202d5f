//! # PCM Conversion
//!
//! Turns binary audio frames into sample windows.
//!
//! ## Byte alignment:
//! A frame carries signed 16-bit little-endian samples, so its length should
//! be even. Clients that slice their byte stream arbitrarily can send an odd
//! number of bytes; the frame is then padded with one trailing zero byte. The
//! last sample keeps its low byte and gets a zero high byte. The padding is
//! local to the frame: nothing is carried over to the next one.

use byteorder::{ByteOrder, LittleEndian};
use std::borrow::Cow;

/// Return the payload with an even length, appending one zero byte if needed.
pub fn pad_to_even(payload: &[u8]) -> Cow<'_, [u8]> {
    if payload.len() % 2 == 0 {
        Cow::Borrowed(payload)
    } else {
        let mut padded = Vec::with_capacity(payload.len() + 1);
        padded.extend_from_slice(payload);
        padded.push(0);
        Cow::Owned(padded)
    }
}

/// Decode a binary frame into samples.
///
/// The window has `ceil(len / 2)` samples. Never fails.
pub fn decode_pcm16le(payload: &[u8]) -> Vec<i16> {
    let bytes = pad_to_even(payload);
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes, &mut samples);
    samples
}

/// Scale 16-bit PCM into [-1.0, 1.0) for the resampler.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Scale floats back to 16-bit PCM, clamping anything the filter overshot.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_payload_is_not_copied() {
        let payload = [1u8, 2, 3, 4];
        assert!(matches!(pad_to_even(&payload), Cow::Borrowed(_)));
    }

    #[test]
    fn test_decode_even_length() {
        let samples: Vec<i16> = vec![0, 1, -1, i16::MAX, i16::MIN, 1234];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let decoded = decode_pcm16le(&bytes);
        assert_eq!(decoded.len(), bytes.len() / 2);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_decode_odd_length_pads_high_byte() {
        // 1281 bytes: 640 full samples plus one dangling low byte
        let mut bytes = vec![0xFFu8; 1280];
        bytes.push(0xAB);

        let decoded = decode_pcm16le(&bytes);
        assert_eq!(decoded.len(), 641);
        assert_eq!(decoded[639], -1);
        let last = decoded[640].to_le_bytes();
        assert_eq!(last, [0xAB, 0x00]);
        assert_eq!(decoded[640], 0xAB);
    }

    #[test]
    fn test_decode_single_byte_and_empty() {
        assert_eq!(decode_pcm16le(&[0x7F]), vec![0x7F]);
        assert!(decode_pcm16le(&[]).is_empty());
    }

    #[test]
    fn test_pcm_conversion() {
        let pcm_samples = vec![0i16, 16384, -16384, 32767, -32768];
        let float_samples = pcm_to_float(&pcm_samples);
        let converted_back = float_to_pcm(&float_samples);

        assert_eq!(converted_back, pcm_samples);
        assert_eq!(float_to_pcm(&[1.5, -1.5]), vec![32767, -32768]);
    }
}
