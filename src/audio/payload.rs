//! # Voice Service Payloads
//!
//! The voice service hands audio back in several shapes depending on how it
//! was delivered: raw binary frames, JSON sample arrays, or base64 text inside
//! JSON events. [`VoiceAudio`] names each shape explicitly and normalises all
//! of them to the canonical `Vec<i16>` before resampling.

use crate::audio::frames::{samples_from_le_bytes, samples_to_le_bytes};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

/// 24.1 kHz mono PCM from the voice service, in whichever encoding it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceAudio {
    /// Little-endian 16-bit PCM bytes
    Bytes(Vec<u8>),
    /// Already-decoded samples
    Samples(Vec<i16>),
    /// Base64 text of little-endian 16-bit PCM
    Base64(String),
}

impl VoiceAudio {
    /// Normalise to samples.
    ///
    /// Malformed input never fails: an odd trailing byte is dropped and invalid
    /// base64 yields an empty buffer, which the pacer simply ignores.
    pub fn into_samples(self) -> Vec<i16> {
        match self {
            VoiceAudio::Bytes(bytes) => samples_from_le_bytes(&bytes),
            VoiceAudio::Samples(samples) => samples,
            VoiceAudio::Base64(text) => decode_base64(&text),
        }
    }
}

fn decode_base64(text: &str) -> Vec<i16> {
    match STANDARD.decode(text.trim()) {
        Ok(bytes) => samples_from_le_bytes(&bytes),
        Err(err) => {
            warn!(error = %err, "Discarding voice audio with invalid base64 payload");
            Vec::new()
        }
    }
}

/// Base64 of little-endian PCM, the encoding sent to the voice service.
pub fn encode_base64(samples: &[i16]) -> String {
    STANDARD.encode(samples_to_le_bytes(samples))
}
