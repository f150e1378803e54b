//! # Audio Pipeline
//!
//! Bridges a 48 kHz call transport and a 24.1 kHz voice service.
//!
//! ## Key Components:
//! - **resampler**: Exact-ratio 48 kHz ↔ 24.1 kHz conversion
//! - **frames**: 480-sample transport frames, batch combination, PCM byte codecs
//! - **payload**: Normalises the shapes voice-service audio arrives in
//! - **aggregator**: Batches captured audio on its way to the voice service
//! - **pacer**: Plays voice-service audio back one frame per 10 ms
//! - **stats**: Per-session pipeline counters
//!
//! ## Audio Format:
//! - **Transport side**: 48 kHz, 16-bit little-endian PCM, mono
//! - **Voice side**: 24.1 kHz, 16-bit little-endian PCM, mono

pub mod aggregator;
pub mod frames;
pub mod pacer;
pub mod payload;
pub mod resampler;
pub mod stats;
