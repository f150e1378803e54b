//! # Call Transport Interface
//!
//! The call session does not care how a connection was negotiated. It needs:
//! - somewhere to push outgoing transport frames ([`FrameSink`])
//! - a way to answer or create a media description and close the connection
//!   ([`CallTransport`])
//!
//! Inbound audio and connection-state changes are pushed by the adapter into
//! `CallSession::on_captured_audio` and `CallSession::on_transport_state`.
//!
//! ## Media Format:
//! Only one format exists on the transport side: 16-bit little-endian linear
//! PCM, 48 kHz, mono. Descriptions declaring anything else are rejected.

use crate::audio::frames::TransportFrame;
use crate::audio::resampler::TRANSPORT_SAMPLE_RATE;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Encoding name for 16-bit little-endian linear PCM
pub const PCM_S16LE: &str = "pcm_s16le";

/// Outbound half of a transport: accepts exactly one 10 ms frame per call.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &TransportFrame) -> anyhow::Result<()>;
}

/// A negotiated (or negotiating) audio connection owned by one call session.
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Answer a remote offer, returning the local description.
    async fn answer(&self, remote: &SessionDescription) -> anyhow::Result<SessionDescription>;

    /// Produce a local offer for the remote side to answer.
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    /// Apply the remote answer to a previously created local offer.
    async fn apply_answer(&self, remote: &SessionDescription) -> anyhow::Result<()>;

    /// Sink the output pacer delivers frames to.
    fn frame_sink(&self) -> Arc<dyn FrameSink>;

    /// Close the underlying connection. Called once during session teardown.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Connection state reported by the transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Audio format declared by one side of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

impl MediaFormat {
    /// The only format the transport side supports.
    pub fn transport() -> Self {
        Self {
            encoding: PCM_S16LE.to_string(),
            sample_rate: TRANSPORT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// Offer or answer exchanged while setting up a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub media: MediaFormat,
}

impl SessionDescription {
    pub fn offer() -> Self {
        Self {
            kind: DescriptionKind::Offer,
            media: MediaFormat::transport(),
        }
    }

    pub fn answer() -> Self {
        Self {
            kind: DescriptionKind::Answer,
            media: MediaFormat::transport(),
        }
    }

    /// Validate a remote description before it reaches the transport.
    ///
    /// ## Checks:
    /// 1. **Kind**: Must be the kind the caller expects (offer vs answer)
    /// 2. **Encoding**: Must be 16-bit little-endian PCM
    /// 3. **Sample rate**: Must be 48 kHz
    /// 4. **Channels**: Must be mono
    pub fn validate(&self, expected: DescriptionKind) -> AppResult<()> {
        if self.kind != expected {
            return Err(AppError::ValidationError(format!(
                "Expected {:?} description, got {:?}",
                expected, self.kind
            )));
        }

        if !self.media.encoding.eq_ignore_ascii_case(PCM_S16LE) {
            return Err(AppError::ValidationError(format!(
                "Unsupported encoding '{}': only {} is supported",
                self.media.encoding, PCM_S16LE
            )));
        }

        if self.media.sample_rate != TRANSPORT_SAMPLE_RATE {
            return Err(AppError::ValidationError(format!(
                "Sample rate mismatch: expected {}, got {}",
                TRANSPORT_SAMPLE_RATE, self.media.sample_rate
            )));
        }

        if self.media.channels != 1 {
            return Err(AppError::ValidationError(format!(
                "Channel count mismatch: expected 1, got {}",
                self.media.channels
            )));
        }

        Ok(())
    }
}
