//! # Voice Service Interface
//!
//! The remote conversational voice service is a black box: it accepts
//! 24.1 kHz mono PCM and asynchronously produces 24.1 kHz mono PCM back.
//!
//! ## Key Components:
//! - **VoiceConnector**: Opens one connection per call session
//! - **VoiceChannel**: Outbound half (audio batches, greeting requests, close)
//! - **VoiceConnection::audio**: Inbound half, a channel of [`VoiceAudio`] payloads
//! - **realtime**: WebSocket implementation used by the server binary

pub mod realtime;

pub use realtime::RealtimeVoiceConnector;

use crate::audio::payload::VoiceAudio;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half of a voice-service connection.
#[async_trait]
pub trait VoiceChannel: Send + Sync {
    /// Send one aggregation batch of 24.1 kHz samples.
    async fn send_audio(&self, samples: &[i16]) -> anyhow::Result<()>;

    /// Ask the service to speak `text`; the audio comes back on the inbound half.
    async fn speak(&self, text: &str) -> anyhow::Result<()>;

    /// Release the connection. Called once during session teardown.
    async fn close(&self) -> anyhow::Result<()>;
}

/// An initialised connection to the voice service.
pub struct VoiceConnection {
    pub channel: Arc<dyn VoiceChannel>,
    /// Closed by the service side when the connection ends
    pub audio: mpsc::Receiver<VoiceAudio>,
}

/// Opens voice-service connections for new call sessions.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, session_id: &str) -> anyhow::Result<VoiceConnection>;
}
