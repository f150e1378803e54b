//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__PACING_TICK_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! Nested keys use a double underscore because the field names themselves
//! contain single underscores.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub voice: VoiceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Timing and sizing of the audio pipeline.
///
/// ## Fields:
/// - `aggregation_tick_ms`: How often the input aggregator checks for a ready batch
/// - `flush_frame_count`: Captured frames that force a batch flush
/// - `flush_idle_ms`: Silence after the last captured frame that forces a flush
/// - `batch_duration_ms`: Length a batch is truncated to before resampling
/// - `pacing_tick_ms`: Cadence of frames sent back to the transport
/// - `max_queued_frames`: Output queue cap; oldest frames are dropped past it (0 = unbounded)
///
/// The default cap of 3000 frames makes the pacer lossy once more than 30 s of
/// voice audio is waiting for playback. Every frame of a smaller backlog is
/// delivered. Set it to 0 to keep the whole backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub aggregation_tick_ms: u64,
    pub flush_frame_count: usize,
    pub flush_idle_ms: u64,
    pub batch_duration_ms: u32,
    pub pacing_tick_ms: u64,
    pub max_queued_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            aggregation_tick_ms: 20,
            flush_frame_count: 3,
            flush_idle_ms: 50,
            batch_duration_ms: 30, // 3 transport frames
            pacing_tick_ms: 10,
            max_queued_frames: 3000, // 30 seconds of playback
        }
    }
}

impl AudioConfig {
    pub fn aggregation_tick(&self) -> Duration {
        Duration::from_millis(self.aggregation_tick_ms)
    }

    pub fn flush_idle(&self) -> Duration {
        Duration::from_millis(self.flush_idle_ms)
    }

    pub fn pacing_tick(&self) -> Duration {
        Duration::from_millis(self.pacing_tick_ms)
    }
}

/// Call session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session that has not become active within this window is closed
    pub inactivity_timeout_secs: u64,
    pub max_concurrent_sessions: usize,
    /// Spoken by the voice service as soon as a call becomes active; empty disables it
    pub greeting: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 30,
            max_concurrent_sessions: 50,
            greeting: "Hello! How can I help you today?".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// Remote voice service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// WebSocket URL of the realtime voice service
    pub url: String,
    /// Sent as a bearer token when non-empty
    pub api_key: String,
    pub connect_timeout_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/realtime".to_string(),
            api_key: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_VOICE__URL=wss://voice.example.com/rt`: Override the voice service URL
    /// - `APP_SESSION__GREETING=Hi`: Override the greeting
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Zero-length ticks would spin the pipeline tasks, so they are rejected
    /// here rather than discovered at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.aggregation_tick_ms == 0 || self.audio.pacing_tick_ms == 0 {
            return Err(anyhow::anyhow!("Audio tick intervals must be greater than 0"));
        }

        if self.audio.flush_frame_count == 0 {
            return Err(anyhow::anyhow!("Flush frame count must be greater than 0"));
        }

        if self.audio.batch_duration_ms == 0 {
            return Err(anyhow::anyhow!("Batch duration must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.voice.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice service URL must be set"));
        }

        Ok(())
    }
}
