//! # Application State Management
//!
//! State shared by every HTTP request handler and WebSocket actor.
//!
//! ## Sharing Pattern:
//! - **Arc**: Each worker thread holds a cheap clone of [`AppState`]
//! - **Immutable config**: Loaded once at startup, never written afterwards
//! - **Atomics for counters**: Every session updates them, so no lock is taken
//! - **SessionRegistry**: The only shared map; it does its own locking

use crate::call::SessionRegistry;
use crate::config::AppConfig;
use crate::voice::{RealtimeVoiceConnector, VoiceConnector};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Live call sessions
    pub registry: Arc<SessionRegistry>,

    /// Opens a voice-service connection for each new call
    pub voice: Arc<dyn VoiceConnector>,

    pub metrics: Arc<AppMetrics>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Process-wide session counters.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Sessions registered since server start
    sessions_started: AtomicU64,

    /// Sessions that reached Closed, for any reason
    sessions_closed: AtomicU64,

    /// Sessions torn down because setup failed
    sessions_failed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppMetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_closed: u64,
    pub sessions_failed: u64,
}

impl AppMetrics {
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AppMetricsSnapshot {
        AppMetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Create the state used by the server, connecting calls to the realtime
    /// voice service named in `config.voice`.
    pub fn new(config: AppConfig) -> Self {
        let connector = Arc::new(RealtimeVoiceConnector::new(config.voice.clone()));
        Self::with_connector(config, connector)
    }

    /// Create the state with a custom voice connector.
    pub fn with_connector(config: AppConfig, voice: Arc<dyn VoiceConnector>) -> Self {
        let metrics = Arc::new(AppMetrics::default());
        let registry = SessionRegistry::new(
            config.audio.clone(),
            config.session.clone(),
            metrics.clone(),
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            voice,
            metrics,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
