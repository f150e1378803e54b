//! # Session Registry
//!
//! Maps session ids to live [`CallSession`]s so HTTP handlers and transport
//! adapters can reach the session that owns a call. Sessions remove themselves
//! once they reach Closed; failed setups are removed immediately.
//!
//! Insert and remove are the only mutations. The registry hands out single
//! sessions by id and never exposes the full set.

use crate::call::session::CallSession;
use crate::config::{AudioConfig, SessionConfig};
use crate::error::{AppError, AppResult};
use crate::state::AppMetrics;
use crate::transport::{CallTransport, SessionDescription};
use crate::voice::VoiceConnector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

type SessionMap = Arc<RwLock<HashMap<String, Arc<CallSession>>>>;

pub struct SessionRegistry {
    sessions: SessionMap,
    audio_config: AudioConfig,
    session_config: SessionConfig,
    metrics: Arc<AppMetrics>,
}

impl SessionRegistry {
    pub fn new(audio_config: AudioConfig, session_config: SessionConfig, metrics: Arc<AppMetrics>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            audio_config,
            session_config,
            metrics,
        }
    }

    /// Register a new Idle session.
    ///
    /// ## Errors:
    /// - `BadRequest` when `max_concurrent_sessions` is reached or the id is taken
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        transport: Arc<dyn CallTransport>,
        connector: Arc<dyn VoiceConnector>,
    ) -> AppResult<Arc<CallSession>> {
        let session = {
            let mut sessions = self.sessions.write().await;

            if sessions.len() >= self.session_config.max_concurrent_sessions {
                return Err(AppError::BadRequest(format!(
                    "Maximum concurrent sessions ({}) reached",
                    self.session_config.max_concurrent_sessions
                )));
            }

            let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            if sessions.contains_key(&session_id) {
                return Err(AppError::BadRequest(format!(
                    "Session ID '{}' already exists",
                    session_id
                )));
            }

            let session = CallSession::new(
                session_id.clone(),
                transport,
                connector,
                self.audio_config.clone(),
                &self.session_config,
            );
            sessions.insert(session_id, session.clone());
            session
        };

        self.metrics.record_session_started();
        info!(session_id = %session.session_id(), "Call session created");

        self.spawn_reaper(session.clone());
        Ok(session)
    }

    /// Drop the entry once the session closes, unless the id was reused meanwhile.
    fn spawn_reaper(&self, session: Arc<CallSession>) {
        let sessions = self.sessions.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            session.wait_closed().await;
            metrics.record_session_closed();

            let mut sessions = sessions.write().await;
            let same = sessions
                .get(session.session_id())
                .map(|current| Arc::ptr_eq(current, &session))
                .unwrap_or(false);
            if same {
                sessions.remove(session.session_id());
            }
        });
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove the entry without closing the session.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Close and remove a session. Returns false for unknown ids.
    pub async fn terminate(&self, session_id: &str) -> bool {
        match self.remove(session_id).await {
            Some(session) => {
                session.terminate().await;
                true
            }
            None => false,
        }
    }

    /// Hand a remote offer to the session. A session whose setup failed is
    /// already closed and is removed before the error is returned.
    pub async fn accept_offer(
        &self,
        session_id: &str,
        offer: &SessionDescription,
    ) -> AppResult<SessionDescription> {
        let session = self.require(session_id).await?;
        let result = session.accept_offer(offer).await;
        self.settle(&session, result).await
    }

    /// Hand the remote answer to a session that created a local offer.
    pub async fn accept_answer(&self, session_id: &str, answer: &SessionDescription) -> AppResult<()> {
        let session = self.require(session_id).await?;
        let result = session.accept_answer(answer).await;
        self.settle(&session, result).await
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn require(&self, session_id: &str) -> AppResult<Arc<CallSession>> {
        self.get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))
    }

    async fn settle<T>(&self, session: &Arc<CallSession>, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            if session.state().is_ending() {
                warn!(session_id = %session.session_id(), error = %err, "Call setup failed");
                self.metrics.record_session_failed();
                self.remove(session.session_id()).await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::CallState;
    use crate::test_support::{MockConnector, MockTransport};
    use std::time::Duration;
    use tokio::time;

    fn test_registry(max_concurrent_sessions: usize) -> (SessionRegistry, Arc<AppMetrics>) {
        let metrics = Arc::new(AppMetrics::default());
        let session_config = SessionConfig {
            max_concurrent_sessions,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(AudioConfig::default(), session_config, metrics.clone());
        (registry, metrics)
    }

    fn collaborators() -> (Arc<dyn CallTransport>, Arc<dyn VoiceConnector>) {
        (Arc::new(MockTransport::default()), Arc::new(MockConnector::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_get() {
        let (registry, metrics) = test_registry(10);
        let (transport, connector) = collaborators();

        let session = registry
            .create_session(Some("abc".to_string()), transport, connector)
            .await
            .unwrap();
        assert_eq!(session.session_id(), "abc");
        assert!(registry.get("abc").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(metrics.snapshot().sessions_started, 1);

        let (transport, connector) = collaborators();
        let generated = registry.create_session(None, transport, connector).await.unwrap();
        assert!(Uuid::parse_str(generated.session_id()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_and_duplicate_ids() {
        let (registry, _) = test_registry(1);
        let (transport, connector) = collaborators();
        registry
            .create_session(Some("a".to_string()), transport, connector)
            .await
            .unwrap();

        let (transport, connector) = collaborators();
        let result = registry.create_session(Some("a".to_string()), transport, connector).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let (registry, _) = test_registry(5);
        let (transport, connector) = collaborators();
        registry
            .create_session(Some("a".to_string()), transport, connector)
            .await
            .unwrap();
        let (transport, connector) = collaborators();
        let result = registry.create_session(Some("a".to_string()), transport, connector).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_setup_is_removed() {
        let (registry, metrics) = test_registry(10);
        let transport: Arc<dyn CallTransport> = Arc::new(MockTransport::default());
        let connector: Arc<dyn VoiceConnector> = Arc::new(MockConnector::failing());
        registry
            .create_session(Some("x".to_string()), transport, connector)
            .await
            .unwrap();

        let result = registry.accept_offer("x", &SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::VoiceService(_))));
        assert!(registry.get("x").await.is_none());
        assert_eq!(metrics.snapshot().sessions_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_state_keeps_session() {
        let (registry, _) = test_registry(10);
        let (transport, connector) = collaborators();
        registry
            .create_session(Some("x".to_string()), transport, connector)
            .await
            .unwrap();

        registry.accept_offer("x", &SessionDescription::offer()).await.unwrap();
        let result = registry.accept_offer("x", &SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert!(registry.get("x").await.is_some());

        let result = registry.accept_offer("nope", &SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_closes_and_removes() {
        let (registry, _) = test_registry(10);
        let (transport, connector) = collaborators();
        let session = registry
            .create_session(Some("t".to_string()), transport, connector)
            .await
            .unwrap();

        assert!(registry.terminate("t").await);
        assert_eq!(session.state(), CallState::Closed);
        assert!(registry.get("t").await.is_none());
        assert!(!registry.terminate("t").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sessions_are_reaped() {
        let (registry, metrics) = test_registry(10);
        let (transport, connector) = collaborators();
        registry
            .create_session(Some("idle".to_string()), transport, connector)
            .await
            .unwrap();

        time::sleep(Duration::from_secs(31)).await;
        assert!(registry.get("idle").await.is_none());
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(metrics.snapshot().sessions_closed, 1);
    }
}
