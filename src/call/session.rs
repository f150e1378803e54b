//! # Call Session
//!
//! Owns everything that belongs to one call: the transport, the voice-service
//! connection, the input aggregator, the output pacer and the inactivity timer.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: Created, waiting for an offer (or asked to make one)
//! 2. **Negotiating**: Descriptions are being exchanged
//! 3. **Active**: Both descriptions set and the voice service connected; audio flows
//! 4. **Closing**: Teardown in progress
//! 5. **Closed**: Every resource released (terminal)
//!
//! A session that has not reached Active within the inactivity timeout closes
//! itself. Teardown runs once no matter how many times or from how many places
//! it is requested: the transition into Closing is the guard.

use crate::audio::aggregator::InputAggregator;
use crate::audio::frames::{samples_from_le_bytes, FRAME_SAMPLES};
use crate::audio::pacer::OutputPacer;
use crate::audio::payload::VoiceAudio;
use crate::audio::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::config::{AudioConfig, SessionConfig};
use crate::error::{AppError, AppResult};
use crate::transport::{CallTransport, DescriptionKind, SessionDescription, TransportState};
use crate::voice::{VoiceChannel, VoiceConnection, VoiceConnector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Negotiating,
    Active,
    Closing,
    Closed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Closing => "closing",
            CallState::Closed => "closed",
        }
    }

    /// True once teardown has started.
    pub fn is_ending(&self) -> bool {
        matches!(self, CallState::Closing | CallState::Closed)
    }
}

/// Resources that only exist while the call is Active.
struct Pipeline {
    aggregator: InputAggregator,
    pacer: OutputPacer,
    channel: Arc<dyn VoiceChannel>,
    pump: JoinHandle<()>,
}

/// Serializable view of a session for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSessionInfo {
    pub session_id: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub stats: PipelineStatsSnapshot,
}

pub struct CallSession {
    session_id: String,
    created_at: DateTime<Utc>,
    state: watch::Sender<CallState>,
    transport: Arc<dyn CallTransport>,
    connector: Arc<dyn VoiceConnector>,
    audio_config: AudioConfig,
    greeting: String,
    pipeline: Mutex<Option<Pipeline>>,
    /// Captured samples short of a whole transport frame
    capture_remainder: Mutex<Vec<i16>>,
    inactivity: Mutex<Option<JoinHandle<()>>>,
    /// Set by `create_offer`, consumed by `accept_answer`
    offer_pending: AtomicBool,
    stats: Arc<PipelineStats>,
}

impl CallSession {
    /// Create an Idle session and start its inactivity timer.
    pub fn new(
        session_id: String,
        transport: Arc<dyn CallTransport>,
        connector: Arc<dyn VoiceConnector>,
        audio_config: AudioConfig,
        session_config: &SessionConfig,
    ) -> Arc<Self> {
        let timeout = session_config.inactivity_timeout();

        Arc::new_cyclic(|weak: &Weak<CallSession>| {
            let weak = weak.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(session) = weak.upgrade() {
                    session.on_inactivity_timeout().await;
                }
            });

            let (state, _) = watch::channel(CallState::Idle);

            Self {
                session_id,
                created_at: Utc::now(),
                state,
                transport,
                connector,
                audio_config,
                greeting: session_config.greeting.clone(),
                pipeline: Mutex::new(None),
                capture_remainder: Mutex::new(Vec::with_capacity(FRAME_SAMPLES)),
                inactivity: Mutex::new(Some(timer)),
                offer_pending: AtomicBool::new(false),
                stats: Arc::new(PipelineStats::default()),
            }
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Watch state changes, e.g. to report them to the remote peer.
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// Resolves once the session reaches Closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == CallState::Closed).await;
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn info(&self) -> CallSessionInfo {
        CallSessionInfo {
            session_id: self.session_id.clone(),
            state: self.state(),
            created_at: self.created_at,
            stats: self.stats(),
        }
    }

    /// Answer a remote offer. Returns the local answer once the call is Active.
    ///
    /// ## Errors:
    /// - `ValidationError`: the offer is malformed (session unchanged)
    /// - `InvalidState`: the session is not Idle (session unchanged)
    /// - `Transport` / `VoiceService`: setup failed and the session was closed
    pub async fn accept_offer(
        self: &Arc<Self>,
        remote: &SessionDescription,
    ) -> AppResult<SessionDescription> {
        remote.validate(DescriptionKind::Offer)?;
        self.transition(CallState::Idle, CallState::Negotiating)?;

        let local = match self.transport.answer(remote).await {
            Ok(local) => local,
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Failed to answer offer");
                self.close("negotiation failed").await;
                return Err(AppError::Transport(err.to_string()));
            }
        };

        self.activate().await?;
        Ok(local)
    }

    /// Produce a local offer. The call becomes Active on [`accept_answer`](Self::accept_answer).
    pub async fn create_offer(&self) -> AppResult<SessionDescription> {
        self.transition(CallState::Idle, CallState::Negotiating)?;

        match self.transport.create_offer().await {
            Ok(local) => {
                self.offer_pending.store(true, Ordering::SeqCst);
                Ok(local)
            }
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Failed to create offer");
                self.close("negotiation failed").await;
                Err(AppError::Transport(err.to_string()))
            }
        }
    }

    /// Complete a locally created offer with the remote answer.
    pub async fn accept_answer(self: &Arc<Self>, remote: &SessionDescription) -> AppResult<()> {
        remote.validate(DescriptionKind::Answer)?;

        if self.state() != CallState::Negotiating || !self.offer_pending.swap(false, Ordering::SeqCst) {
            return Err(AppError::InvalidState(format!(
                "No local offer awaiting an answer (state: {})",
                self.state().as_str()
            )));
        }

        if let Err(err) = self.transport.apply_answer(remote).await {
            error!(session_id = %self.session_id, error = %err, "Failed to apply answer");
            self.close("negotiation failed").await;
            return Err(AppError::Transport(err.to_string()));
        }

        self.activate().await
    }

    /// Forward captured transport audio (little-endian PCM, any length) to the
    /// aggregator as whole 480-sample frames. A partial tail is held until the
    /// next message completes it. Ignored unless the call is Active.
    pub async fn on_captured_audio(&self, bytes: &[u8]) {
        if self.state() != CallState::Active {
            return;
        }

        // Held across the hand-off so concurrent messages keep their order
        let mut remainder = self.capture_remainder.lock().await;
        let aggregator = match self.pipeline.lock().await.as_ref() {
            Some(pipeline) => pipeline.aggregator.clone(),
            None => return,
        };

        remainder.extend(samples_from_le_bytes(bytes));
        let whole = remainder.len() - remainder.len() % FRAME_SAMPLES;
        let samples: Vec<i16> = remainder.drain(..whole).collect();

        for frame in samples.chunks_exact(FRAME_SAMPLES) {
            aggregator.on_captured_frame(frame.to_vec()).await;
        }
    }

    pub async fn on_transport_state(&self, transport_state: TransportState) {
        if transport_state.is_terminal() {
            self.close(&format!("transport {:?}", transport_state).to_lowercase())
                .await;
        } else {
            debug!(session_id = %self.session_id, state = ?transport_state, "Transport state changed");
        }
    }

    pub async fn terminate(&self) {
        self.close("terminated").await;
    }

    /// Release every resource the session owns. Safe to call any number of
    /// times, concurrently or not; only the first call does the teardown and
    /// every call returns once the session is Closed.
    pub async fn close(&self, reason: &str) {
        let mut previous = CallState::Idle;
        let started = self.state.send_if_modified(|state| {
            if state.is_ending() {
                return false;
            }
            previous = *state;
            *state = CallState::Closing;
            true
        });

        if !started {
            debug!(session_id = %self.session_id, reason = %reason, "Session already closing");
            self.wait_closed().await;
            return;
        }

        info!(
            session_id = %self.session_id,
            from = previous.as_str(),
            reason = %reason,
            "Closing call session"
        );

        if let Some(timer) = self.inactivity.lock().await.take() {
            timer.abort();
        }

        let pipeline = self.pipeline.lock().await.take();
        self.capture_remainder.lock().await.clear();
        if let Some(pipeline) = pipeline {
            pipeline.aggregator.stop().await;
            pipeline.pacer.stop().await;
            pipeline.pump.abort();

            if let Err(err) = pipeline.channel.close().await {
                warn!(session_id = %self.session_id, error = %err, "Failed to close voice connection");
            }
        }

        if let Err(err) = self.transport.close().await {
            warn!(session_id = %self.session_id, error = %err, "Failed to close transport");
        }

        self.state.send_replace(CallState::Closed);
        info!(session_id = %self.session_id, "Call session closed");
    }

    fn transition(&self, from: CallState, to: CallState) -> AppResult<()> {
        let mut current = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                current = *state;
                false
            }
        });

        if changed {
            info!(
                session_id = %self.session_id,
                from = from.as_str(),
                to = to.as_str(),
                "Call state changed"
            );
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "Cannot move from {} to {}",
                current.as_str(),
                to.as_str()
            )))
        }
    }

    /// Connect the voice service and start the audio pipeline (Negotiating → Active).
    async fn activate(self: &Arc<Self>) -> AppResult<()> {
        let VoiceConnection { channel, audio } = match self.connector.connect(&self.session_id).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Voice service connection failed");
                self.close("voice service unavailable").await;
                return Err(AppError::VoiceService(err.to_string()));
            }
        };

        let aggregator = InputAggregator::new(
            &self.session_id,
            channel.clone(),
            self.audio_config.clone(),
            self.stats.clone(),
        );
        let pacer = OutputPacer::new(
            &self.session_id,
            self.transport.frame_sink(),
            &self.audio_config,
            self.stats.clone(),
        );

        {
            let mut pipeline = self.pipeline.lock().await;

            // Teardown may have started while the voice service was connecting
            if self.state() != CallState::Negotiating {
                drop(pipeline);
                if let Err(err) = channel.close().await {
                    warn!(session_id = %self.session_id, error = %err, "Failed to close voice connection");
                }
                return Err(AppError::InvalidState(
                    "Session closed during negotiation".to_string(),
                ));
            }

            let pump = tokio::spawn(pump_voice_audio(Arc::downgrade(self), pacer.clone(), audio));
            *pipeline = Some(Pipeline {
                aggregator,
                pacer,
                channel: channel.clone(),
                pump,
            });
            self.transition(CallState::Negotiating, CallState::Active)?;
        }

        if let Some(timer) = self.inactivity.lock().await.take() {
            timer.abort();
        }

        if !self.greeting.is_empty() {
            if let Err(err) = channel.speak(&self.greeting).await {
                warn!(session_id = %self.session_id, error = %err, "Failed to request greeting");
            }
        }

        Ok(())
    }

    async fn on_inactivity_timeout(&self) {
        // Take our own handle first so close() does not abort this task
        self.inactivity.lock().await.take();

        if self.state() != CallState::Active {
            warn!(session_id = %self.session_id, "Call did not become active in time");
            self.close("inactivity timeout").await;
        }
    }
}

/// Feed voice-service audio into the pacer until the service hangs up.
async fn pump_voice_audio(
    session: Weak<CallSession>,
    pacer: OutputPacer,
    audio: mpsc::Receiver<VoiceAudio>,
) {
    let mut stream = ReceiverStream::new(audio);
    while let Some(payload) = stream.next().await {
        pacer.on_voice_audio(&payload.into_samples()).await;
    }

    if let Some(session) = session.upgrade() {
        info!(session_id = %session.session_id, "Voice service stream ended");
        // close() aborts this pump, so it runs on its own task
        tokio::spawn(async move {
            session.close("voice service disconnected").await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frames::samples_to_le_bytes;
    use crate::test_support::{MockConnector, MockTransport};
    use std::time::Duration;
    use tokio::time;

    struct Harness {
        session: Arc<CallSession>,
        transport: Arc<MockTransport>,
        connector: Arc<MockConnector>,
    }

    fn harness_with(transport: MockTransport, connector: MockConnector) -> Harness {
        let transport = Arc::new(transport);
        let connector = Arc::new(connector);
        let session = CallSession::new(
            "call-1".to_string(),
            transport.clone(),
            connector.clone(),
            AudioConfig::default(),
            &SessionConfig::default(),
        );
        Harness {
            session,
            transport,
            connector,
        }
    }

    fn harness() -> Harness {
        harness_with(MockTransport::default(), MockConnector::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call_lifecycle() {
        let h = harness();
        assert_eq!(h.session.state(), CallState::Idle);

        let answer = h.session.accept_offer(&SessionDescription::offer()).await.unwrap();
        assert_eq!(answer.kind, DescriptionKind::Answer);
        assert_eq!(h.session.state(), CallState::Active);
        assert_eq!(h.connector.channel.spoken(), vec![SessionConfig::default().greeting]);

        let frame = samples_to_le_bytes(&[200i16; 480]);
        for _ in 0..3 {
            h.session.on_captured_audio(&frame).await;
        }
        time::sleep(Duration::from_millis(25)).await;
        assert_eq!(h.connector.channel.batches().len(), 1);

        let voice = h.connector.audio_sender().unwrap();
        voice.send(VoiceAudio::Samples(vec![500; 241])).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.sink.frames().len(), 1);

        h.session.terminate().await;
        assert_eq!(h.session.state(), CallState::Closed);
        assert_eq!(h.transport.close_count(), 1);
        assert_eq!(h.connector.channel.close_count(), 1);

        let stats = h.session.stats();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.frames_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_offer_then_answer() {
        let h = harness();

        let offer = h.session.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert_eq!(h.session.state(), CallState::Negotiating);

        h.session.accept_answer(&SessionDescription::answer()).await.unwrap();
        assert_eq!(h.session.state(), CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_connect_failure_closes_session() {
        let h = harness_with(MockTransport::default(), MockConnector::failing());

        let result = h.session.accept_offer(&SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::VoiceService(_))));
        assert_eq!(h.session.state(), CallState::Closed);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_closes_session() {
        let h = harness_with(MockTransport::failing(), MockConnector::default());

        let result = h.session.accept_offer(&SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::Transport(_))));
        assert_eq!(h.session.state(), CallState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        tokio::join!(
            h.session.close("first"),
            h.session.close("second"),
            h.session.on_transport_state(TransportState::Failed),
        );
        h.session.terminate().await;

        assert_eq!(h.session.state(), CallState::Closed);
        assert_eq!(h.transport.close_count(), 1);
        assert_eq!(h.connector.channel.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_close_waits_for_teardown() {
        let h = harness_with(MockTransport::slow_close(Duration::from_millis(100)), MockConnector::default());
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        let (first, second) = tokio::join!(
            async {
                h.session.close("first").await;
                h.session.state()
            },
            async {
                h.session.close("second").await;
                h.session.state()
            },
        );

        assert_eq!(first, CallState::Closed);
        assert_eq!(second, CallState::Closed);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_captured_messages_of_any_length_reach_voice_service() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        for _ in 0..6 {
            h.session.on_captured_audio(&samples_to_le_bytes(&[300i16; 960])).await;
            time::sleep(Duration::from_millis(20)).await;
        }
        // 700 + 360 samples: two whole frames and a 100-sample tail
        h.session.on_captured_audio(&samples_to_le_bytes(&[300i16; 700])).await;
        h.session.on_captured_audio(&samples_to_le_bytes(&[300i16; 360])).await;
        time::sleep(Duration::from_millis(200)).await;

        let batches = h.connector.channel.batches();
        let sent: usize = batches.iter().map(|batch| batch.len()).sum();
        assert_eq!(h.session.stats().frames_captured, 14);
        assert_eq!(sent, 14 * 241);
        assert!(batches.iter().all(|batch| batch.len() <= 723));
        assert!(batches.iter().flatten().all(|&s| s == 300));

        // The tail completes with the next message
        h.session.on_captured_audio(&samples_to_le_bytes(&[300i16; 380])).await;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session.stats().frames_captured, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frames_delivered_after_close() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        let voice = h.connector.audio_sender().unwrap();
        voice.send(VoiceAudio::Samples(vec![100; 2410])).await.unwrap();
        time::sleep(Duration::from_millis(25)).await;

        h.session.terminate().await;
        let delivered = h.transport.sink.frames().len();
        assert!(delivered > 0 && delivered < 10);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.transport.sink.frames().len(), delivered);

        h.session.on_captured_audio(&samples_to_le_bytes(&[1i16; 480])).await;
        assert_eq!(h.session.stats().frames_captured, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_closes_idle_session() {
        let h = harness();

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.session.state(), CallState::Idle);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.session.state(), CallState::Closed);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_survives_inactivity_window() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.session.state(), CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transitions_leave_state_unchanged() {
        let h = harness();

        let mut stereo = SessionDescription::offer();
        stereo.media.channels = 2;
        let result = h.session.accept_offer(&stereo).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
        assert_eq!(h.session.state(), CallState::Idle);

        let result = h.session.accept_answer(&SessionDescription::answer()).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert_eq!(h.session.state(), CallState::Idle);

        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();
        let result = h.session.accept_offer(&SessionDescription::offer()).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert_eq!(h.session.state(), CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_captured_audio_ignored_before_active() {
        let h = harness();
        h.session.on_captured_audio(&samples_to_le_bytes(&[1i16; 480])).await;
        assert_eq!(h.session.stats().frames_captured, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_hangup_closes_session() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        h.connector.hang_up();
        time::timeout(Duration::from_secs(1), h.session.wait_closed())
            .await
            .unwrap();
        assert_eq!(h.session.state(), CallState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_transport_state_closes_session() {
        let h = harness();
        h.session.accept_offer(&SessionDescription::offer()).await.unwrap();

        h.session.on_transport_state(TransportState::Connected).await;
        assert_eq!(h.session.state(), CallState::Active);

        h.session.on_transport_state(TransportState::Disconnected).await;
        assert_eq!(h.session.state(), CallState::Closed);
    }
}
