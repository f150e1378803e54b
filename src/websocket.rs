//! # Call WebSocket Transport
//!
//! `GET /ws/call` upgrades to a WebSocket that acts as the call transport for
//! one [`CallSession`].
//!
//! ## Protocol:
//! Text messages are JSON objects tagged by `type`:
//! - Client → server: `offer`, `request_offer`, `answer`, `candidate`, `hangup`, `ping`, `pong`
//! - Server → client: `answer`, `offer`, `session_state`, `error`, `ping`, `pong`
//!
//! Binary messages carry 48 kHz mono 16-bit little-endian PCM in both
//! directions. Every server → client binary message is exactly one 10 ms
//! transport frame (960 bytes).
//!
//! ## Actor Layout:
//! The session talks back to the socket through an unbounded channel of
//! [`Outbound`] items that the actor consumes as a stream. Captured audio goes
//! the other way through a bounded channel drained by one task, so frames
//! reach the aggregator in arrival order.

use crate::audio::frames::{samples_to_le_bytes, TransportFrame};
use crate::call::{CallSession, CallState, SessionRegistry};
use crate::error::AppError;
use crate::state::AppState;
use crate::transport::{CallTransport, FrameSink, SessionDescription, TransportState};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured binary messages waiting for the aggregator
const CAPTURE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallMessage {
    /// Remote offer (client → server)
    Offer { description: SessionDescription },

    /// Ask the server to make the offer instead
    RequestOffer,

    /// Answer to whichever side made the offer
    Answer { description: SessionDescription },

    /// Connectivity candidate; this transport has nothing to do with it
    Candidate {
        #[serde(default)]
        candidate: serde_json::Value,
    },

    Hangup,

    SessionState { session_id: String, state: CallState },

    Error { code: String, message: String },

    Ping { timestamp: u64 },

    Pong { timestamp: u64 },
}

impl CallMessage {
    fn from_error(err: &AppError) -> Self {
        CallMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Items the session side pushes to the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    Message(CallMessage),
    Close,
}

/// [`CallTransport`] over the actor's outbound channel.
///
/// The socket carries raw PCM in the one supported format, so negotiation only
/// validates and mirrors descriptions.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl WsTransport {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl CallTransport for WsTransport {
    async fn answer(&self, _remote: &SessionDescription) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer())
    }

    async fn apply_answer(&self, _remote: &SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        Arc::new(WsFrameSink {
            outbound: self.outbound.clone(),
        })
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The actor may already be gone when the client disconnected first
        let _ = self.outbound.send(Outbound::Close);
        Ok(())
    }
}

struct WsFrameSink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl FrameSink for WsFrameSink {
    fn deliver(&self, frame: &TransportFrame) -> anyhow::Result<()> {
        self.outbound
            .send(Outbound::Frame(samples_to_le_bytes(frame)))
            .map_err(|_| anyhow::anyhow!("WebSocket connection is closed"))
    }
}

pub struct CallWebSocket {
    session: Arc<CallSession>,
    registry: Arc<SessionRegistry>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Handed to the actor context as a stream in `started`
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    captured: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(
        session: Arc<CallSession>,
        registry: Arc<SessionRegistry>,
        outbound: mpsc::UnboundedSender<Outbound>,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            session,
            registry,
            outbound,
            outbound_rx: Some(outbound_rx),
            captured: None,
            tasks: Vec::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &CallMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize call message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(session_id = %self.session.session_id(), code = %code, "WebSocket error: {}", message);
        self.send_message(
            ctx,
            &CallMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_call_message(&mut self, message: CallMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let session_id = self.session.session_id().to_string();
        let outbound = self.outbound.clone();

        match message {
            CallMessage::Offer { description } => {
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    let reply = match registry.accept_offer(&session_id, &description).await {
                        Ok(answer) => CallMessage::Answer { description: answer },
                        Err(err) => CallMessage::from_error(&err),
                    };
                    let _ = outbound.send(Outbound::Message(reply));
                });
            }
            CallMessage::RequestOffer => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    let reply = match session.create_offer().await {
                        Ok(offer) => CallMessage::Offer { description: offer },
                        Err(err) => CallMessage::from_error(&err),
                    };
                    let _ = outbound.send(Outbound::Message(reply));
                });
            }
            CallMessage::Answer { description } => {
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    if let Err(err) = registry.accept_answer(&session_id, &description).await {
                        let _ = outbound.send(Outbound::Message(CallMessage::from_error(&err)));
                    }
                });
            }
            CallMessage::Candidate { candidate } => {
                debug!(session_id = %session_id, candidate = %candidate, "Ignoring connectivity candidate");
            }
            CallMessage::Hangup => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    session.terminate().await;
                });
            }
            CallMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send_message(ctx, &CallMessage::Pong { timestamp });
            }
            CallMessage::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
            CallMessage::SessionState { .. } | CallMessage::Error { .. } => {
                self.send_error(ctx, "unexpected_message", "Message type is server-only");
            }
        }
    }

    fn handle_captured_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let captured = match &self.captured {
            Some(captured) => captured,
            None => return,
        };

        if let Err(err) = captured.try_send(data.to_vec()) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(session_id = %self.session.session_id(), "Capture queue full, dropping audio");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.send_error(ctx, "session_closed", "Session no longer accepts audio");
                }
            }
        }
    }

    fn spawn_capture_forwarder(&mut self) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CAPTURE_CHANNEL_CAPACITY);
        let session = self.session.clone();

        self.captured = Some(tx);
        self.tasks.push(tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                session.on_captured_audio(&bytes).await;
            }
        }));
    }

    fn spawn_state_reporter(&mut self) {
        let mut states = self.session.subscribe();
        let session_id = self.session.session_id().to_string();
        let outbound = self.outbound.clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                let message = CallMessage::SessionState {
                    session_id: session_id.clone(),
                    state,
                };
                if outbound.send(Outbound::Message(message)).is_err() || state == CallState::Closed {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        }));
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.session_id(), "Call WebSocket connected");

        if let Some(rx) = self.outbound_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        self.spawn_capture_forwarder();
        self.spawn_state_reporter();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session.session_id(), "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                act.send_message(ctx, &CallMessage::Ping { timestamp });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session.session_id(), "Call WebSocket disconnected");

        self.captured = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let session = self.session.clone();
        tokio::spawn(async move {
            session.on_transport_state(TransportState::Closed).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<CallMessage>(&text) {
                Ok(message) => self.handle_call_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_captured_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.session_id(), "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.session_id(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Outbound> for CallWebSocket {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Frame(bytes) => ctx.binary(bytes),
            Outbound::Message(message) => self.send_message(ctx, &message),
            Outbound::Close => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some("call ended".to_string()),
                }));
                ctx.stop();
            }
        }
    }

    // The actor holds a sender itself, so this stream never ends on its own
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler.
///
/// Registers a new session (optionally under `?session_id=`) and upgrades the
/// connection into a [`CallWebSocket`] acting as its transport.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New call WebSocket request from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    let requested_id = query.get("session_id").cloned();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(WsTransport::new(outbound_tx.clone()));

    let session = app_state
        .registry
        .create_session(requested_id, transport, app_state.voice.clone())
        .await?;
    let session_id = session.session_id().to_string();

    let websocket = CallWebSocket::new(session, app_state.registry.clone(), outbound_tx, outbound_rx);

    match ws::start(websocket, &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            app_state.registry.terminate(&session_id).await;
            Err(err)
        }
    }
}
