//! # Realtime Voice Service Client
//!
//! Connects each call session to the voice service over a WebSocket.
//!
//! ## Protocol:
//! Outgoing (JSON text):
//! - `{"type":"input_audio","audio":"<base64 PCM>","sample_rate":24100}`
//! - `{"type":"speak","text":"..."}`
//!
//! Incoming:
//! - Binary messages: raw little-endian PCM
//! - `{"type":"audio","audio":"<base64 PCM>"}` or `{"type":"audio","samples":[...]}`
//! - `{"type":"error","message":"..."}` is logged; anything else is ignored
//!
//! Two tasks own the socket halves. The writer drains an unbounded channel of
//! outgoing messages; the reader turns incoming messages into [`VoiceAudio`]
//! and forwards them to the session's receive pump.

use crate::audio::payload::{encode_base64, VoiceAudio};
use crate::audio::resampler::VOICE_SAMPLE_RATE;
use crate::config::VoiceConfig;
use crate::voice::{VoiceChannel, VoiceConnection, VoiceConnector};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Inbound payloads buffered between the socket reader and the session pump
const AUDIO_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent<'a> {
    InputAudio { audio: String, sample_rate: u32 },
    Speak { text: &'a str },
}

/// Opens one realtime WebSocket per call session.
pub struct RealtimeVoiceConnector {
    config: VoiceConfig,
}

impl RealtimeVoiceConnector {
    pub fn new(config: VoiceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VoiceConnector for RealtimeVoiceConnector {
    async fn connect(&self, session_id: &str) -> anyhow::Result<VoiceConnection> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .context("Invalid voice service URL")?;

        if !self.config.api_key.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .context("Voice service API key is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }
        request
            .headers_mut()
            .insert("x-session-id", HeaderValue::from_str(session_id)?);

        let (ws_stream, _) = timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connect_async(request),
        )
        .await
        .context("Timed out connecting to voice service")??;

        info!(session_id = %session_id, url = %self.config.url, "Connected to voice service");

        let (mut write, mut read) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (audio_tx, audio_rx) = mpsc::channel::<VoiceAudio>(AUDIO_CHANNEL_CAPACITY);

        let writer_session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(err) = write.send(msg).await {
                    warn!(session_id = %writer_session, error = %err, "Voice service write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            debug!(session_id = %writer_session, "Voice service writer stopped");
        });

        let reader_session = session_id.to_string();
        let pong_tx = outgoing_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let audio = match msg {
                    Ok(Message::Binary(bytes)) => Some(VoiceAudio::Bytes(bytes)),
                    Ok(Message::Text(text)) => parse_audio_event(&text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                        None
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => None,
                    Err(err) => {
                        warn!(session_id = %reader_session, error = %err, "Voice service read failed");
                        break;
                    }
                };

                if let Some(audio) = audio {
                    if audio_tx.send(audio).await.is_err() {
                        break;
                    }
                }
            }
            info!(session_id = %reader_session, "Voice service stream ended");
        });

        let channel = RealtimeVoiceChannel {
            outgoing: outgoing_tx,
            reader: Mutex::new(Some(reader)),
        };

        Ok(VoiceConnection {
            channel: Arc::new(channel),
            audio: audio_rx,
        })
    }
}

/// Outbound half of a realtime connection.
pub struct RealtimeVoiceChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeVoiceChannel {
    fn send_event(&self, event: &ClientEvent<'_>) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        self.outgoing
            .send(Message::Text(json))
            .map_err(|_| anyhow::anyhow!("Voice service connection is closed"))
    }
}

#[async_trait]
impl VoiceChannel for RealtimeVoiceChannel {
    async fn send_audio(&self, samples: &[i16]) -> anyhow::Result<()> {
        self.send_event(&ClientEvent::InputAudio {
            audio: encode_base64(samples),
            sample_rate: VOICE_SAMPLE_RATE,
        })
    }

    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        self.send_event(&ClientEvent::Speak { text })
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The writer may already be gone if the service hung up first
        let _ = self.outgoing.send(Message::Close(None));

        let reader = self
            .reader
            .lock()
            .map_err(|_| anyhow::anyhow!("Voice channel lock poisoned"))?
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        Ok(())
    }
}

/// Extract audio from a JSON text event, if it carries any.
fn parse_audio_event(text: &str) -> Option<VoiceAudio> {
    let event: Value = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Ignoring malformed voice service message");
            return None;
        }
    };

    match event.get("type").and_then(Value::as_str) {
        Some("audio") => {
            if let Some(encoded) = event.get("audio").and_then(Value::as_str) {
                return Some(VoiceAudio::Base64(encoded.to_string()));
            }
            let samples = event.get("samples").and_then(Value::as_array)?;
            Some(VoiceAudio::Samples(
                samples
                    .iter()
                    .filter_map(Value::as_i64)
                    .map(|s| s.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
                    .collect(),
            ))
        }
        Some("error") => {
            let message = event.get("message").and_then(Value::as_str).unwrap_or("unknown");
            warn!(message = %message, "Voice service reported an error");
            None
        }
        other => {
            debug!(event_type = ?other, "Ignoring voice service event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base64_audio_event() {
        let encoded = encode_base64(&[1, 2, 3]);
        let text = format!(r#"{{"type":"audio","audio":"{}"}}"#, encoded);
        let audio = parse_audio_event(&text).unwrap();
        assert_eq!(audio.into_samples(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_sample_array_clamps() {
        let audio = parse_audio_event(r#"{"type":"audio","samples":[0, -5, 40000, -40000]}"#).unwrap();
        assert_eq!(audio, VoiceAudio::Samples(vec![0, -5, i16::MAX, i16::MIN]));
    }

    #[test]
    fn test_non_audio_events_are_ignored() {
        assert!(parse_audio_event(r#"{"type":"transcript","text":"hi"}"#).is_none());
        assert!(parse_audio_event(r#"{"type":"error","message":"quota"}"#).is_none());
        assert!(parse_audio_event(r#"{"type":"audio"}"#).is_none());
        assert!(parse_audio_event("not json").is_none());
    }

    #[test]
    fn test_client_event_wire_format() {
        let json = serde_json::to_value(ClientEvent::InputAudio {
            audio: "AAA=".to_string(),
            sample_rate: VOICE_SAMPLE_RATE,
        })
        .unwrap();
        assert_eq!(json["type"], "input_audio");
        assert_eq!(json["sample_rate"], 24100);

        let json = serde_json::to_value(ClientEvent::Speak { text: "Hello" }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "speak", "text": "Hello"}));
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (outgoing, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = RealtimeVoiceChannel {
            outgoing,
            reader: Mutex::new(None),
        };

        assert!(channel.send_audio(&[1, 2]).await.is_err());
        assert!(channel.close().await.is_ok());
    }
}
