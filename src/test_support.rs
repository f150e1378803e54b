//! In-memory collaborators shared by the unit tests.

use crate::audio::frames::TransportFrame;
use crate::audio::payload::VoiceAudio;
use crate::transport::{CallTransport, FrameSink, SessionDescription};
use crate::voice::{VoiceChannel, VoiceConnection, VoiceConnector};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Records every batch and greeting sent to the voice service.
#[derive(Default)]
pub struct RecordingChannel {
    batches: Mutex<Vec<Vec<i16>>>,
    spoken: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
    closes: AtomicUsize,
    close_delay: Duration,
}

impl RecordingChannel {
    pub fn batches(&self) -> Vec<Vec<i16>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoiceChannel for RecordingChannel {
    async fn send_audio(&self, samples: &[i16]) -> anyhow::Result<()> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("voice service unavailable");
        }
        self.batches.lock().unwrap().push(samples.to_vec());
        Ok(())
    }

    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every frame handed to the transport.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<TransportFrame>>,
    failures_left: AtomicUsize,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<TransportFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn fail_next_deliveries(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn deliver(&self, frame: &TransportFrame) -> anyhow::Result<()> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("transport not writable");
        }
        self.frames.lock().unwrap().push(*frame);
        Ok(())
    }
}

/// Transport that answers every valid offer and records how often it was closed.
#[derive(Default)]
pub struct MockTransport {
    pub sink: Arc<RecordingSink>,
    fail_negotiation: AtomicBool,
    closes: AtomicUsize,
    close_delay: Duration,
}

impl MockTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.fail_negotiation.store(true, Ordering::SeqCst);
        transport
    }

    /// Transport whose `close` takes `delay` to complete.
    pub fn slow_close(delay: Duration) -> Self {
        Self {
            close_delay: delay,
            ..Self::default()
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallTransport for MockTransport {
    async fn answer(&self, _remote: &SessionDescription) -> anyhow::Result<SessionDescription> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            anyhow::bail!("negotiation failed");
        }
        Ok(SessionDescription::answer())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            anyhow::bail!("negotiation failed");
        }
        Ok(SessionDescription::offer())
    }

    async fn apply_answer(&self, _remote: &SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out one [`RecordingChannel`] and keeping the sender
/// side of its audio stream so tests can play "voice service" audio.
#[derive(Default)]
pub struct MockConnector {
    pub channel: Arc<RecordingChannel>,
    audio_tx: Mutex<Option<mpsc::Sender<VoiceAudio>>>,
    fail: AtomicBool,
}

impl MockConnector {
    pub fn failing() -> Self {
        let connector = Self::default();
        connector.fail.store(true, Ordering::SeqCst);
        connector
    }

    pub fn audio_sender(&self) -> Option<mpsc::Sender<VoiceAudio>> {
        self.audio_tx.lock().unwrap().clone()
    }

    /// Drop the sender so the session sees the voice stream end.
    pub fn hang_up(&self) {
        self.audio_tx.lock().unwrap().take();
    }
}

#[async_trait]
impl VoiceConnector for MockConnector {
    async fn connect(&self, _session_id: &str) -> anyhow::Result<VoiceConnection> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("voice service refused connection");
        }
        let (tx, rx) = mpsc::channel(64);
        *self.audio_tx.lock().unwrap() = Some(tx);
        Ok(VoiceConnection {
            channel: self.channel.clone(),
            audio: rx,
        })
    }
}
