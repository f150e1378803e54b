//! # Output Pacing
//!
//! The voice service returns audio in bursts, but the transport must receive
//! it in real time: exactly one 10 ms frame per 10 ms tick. The pacer
//! upsamples each payload, chunks it into transport frames and queues them.
//! A periodic task pops one frame per tick and hands it to the [`FrameSink`].
//!
//! The task starts when frames are queued while idle and exits as soon as the
//! queue is empty, so a silent call costs no timer wakeups. New audio after
//! that simply starts it again.

use crate::audio::frames::{chunk, TransportFrame};
use crate::audio::resampler::upsample;
use crate::audio::stats::PipelineStats;
use crate::config::AudioConfig;
use crate::transport::FrameSink;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Default)]
struct PacerState {
    queue: VecDeque<TransportFrame>,
    running: bool,
    stopped: bool,
    task: Option<JoinHandle<()>>,
}

/// Releases queued transport frames to the sink at a fixed cadence.
#[derive(Clone)]
pub struct OutputPacer {
    session_id: Arc<str>,
    state: Arc<Mutex<PacerState>>,
    sink: Arc<dyn FrameSink>,
    tick: Duration,
    /// 0 means unbounded
    max_queued_frames: usize,
    stats: Arc<PipelineStats>,
}

impl OutputPacer {
    pub fn new(
        session_id: &str,
        sink: Arc<dyn FrameSink>,
        config: &AudioConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            session_id: Arc::from(session_id),
            state: Arc::new(Mutex::new(PacerState::default())),
            sink,
            tick: config.pacing_tick(),
            max_queued_frames: config.max_queued_frames,
            stats,
        }
    }

    /// Queue 24.1 kHz audio from the voice service for playback.
    pub async fn on_voice_audio(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }

        let frames = chunk(&upsample(samples));
        self.enqueue_frames(frames).await;
    }

    /// Append transport frames to the queue and start pacing if idle.
    ///
    /// Past `max_queued_frames` the oldest queued frames are dropped, keeping
    /// playback close to live.
    pub async fn enqueue_frames(&self, frames: Vec<TransportFrame>) {
        if frames.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }

        self.stats.record_frames_queued(frames.len());
        state.queue.extend(frames);

        if self.max_queued_frames > 0 && state.queue.len() > self.max_queued_frames {
            let excess = state.queue.len() - self.max_queued_frames;
            state.queue.drain(..excess);
            self.stats.record_frames_dropped(excess);
            warn!(
                session_id = %self.session_id,
                dropped = excess,
                "Output queue full, dropped oldest frames"
            );
        }

        if !state.running {
            state.running = true;
            state.task = Some(tokio::spawn(self.clone().run()));
            debug!(session_id = %self.session_id, "Output pacing started");
        }
    }

    pub async fn queued_frames(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Stop pacing and discard queued frames. Nothing is delivered afterwards.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        state.stopped = true;
        state.queue.clear();

        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    async fn run(self) {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let frame = {
                let mut state = self.state.lock().await;
                if !state.running {
                    break;
                }
                match state.queue.pop_front() {
                    Some(frame) => frame,
                    None => {
                        state.running = false;
                        state.task = None;
                        debug!(session_id = %self.session_id, "Output queue drained, pacing stopped");
                        break;
                    }
                }
            };

            match self.sink.deliver(&frame) {
                Ok(()) => self.stats.record_frame_delivered(),
                Err(err) => {
                    self.stats.record_delivery_failure();
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        "Failed to deliver frame to transport"
                    );
                }
            }
        }
    }
}
