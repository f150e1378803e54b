//! # Input Aggregation
//!
//! Captured transport audio arrives in small frames at an uncontrolled rate.
//! Sending each one to the voice service would flood it with tiny packets, so
//! the aggregator queues them and flushes a batch when either:
//! - **Count**: `flush_frame_count` frames (default 3) are queued, or
//! - **Idle**: more than `flush_idle_ms` (default 50 ms) passed since the last frame
//!
//! A flush takes at most `flush_frame_count` frames from the front of the
//! queue; anything behind them waits for the next tick. The batch is combined
//! to `batch_duration_ms`, downsampled to 24.1 kHz and sent to the voice service.
//!
//! ## Scheduling:
//! A periodic tokio task checks the queue every `aggregation_tick_ms`. It is
//! started by the first captured frame and runs until [`InputAggregator::stop`],
//! whatever the outcome of each tick. A failed send costs one batch of audio,
//! never the rest of the stream.

use crate::audio::frames::combine;
use crate::audio::resampler::{downsample, TRANSPORT_SAMPLE_RATE};
use crate::audio::stats::PipelineStats;
use crate::config::AudioConfig;
use crate::voice::VoiceChannel;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Default)]
struct AggregatorState {
    queue: Vec<Vec<i16>>,
    last_arrival: Option<Instant>,
    running: bool,
    stopped: bool,
    task: Option<JoinHandle<()>>,
}

impl AggregatorState {
    /// Take up to one batch worth of frames if a flush is due at `now`.
    /// Frames beyond `flush_frame_count` stay queued for the next tick.
    fn take_ready_frames(&mut self, now: Instant, config: &AudioConfig) -> Option<Vec<Vec<i16>>> {
        if self.queue.is_empty() {
            return None;
        }

        let idle = self
            .last_arrival
            .map(|arrival| now.saturating_duration_since(arrival) > config.flush_idle())
            .unwrap_or(false);

        if self.queue.len() >= config.flush_frame_count || idle {
            let take = self.queue.len().min(config.flush_frame_count.max(1));
            Some(self.queue.drain(..take).collect())
        } else {
            None
        }
    }
}

/// Buffers captured 48 kHz frames and forwards them to the voice service in batches.
///
/// Cheap to clone; clones share the same queue and task.
#[derive(Clone)]
pub struct InputAggregator {
    session_id: Arc<str>,
    state: Arc<Mutex<AggregatorState>>,
    channel: Arc<dyn VoiceChannel>,
    config: AudioConfig,
    stats: Arc<PipelineStats>,
}

impl InputAggregator {
    pub fn new(
        session_id: &str,
        channel: Arc<dyn VoiceChannel>,
        config: AudioConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            session_id: Arc::from(session_id),
            state: Arc::new(Mutex::new(AggregatorState::default())),
            channel,
            config,
            stats,
        }
    }

    /// Queue one captured frame and make sure the aggregation task is running.
    ///
    /// Empty frames and frames arriving after [`stop`](Self::stop) are ignored.
    pub async fn on_captured_frame(&self, frame: Vec<i16>) {
        if frame.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }

        state.queue.push(frame);
        state.last_arrival = Some(Instant::now());
        self.stats.record_frame_captured();

        if !state.running {
            state.running = true;
            state.task = Some(tokio::spawn(self.clone().run()));
        }
    }

    /// Number of frames waiting for the next flush.
    pub async fn pending_frames(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Stop the aggregation task and discard queued audio.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        state.stopped = true;
        state.queue.clear();
        state.last_arrival = None;

        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    async fn run(self) {
        let tick = self.config.aggregation_tick();
        let mut interval = time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let frames = {
                let mut state = self.state.lock().await;
                if !state.running {
                    break;
                }
                state.take_ready_frames(Instant::now(), &self.config)
            };

            if let Some(frames) = frames {
                self.flush(frames).await;
            }
        }
    }

    async fn flush(&self, frames: Vec<Vec<i16>>) {
        let frame_count = frames.len();
        let batch = combine(&frames, self.config.batch_duration_ms, TRANSPORT_SAMPLE_RATE);
        let resampled = downsample(&batch);

        if resampled.is_empty() {
            return;
        }

        match self.channel.send_audio(&resampled).await {
            Ok(()) => {
                self.stats.record_batch_sent();
                debug!(
                    session_id = %self.session_id,
                    frames = frame_count,
                    samples = resampled.len(),
                    "Sent audio batch to voice service"
                );
            }
            Err(err) => {
                self.stats.record_batch_failed();
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "Failed to send audio batch, dropping it"
                );
            }
        }
    }
}
