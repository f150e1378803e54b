//! Per-session pipeline counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the aggregator and pacer of one call.
///
/// Atomics, so both periodic tasks update them without sharing a lock.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    frames_queued: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`] for API responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub frames_captured: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub frames_queued: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub delivery_failures: u64,
}

impl PipelineStats {
    pub fn record_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_queued(&self, count: usize) {
        self.frames_queued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_dropped(&self, count: usize) {
        self.frames_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}
