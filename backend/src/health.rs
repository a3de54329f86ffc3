use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use shared::{HealthStatus, ProcessorState};
use time::OffsetDateTime;

/// Counters and health flags shared by the background tasks.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    processor_degraded: AtomicBool,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    stale_ticks: AtomicU64,
    version: AtomicU64,
    last_aggregation_at: Mutex<Option<OffsetDateTime>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_processor_degraded(&self, degraded: bool) {
        self.processor_degraded.store(degraded, Ordering::SeqCst);
    }

    pub fn processor_state(&self) -> ProcessorState {
        if self.processor_degraded.load(Ordering::SeqCst) {
            ProcessorState::Degraded
        } else {
            ProcessorState::Healthy
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// A tick failed and the previous snapshot is still being served.
    pub fn record_stale_tick(&self) -> u64 {
        self.stale_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_aggregation(&self, version: u64, at: OffsetDateTime) {
        self.stale_ticks.store(0, Ordering::SeqCst);
        self.version.store(version, Ordering::SeqCst);
        if let Ok(mut last) = self.last_aggregation_at.lock() {
            *last = Some(at);
        }
    }

    pub fn stale_ticks(&self) -> u64 {
        self.stale_ticks.load(Ordering::SeqCst)
    }

    pub fn status(&self, queue_lag: Option<u64>, subscriber_count: usize) -> HealthStatus {
        HealthStatus {
            queue_lag,
            last_aggregation_at: self.last_aggregation_at.lock().ok().and_then(|last| *last),
            subscriber_count,
            processor: self.processor_state(),
            stale_ticks: self.stale_ticks(),
            version: self.version.load(Ordering::SeqCst),
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reflects_counters() {
        let health = PipelineHealth::new();
        health.record_accepted();
        health.record_accepted();
        health.record_duplicate();
        health.record_rejected();
        health.set_processor_degraded(true);
        assert_eq!(health.record_stale_tick(), 1);
        assert_eq!(health.record_stale_tick(), 2);

        let status = health.status(Some(7), 3);
        assert_eq!(status.queue_lag, Some(7));
        assert_eq!(status.subscriber_count, 3);
        assert_eq!(status.processor, ProcessorState::Degraded);
        assert_eq!(status.stale_ticks, 2);
        assert_eq!((status.accepted, status.duplicates, status.rejected), (2, 1, 1));
        assert!(status.last_aggregation_at.is_none());

        health.record_aggregation(4, OffsetDateTime::now_utc());
        health.set_processor_degraded(false);
        let status = health.status(None, 0);
        assert_eq!(status.stale_ticks, 0);
        assert_eq!(status.version, 4);
        assert_eq!(status.processor, ProcessorState::Healthy);
        assert!(status.last_aggregation_at.is_some());
    }
}
