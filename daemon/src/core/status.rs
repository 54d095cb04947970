use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use guardian_common::time::{get_current_time_in_seconds, TimestampSeconds};
use serde::Serialize;

/// Shared snapshot of what the daemon is doing, served by the health probe
pub struct StatusTracker {
    started_at: TimestampSeconds,
    last_processed_block: AtomicU64,
    watermark: AtomicU64,
    // -2 until the first probe, then the real index (-1 = not a guardian)
    guardian_index: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub uptime: String,
    pub last_processed_block: u64,
    pub watermark: u64,
    pub guardian_index: Option<i32>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            started_at: get_current_time_in_seconds(),
            last_processed_block: AtomicU64::new(0),
            watermark: AtomicU64::new(0),
            guardian_index: AtomicI64::new(-2),
        }
    }

    pub fn record_block(&self, number: u64) {
        self.last_processed_block.store(number, Ordering::Relaxed);
    }

    pub fn record_watermark(&self, watermark: u64) {
        self.watermark.store(watermark, Ordering::Relaxed);
    }

    pub fn record_guardian_index(&self, index: i32) {
        self.guardian_index.store(index as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let uptime_secs = get_current_time_in_seconds().saturating_sub(self.started_at);
        let guardian_index = match self.guardian_index.load(Ordering::Relaxed) {
            -2 => None,
            index => Some(index as i32),
        };
        StatusSnapshot {
            status: "ok",
            uptime: humantime::format_duration(std::time::Duration::from_secs(uptime_secs))
                .to_string(),
            last_processed_block: self.last_processed_block.load(Ordering::Relaxed),
            watermark: self.watermark.load(Ordering::Relaxed),
            guardian_index,
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
