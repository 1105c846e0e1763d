//! Cache Set Statistics
//!
//! Counters live on each set engine; nothing is shared between instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Per-set counters, updated without holding the set lock
#[derive(Debug, Default)]
pub struct SetCounters {
    attempts: AtomicU64,
    hits_from_memory: AtomicU64,
    hits_from_disk: AtomicU64,
    misses: AtomicU64,
    keys_lost: AtomicU64,
    objects_lost: AtomicU64,
    collisions: AtomicU64,
}

impl SetCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_hit(&self) {
        self.hits_from_memory.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.hits_from_disk.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_lost(&self) {
        self.keys_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_object_lost(&self) {
        self.objects_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits_from_memory.load(Ordering::Relaxed) + self.hits_from_disk.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn objects_lost(&self) -> u64 {
        self.objects_lost.load(Ordering::Relaxed)
    }

    /// Fill the counter fields of a snapshot
    pub fn fill(&self, stats: &mut SetStats) {
        stats.attempts = self.attempts();
        stats.hits_from_memory = self.hits_from_memory.load(Ordering::Relaxed);
        stats.hits_from_disk = self.hits_from_disk.load(Ordering::Relaxed);
        stats.misses = self.misses();
        stats.keys_lost = self.keys_lost.load(Ordering::Relaxed);
        stats.objects_lost = self.objects_lost();
        stats.collisions = self.collisions.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of a set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SetStats {
    pub cache_name: String,
    pub set_name: String,
    pub tag_name: Option<String>,
    /// Live records in the index
    pub entries: u64,
    /// Records physically in the file, live or dead
    pub file_entries: u64,
    pub file_bytes: u64,
    pub resident_keys: u64,
    pub resident_key_bytes: u64,
    pub resident_objects: u64,
    pub resident_object_bytes: u64,
    pub attempts: u64,
    pub hits_from_memory: u64,
    pub hits_from_disk: u64,
    pub misses: u64,
    pub keys_lost: u64,
    pub objects_lost: u64,
    pub collisions: u64,
}

impl SetStats {
    /// Hits over attempts, 0 when nothing was asked yet
    pub fn hit_ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            (self.hits_from_memory + self.hits_from_disk) as f64 / self.attempts as f64
        }
    }
}

/// Decides when to dump statistics and when to warn about memory loss
#[derive(Debug)]
pub struct ReportSchedule {
    interval: Option<Duration>,
    next_dump: Option<Instant>,
    max_loss_rate: f64,
    warning_interval: Duration,
    last_warning: Option<Instant>,
    baseline_lost: u64,
    baseline_hits: u64,
}

impl ReportSchedule {
    pub fn new(interval: Option<Duration>, max_loss_rate: f64, warning_interval: Duration) -> Self {
        Self {
            interval,
            next_dump: interval.map(|i| Instant::now() + i),
            max_loss_rate,
            warning_interval,
            last_warning: None,
            baseline_lost: 0,
            baseline_hits: 0,
        }
    }

    /// Whether a periodic dump is due at `now`; rearms the timer if so
    pub fn dump_due(&mut self, now: Instant) -> bool {
        match (self.interval, self.next_dump) {
            (Some(interval), Some(next)) if now >= next => {
                self.next_dump = Some(now + interval);
                true
            }
            _ => false,
        }
    }

    /// Loss rate to warn about, if the threshold is crossed and no warning
    /// went out within the warning interval
    ///
    /// The rate covers objects lost and hits made since the previous warning.
    pub fn loss_warning(&mut self, counters: &SetCounters, now: Instant) -> Option<f64> {
        if let Some(last) = self.last_warning {
            if now.duration_since(last) < self.warning_interval {
                return None;
            }
        }

        let lost = counters.objects_lost().saturating_sub(self.baseline_lost);
        let hits = counters.hits().saturating_sub(self.baseline_hits);
        let rate = lost as f64 / (hits + 1) as f64;
        if rate <= self.max_loss_rate {
            return None;
        }

        self.last_warning = Some(now);
        self.baseline_lost = counters.objects_lost();
        self.baseline_hits = counters.hits();
        Some(rate)
    }
}
