//! Per-disk BFQ counters, registered in a process-global table while the
//! disk's control actor runs.
//!
//! Everything here is written by the actor thread and may be read from
//! anywhere. The operator toggles and `max_budget` may also be written from
//! anywhere; the actor picks the new values up on its next decision.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use once_cell::sync::Lazy;

use super::BfqConfig;

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<BfqDiagnostics>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The live counters of the BFQ-scheduled disk called `disk`.
pub fn lookup(disk: &str) -> Option<Arc<BfqDiagnostics>> {
    REGISTRY.lock().unwrap().get(disk).cloned()
}

/// Names of all disks with registered counters.
pub fn disks() -> Vec<String> {
    let mut disks: Vec<_> = REGISTRY.lock().unwrap().keys().cloned().collect();
    disks.sort();
    disks
}

pub(super) fn register(diagnostics: &Arc<BfqDiagnostics>) {
    REGISTRY
        .lock()
        .unwrap()
        .insert(diagnostics.disk.clone(), Arc::clone(diagnostics));
}

pub(super) fn unregister(diagnostics: &Arc<BfqDiagnostics>) {
    let mut registry = REGISTRY.lock().unwrap();
    // a newer attach of the same disk name may have replaced us
    if registry
        .get(&diagnostics.disk)
        .map_or(false, |d| Arc::ptr_eq(d, diagnostics))
    {
        registry.remove(&diagnostics.disk);
    }
}

#[derive(Debug)]
pub struct BfqDiagnostics {
    disk: String,
    anticipation_wait: Duration,
    slice_timeout: Duration,

    max_budget: AtomicU64,
    anticipation: AtomicBool,
    auto_max_budget: AtomicBool,

    peak_rate: AtomicU64,
    peak_rate_samples: AtomicU64,

    anticipating: AtomicBool,
    anticipation_hits: AtomicU64,
    anticipation_misses: AtomicU64,
    avg_wait_all_us: AtomicU64,
    avg_wait_miss_us: AtomicU64,
    max_wait_us: AtomicU64,
    max_wait_epoch_us: AtomicU64,
    high_wait_count: AtomicU64,
    high_wait_count_epoch: AtomicU64,

    avg_time_slice_us: AtomicU64,
    max_time_slice_us: AtomicU64,
    high_time_slice_count: AtomicU64,
}

/// Plain copy of [`BfqDiagnostics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfqStats {
    pub disk: String,
    pub max_budget: u64,
    pub anticipation: bool,
    pub auto_max_budget: bool,
    /// Bytes per second.
    pub estimated_peak_rate: u64,
    pub peak_rate_samples: u64,
    pub anticipation_hits: u64,
    pub anticipation_misses: u64,
    pub avg_anticipation_wait_all: Duration,
    pub avg_anticipation_wait_miss: Duration,
    pub max_anticipation_wait: Duration,
    pub max_anticipation_wait_epoch: Duration,
    pub high_wait_count: u64,
    pub high_wait_count_epoch: u64,
    pub avg_time_slice: Duration,
    pub max_time_slice: Duration,
    pub high_time_slice_count: u64,
}

fn ewma(cell: &AtomicU64, sample: u64) {
    let old = cell.load(Ordering::Relaxed);
    cell.store((7 * old + sample) / 8, Ordering::Relaxed);
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl BfqDiagnostics {
    pub(super) fn new(disk: &str, config: &BfqConfig) -> Self {
        BfqDiagnostics {
            disk: disk.to_owned(),
            anticipation_wait: config.anticipation_wait,
            slice_timeout: config.slice_timeout,
            max_budget: AtomicU64::new(config.max_budget),
            anticipation: AtomicBool::new(config.anticipation),
            auto_max_budget: AtomicBool::new(config.auto_max_budget),
            peak_rate: AtomicU64::new(0),
            peak_rate_samples: AtomicU64::new(0),
            anticipating: AtomicBool::new(false),
            anticipation_hits: AtomicU64::new(0),
            anticipation_misses: AtomicU64::new(0),
            avg_wait_all_us: AtomicU64::new(0),
            avg_wait_miss_us: AtomicU64::new(0),
            max_wait_us: AtomicU64::new(0),
            max_wait_epoch_us: AtomicU64::new(0),
            high_wait_count: AtomicU64::new(0),
            high_wait_count_epoch: AtomicU64::new(0),
            avg_time_slice_us: AtomicU64::new(0),
            max_time_slice_us: AtomicU64::new(0),
            high_time_slice_count: AtomicU64::new(0),
        }
    }

    pub fn disk(&self) -> &str {
        &self.disk
    }

    pub fn max_budget(&self) -> u64 {
        self.max_budget.load(Ordering::Relaxed)
    }

    pub fn set_max_budget(&self, bytes: u64) {
        self.max_budget.store(bytes, Ordering::Relaxed);
    }

    pub fn anticipation(&self) -> bool {
        self.anticipation.load(Ordering::Relaxed)
    }

    pub fn set_anticipation(&self, enabled: bool) {
        self.anticipation.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_max_budget(&self) -> bool {
        self.auto_max_budget.load(Ordering::Relaxed)
    }

    pub fn set_auto_max_budget(&self, enabled: bool) {
        self.auto_max_budget.store(enabled, Ordering::Relaxed);
    }

    /// Whether the actor is currently holding the disk for a client whose
    /// queue ran empty.
    pub fn is_anticipating(&self) -> bool {
        self.anticipating.load(Ordering::Relaxed)
    }

    pub(super) fn set_anticipating(&self, anticipating: bool) {
        self.anticipating.store(anticipating, Ordering::Relaxed);
    }

    pub fn anticipation_hits(&self) -> u64 {
        self.anticipation_hits.load(Ordering::Relaxed)
    }

    pub fn anticipation_misses(&self) -> u64 {
        self.anticipation_misses.load(Ordering::Relaxed)
    }

    /// Clear the current-epoch variants of the maximum wait and high-wait
    /// counters.
    pub fn reset_epoch(&self) {
        self.max_wait_epoch_us.store(0, Ordering::Relaxed);
        self.high_wait_count_epoch.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BfqStats {
        let us = |cell: &AtomicU64| Duration::from_micros(cell.load(Ordering::Relaxed));
        BfqStats {
            disk: self.disk.clone(),
            max_budget: self.max_budget(),
            anticipation: self.anticipation(),
            auto_max_budget: self.auto_max_budget(),
            estimated_peak_rate: self.peak_rate.load(Ordering::Relaxed),
            peak_rate_samples: self.peak_rate_samples.load(Ordering::Relaxed),
            anticipation_hits: self.anticipation_hits(),
            anticipation_misses: self.anticipation_misses(),
            avg_anticipation_wait_all: us(&self.avg_wait_all_us),
            avg_anticipation_wait_miss: us(&self.avg_wait_miss_us),
            max_anticipation_wait: us(&self.max_wait_us),
            max_anticipation_wait_epoch: us(&self.max_wait_epoch_us),
            high_wait_count: self.high_wait_count.load(Ordering::Relaxed),
            high_wait_count_epoch: self.high_wait_count_epoch.load(Ordering::Relaxed),
            avg_time_slice: us(&self.avg_time_slice_us),
            max_time_slice: us(&self.max_time_slice_us),
            high_time_slice_count: self.high_time_slice_count.load(Ordering::Relaxed),
        }
    }

    /// An anticipation ended, either because the client submitted again
    /// (`miss == false`) or because the timer fired.
    pub(super) fn note_anticipation_wait(&self, wait: Duration, miss: bool) {
        let us = micros(wait);
        if miss {
            self.anticipation_misses.fetch_add(1, Ordering::Relaxed);
            ewma(&self.avg_wait_miss_us, us);
        } else {
            self.anticipation_hits.fetch_add(1, Ordering::Relaxed);
        }
        ewma(&self.avg_wait_all_us, us);
        if wait > self.anticipation_wait * 5 {
            self.high_wait_count.fetch_add(1, Ordering::Relaxed);
            self.high_wait_count_epoch.fetch_add(1, Ordering::Relaxed);
        }
        self.max_wait_us.fetch_max(us, Ordering::Relaxed);
        self.max_wait_epoch_us.fetch_max(us, Ordering::Relaxed);
    }

    pub(super) fn note_time_slice(&self, slice: Duration) {
        let us = micros(slice);
        if slice > self.slice_timeout * 3 {
            self.high_time_slice_count.fetch_add(1, Ordering::Relaxed);
        }
        ewma(&self.avg_time_slice_us, us);
        self.max_time_slice_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Fold in one throughput sample (bytes per second). Returns the new
    /// estimate and the number of samples it is based on.
    pub(super) fn note_peak_rate(&self, rate: u64, saturate_at: u64) -> (u64, u64) {
        let old = self.peak_rate.load(Ordering::Relaxed);
        let new = (rate + 7 * old) / 8;
        self.peak_rate.store(new, Ordering::Relaxed);
        let samples = (self.peak_rate_samples.load(Ordering::Relaxed) + 1).min(saturate_at);
        self.peak_rate_samples.store(samples, Ordering::Relaxed);
        (new, samples)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{lookup, register, unregister, BfqDiagnostics};
    use crate::policy::bfq::BfqConfig;

    #[test]
    fn epoch_reset_keeps_lifetime_values() {
        let config = BfqConfig::default();
        let d = BfqDiagnostics::new("diag0", &config);
        let long = config.anticipation_wait * 6;
        d.note_anticipation_wait(long, true);
        d.note_anticipation_wait(Duration::from_micros(10), false);
        d.reset_epoch();
        let s = d.snapshot();
        assert_eq!(s.anticipation_misses, 1);
        assert_eq!(s.anticipation_hits, 1);
        assert_eq!(s.high_wait_count, 1);
        assert_eq!(s.high_wait_count_epoch, 0);
        assert_eq!(s.max_anticipation_wait, long);
        assert_eq!(s.max_anticipation_wait_epoch, Duration::ZERO);
    }

    #[test]
    fn waits_are_averaged_with_seven_eighths_weight() {
        let d = BfqDiagnostics::new("diag1", &BfqConfig::default());
        d.note_anticipation_wait(Duration::from_micros(800), true);
        let s = d.snapshot();
        assert_eq!(s.avg_anticipation_wait_all, Duration::from_micros(100));
        assert_eq!(s.avg_anticipation_wait_miss, Duration::from_micros(100));
    }

    #[test]
    fn unregister_leaves_newer_registration_alone() {
        let config = BfqConfig::default();
        let old = Arc::new(BfqDiagnostics::new("diag2", &config));
        let new = Arc::new(BfqDiagnostics::new("diag2", &config));
        register(&old);
        register(&new);
        unregister(&old);
        assert!(Arc::ptr_eq(&lookup("diag2").unwrap(), &new));
        unregister(&new);
        assert!(lookup("diag2").is_none());
    }
}
