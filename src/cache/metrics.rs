//! Cache Metrics Collection
//!
//! Counters for how requests were satisfied and what memory the cache took on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::region::Level;

/// Per-tier counter triple
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    derived: AtomicU64,
    consolidations: AtomicU64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    tiers: [TierCounters; 3],

    // Producer pulls
    producer_invocations: AtomicU64,
    producer_misses: AtomicU64,

    // Memory
    fresh_allocations: AtomicU64,
    bytes_allocated: AtomicU64,
    detaches: AtomicU64,

    // Writes
    first_fills: AtomicU64,
    modifications: AtomicU64,

    invalid_probes: AtomicU64,

    // Get latency (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, level: Level) -> &TierCounters {
        &self.tiers[level.index()]
    }

    // Lookup outcomes
    pub fn record_hit(&self, level: Level) {
        self.tier(level).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_derived(&self, level: Level) {
        self.tier(level).derived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consolidation(&self, level: Level) {
        self.tier(level).consolidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self, level: Level) -> u64 {
        self.tier(level).hits.load(Ordering::Relaxed)
    }

    pub fn derived(&self, level: Level) -> u64 {
        self.tier(level).derived.load(Ordering::Relaxed)
    }

    pub fn consolidations(&self, level: Level) -> u64 {
        self.tier(level).consolidations.load(Ordering::Relaxed)
    }

    // Producer
    pub fn record_producer_invocation(&self) {
        self.producer_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_miss(&self) {
        self.producer_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn producer_invocations(&self) -> u64 {
        self.producer_invocations.load(Ordering::Relaxed)
    }

    pub fn producer_misses(&self) -> u64 {
        self.producer_misses.load(Ordering::Relaxed)
    }

    // Memory
    pub fn record_allocation(&self, bytes: usize) {
        self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_detach(&self) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fresh_allocations(&self) -> u64 {
        self.fresh_allocations.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn detaches(&self) -> u64 {
        self.detaches.load(Ordering::Relaxed)
    }

    // Writes
    pub fn record_first_fill(&self) {
        self.first_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_modification(&self) {
        self.modifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn first_fills(&self) -> u64 {
        self.first_fills.load(Ordering::Relaxed)
    }

    pub fn modifications(&self) -> u64 {
        self.modifications.load(Ordering::Relaxed)
    }

    pub fn record_invalid_probe(&self) {
        self.invalid_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_probes(&self) -> u64 {
        self.invalid_probes.load(Ordering::Relaxed)
    }

    // Latency tracking
    pub fn record_get_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.get_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .get_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn get_latency(&self) -> Duration {
        Duration::from_micros(self.get_latency_us.load(Ordering::Relaxed))
    }

    /// Share of lookups answered without a producer pull or fresh allocation
    pub fn served_ratio(&self) -> f64 {
        let served: u64 = Level::ALL
            .iter()
            .map(|&l| self.hits(l) + self.derived(l) + self.consolidations(l))
            .sum();
        let total = served + self.producer_invocations() + self.fresh_allocations();
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics, with the given populated-entry gauges
    pub fn snapshot(&self, entries: [usize; 3]) -> MetricsSnapshot {
        let tier = |level: Level| TierSnapshot {
            entries: entries[level.index()] as u64,
            hits: self.hits(level),
            derived: self.derived(level),
            consolidations: self.consolidations(level),
        };

        MetricsSnapshot {
            slice: tier(Level::Slice),
            volume: tier(Level::Volume),
            channel: tier(Level::Channel),

            producer_invocations: self.producer_invocations(),
            producer_misses: self.producer_misses(),

            fresh_allocations: self.fresh_allocations(),
            bytes_allocated: self.bytes_allocated(),
            detaches: self.detaches(),

            first_fills: self.first_fills(),
            modifications: self.modifications(),
            invalid_probes: self.invalid_probes(),

            get_latency_us: self.get_latency().as_micros() as u64,
            served_ratio: self.served_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for tier in &self.tiers {
            tier.hits.store(0, Ordering::Relaxed);
            tier.derived.store(0, Ordering::Relaxed);
            tier.consolidations.store(0, Ordering::Relaxed);
        }
        self.producer_invocations.store(0, Ordering::Relaxed);
        self.producer_misses.store(0, Ordering::Relaxed);
        self.fresh_allocations.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.detaches.store(0, Ordering::Relaxed);
        self.first_fills.store(0, Ordering::Relaxed);
        self.modifications.store(0, Ordering::Relaxed);
        self.invalid_probes.store(0, Ordering::Relaxed);
        self.get_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Counters for one tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierSnapshot {
    pub entries: u64,
    pub hits: u64,
    pub derived: u64,
    pub consolidations: u64,
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub slice: TierSnapshot,
    pub volume: TierSnapshot,
    pub channel: TierSnapshot,

    // Producer
    pub producer_invocations: u64,
    pub producer_misses: u64,

    // Memory
    pub fresh_allocations: u64,
    pub bytes_allocated: u64,
    pub detaches: u64,

    // Writes
    pub first_fills: u64,
    pub modifications: u64,
    pub invalid_probes: u64,

    // Overall
    pub get_latency_us: u64,
    pub served_ratio: f64,
}

impl MetricsSnapshot {
    pub fn tier(&self, level: Level) -> &TierSnapshot {
        match level {
            Level::Slice => &self.slice,
            Level::Volume => &self.volume,
            Level::Channel => &self.channel,
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
