//! Named counters and latency histograms
//!
//! A [`Metrics`] instance is shared (`Arc`) by everything a pool creates:
//! its relays, their subscriptions and every channel underneath. Standalone
//! relays fall back to [`Metrics::global`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use serde::Serialize;

static GLOBAL: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

macro_rules! counters {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Counter names
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Counter {
            $(
                #[doc = $name]
                $variant,
            )+
        }

        impl Counter {
            /// Every counter, in declaration order
            pub const ALL: &'static [Counter] = &[$(Counter::$variant),+];

            /// Exported name
            pub fn name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $name,)+
                }
            }
        }
    };
}

counters! {
    SendSuccesses => "send_successes",
    RecvSuccesses => "recv_successes",
    TrySendFailures => "try_send_failures",
    TryRecvFailures => "try_recv_failures",
    BlockSends => "block_sends",
    BlockRecvs => "block_recvs",
    SendDepthSum => "send_depth_sum",
    RecvDepthSum => "recv_depth_sum",
    CloseBroadcasts => "close_broadcasts",
    EventsDropped => "events_dropped",
    SubscriptionsReceived => "subscriptions_received",
    CloseReceived => "close_received",
    PoolSubRegistered => "pool_sub_registered",
    PoolSubRemoved => "pool_sub_removed",
    PoolCleanupSuccess => "pool_cleanup_success",
    PoolCleanupTimeout => "pool_cleanup_timeout",
    PoolRelayBrownedSkip => "pool_relay_browned_skip",
    TotalRequests => "total_requests",
    TotalBatches => "total_batches",
    TotalEventsDemuxed => "total_events_demuxed",
    EoseLateArrival => "eose_late_arrival",
    EventsUnknownSub => "events_unknown_sub",
    InvalidFrames => "invalid_frames",
    InvalidSignatures => "invalid_signatures",
    BannedPubkeyDrops => "banned_pubkey_drops",
}

/// Histogram names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistogramId {
    /// Time a blocking send spent parked
    SendWaitNs,
    /// Time a blocking receive spent parked
    RecvWaitNs,
}

impl HistogramId {
    /// Every histogram
    pub const ALL: &'static [HistogramId] = &[HistogramId::SendWaitNs, HistogramId::RecvWaitNs];

    /// Exported name
    pub fn name(self) -> &'static str {
        match self {
            HistogramId::SendWaitNs => "send_wait_ns",
            HistogramId::RecvWaitNs => "recv_wait_ns",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

const BUCKETS: usize = 64;

/// Power-of-two bucketed histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    /// Record one observation
    pub fn observe(&self, value: u64) {
        let bucket = (u64::BITS - value.leading_zeros()) as usize;
        self.buckets[bucket.min(BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let count = self.count.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            p50: quantile(&counts, count, 0.50),
            p99: quantile(&counts, count, 0.99),
        }
    }

    fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

/// Upper bound of the bucket holding the q-quantile.
fn quantile(counts: &[u64], total: u64, q: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let target = ((total as f64) * q).ceil().max(1.0) as u64;
    let mut seen = 0u64;
    for (i, c) in counts.iter().enumerate() {
        seen += c;
        if seen >= target {
            return if i == 0 { 0 } else { (1u64 << (i - 1)).saturating_mul(2) - 1 };
        }
    }
    u64::MAX
}

/// Serializable histogram summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    /// Observations
    pub count: u64,
    /// Sum of observations
    pub sum: u64,
    /// Largest observation
    pub max: u64,
    /// Approximate median (bucket upper bound)
    pub p50: u64,
    /// Approximate 99th percentile (bucket upper bound)
    pub p99: u64,
}

/// Serializable view of every counter and histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values by name
    pub counters: BTreeMap<&'static str, u64>,
    /// Histogram summaries by name
    pub histograms: BTreeMap<&'static str, HistogramSnapshot>,
}

impl MetricsSnapshot {
    /// Counter value by name, zero when unknown
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Counter and histogram registry
#[derive(Debug)]
pub struct Metrics {
    counters: Vec<AtomicU64>,
    histograms: [Histogram; 2],
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Fresh registry with every value at zero
    pub fn new() -> Self {
        Self {
            counters: Counter::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            histograms: [Histogram::default(), Histogram::default()],
        }
    }

    /// Process-wide registry
    pub fn global() -> Arc<Metrics> {
        Arc::clone(&GLOBAL)
    }

    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn observe(&self, histogram: HistogramId, value: u64) {
        self.histograms[histogram.index()].observe(value);
    }

    pub fn histogram(&self, histogram: HistogramId) -> HistogramSnapshot {
        self.histograms[histogram.index()].snapshot()
    }

    /// Zero every value
    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
        for h in &self.histograms {
            h.reset();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL
                .iter()
                .map(|c| (c.name(), self.get(*c)))
                .collect(),
            histograms: HistogramId::ALL
                .iter()
                .map(|h| (h.name(), self.histogram(*h)))
                .collect(),
        }
    }

    /// Emit non-zero counters at debug level
    pub fn log_summary(&self) {
        for c in Counter::ALL {
            let value = self.get(*c);
            if value > 0 {
                tracing::debug!(counter = c.name(), value, "metrics");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let metrics = Metrics::new();
        metrics.incr(Counter::SendSuccesses);
        metrics.add(Counter::EventsDropped, 3);
        assert_eq!(metrics.get(Counter::SendSuccesses), 1);
        assert_eq!(metrics.get(Counter::EventsDropped), 3);
        assert_eq!(metrics.get(Counter::RecvSuccesses), 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.counter("events_dropped"), 3);
        assert_eq!(snap.counters.len(), Counter::ALL.len());
    }

    #[test]
    fn histogram_tracks_count_sum_and_max() {
        let metrics = Metrics::new();
        for v in [1, 10, 100, 1000] {
            metrics.observe(HistogramId::RecvWaitNs, v);
        }
        let h = metrics.histogram(HistogramId::RecvWaitNs);
        assert_eq!(h.count, 4);
        assert_eq!(h.sum, 1111);
        assert_eq!(h.max, 1000);
        assert!(h.p50 >= 10 && h.p50 < 128);
        assert!(h.p99 >= 1000);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = Metrics::new();
        metrics.incr(Counter::TotalBatches);
        metrics.observe(HistogramId::SendWaitNs, 5);
        metrics.reset();
        assert_eq!(metrics.get(Counter::TotalBatches), 0);
        assert_eq!(metrics.histogram(HistogramId::SendWaitNs).count, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.incr(Counter::PoolRelayBrownedSkip);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["counters"]["pool_relay_browned_skip"], 1);
    }
}
