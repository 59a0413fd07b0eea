//! Process-wide index of active subscriptions
//!
//! Relays consult it to enforce a relay's advertised `max_subscriptions`;
//! pools read it to report queue health for the subscriptions they own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Weak};

use parking_lot::Mutex;
use serde::Serialize;

static GLOBAL: LazyLock<SubRegistry> = LazyLock::new(SubRegistry::new);

/// Lifetime class of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubKind {
    /// Ends at EOSE or with its query; closed when the connection drops
    Ephemeral,
    /// Long-lived; re-sent after a reconnect
    Persistent,
}

/// Queue counters of one subscription's `events` channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub depth: usize,
    pub capacity: usize,
    pub peak_depth: usize,
}

/// Aggregate of [`QueueStats`] over a set of subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub subscriptions: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub depth: usize,
    pub capacity: usize,
    /// Highest single-subscription peak
    pub peak_depth: usize,
}

impl QueueMetrics {
    fn add(&mut self, stats: QueueStats) {
        self.subscriptions += 1;
        self.enqueued += stats.enqueued;
        self.dequeued += stats.dequeued;
        self.dropped += stats.dropped;
        self.depth += stats.depth;
        self.capacity += stats.capacity;
        self.peak_depth = self.peak_depth.max(stats.peak_depth);
    }
}

/// Anything that can report its queue counters.
pub trait QueueProbe: Send + Sync {
    fn queue_stats(&self) -> QueueStats;
}

/// Handle returned by [`SubRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Entry {
    url: String,
    sub_id: String,
    kind: SubKind,
    group: Option<String>,
    probe: Weak<dyn QueueProbe>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RegistrationId, Entry>,
    per_url: HashMap<String, usize>,
}

pub struct SubRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    total_registered: AtomicU64,
}

impl Default for SubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubRegistry")
            .field("active", &self.total_active())
            .field("total_registered", &self.total_registered())
            .finish()
    }
}

impl SubRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            total_registered: AtomicU64::new(0),
        }
    }

    /// Registry shared by every relay in the process
    pub fn global() -> &'static SubRegistry {
        &GLOBAL
    }

    pub fn register(
        &self,
        url: &str,
        sub_id: &str,
        kind: SubKind,
        group: Option<&str>,
        probe: Weak<dyn QueueProbe>,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        *inner.per_url.entry(url.to_string()).or_default() += 1;
        inner.entries.insert(
            id,
            Entry {
                url: url.to_string(),
                sub_id: sub_id.to_string(),
                kind,
                group: group.map(str::to_string),
                probe,
            },
        );
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(&id) else {
            return false;
        };
        if let Some(count) = inner.per_url.get_mut(&entry.url) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.per_url.remove(&entry.url);
            }
        }
        true
    }

    /// Active subscriptions against `url`
    pub fn count(&self, url: &str) -> usize {
        self.inner.lock().per_url.get(url).copied().unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Registrations ever made
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    pub fn count_kind(&self, kind: SubKind) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn count_group(&self, group: &str) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.group.as_deref() == Some(group))
            .count()
    }

    /// Subscription ids registered against `url`
    pub fn sub_ids(&self, url: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| e.url == url)
            .map(|e| e.sub_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Aggregate queue health, optionally limited to one group.
    pub fn queue_metrics(&self, group: Option<&str>) -> QueueMetrics {
        let probes: Vec<_> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| group.is_none() || e.group.as_deref() == group)
            .map(|e| e.probe.clone())
            .collect();
        // Probes take their own locks; query them with the registry unlocked.
        let mut metrics = QueueMetrics::default();
        for probe in probes.iter().filter_map(Weak::upgrade) {
            metrics.add(probe.queue_stats());
        }
        metrics
    }
}
