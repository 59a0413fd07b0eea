//! Cooldown list for relays that keep failing
//!
//! After `threshold` consecutive connection failures a relay is "browned"
//! and skipped until its cooldown passes. A single success clears it.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BrownListConfig;
use crate::error::{Error, Result};

/// A success this recent counts as evidence the network is up.
const NETWORK_HEALTH_WINDOW: Duration = Duration::from_secs(300);

const PERSIST_VERSION: u32 = 1;

/// One tracked relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrownEntry {
    pub url: String,
    pub consecutive_failures: u32,
    pub skip_until: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    pub recoveries: u32,
}

impl BrownEntry {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            consecutive_failures: 0,
            skip_until: None,
            last_failure: None,
            recoveries: 0,
        }
    }

    fn browned_at(&self, now: SystemTime) -> bool {
        self.skip_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrownListStats {
    /// Tracked relays
    pub total: usize,
    /// Relays currently skipped
    pub browned: usize,
    /// Tracked relays with no outstanding failures
    pub healthy: usize,
    /// Relays with failures that have not yet crossed the threshold
    pub failing: usize,
    /// Successes that cleared a failing or browned relay
    pub recovered: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, BrownEntry>,
    connected: usize,
    last_success: Option<SystemTime>,
    recovered: u64,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    url: String,
    consecutive_failures: u32,
    #[serde(default)]
    skip_until: Option<u64>,
    #[serde(default)]
    last_failure: Option<u64>,
    #[serde(default)]
    recoveries: u32,
}

#[derive(Debug)]
pub struct BrownList {
    config: Mutex<BrownListConfig>,
    inner: Mutex<Inner>,
}

impl Default for BrownList {
    fn default() -> Self {
        Self::new(BrownListConfig::default())
    }
}

impl BrownList {
    pub fn new(mut config: BrownListConfig) -> Self {
        config.cooldown = config.cooldown.max(BrownListConfig::MIN_COOLDOWN);
        config.threshold = config.threshold.max(1);
        Self {
            config: Mutex::new(config),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> BrownListConfig {
        *self.config.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.config.lock().enabled = enabled;
    }

    pub fn set_threshold(&self, threshold: u32) {
        self.config.lock().threshold = threshold.max(1);
    }

    /// Cooldowns shorter than [`BrownListConfig::MIN_COOLDOWN`] are raised to it.
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.config.lock().cooldown = cooldown.max(BrownListConfig::MIN_COOLDOWN);
    }

    pub fn record_failure(&self, url: &str) -> bool {
        self.record_failure_at(url, SystemTime::now())
    }

    /// Counts a failure; returns true when this failure browned the relay.
    pub fn record_failure_at(&self, url: &str, now: SystemTime) -> bool {
        let config = self.config();
        let mut inner = self.inner.lock();
        let healthy = inner.network_healthy(now);
        if !inner.entries.contains_key(url) {
            inner.make_room(config.max_entries, now);
        }
        let entry = inner
            .entries
            .entry(url.to_string())
            .or_insert_with(|| BrownEntry::new(url));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure = Some(now);

        if entry.consecutive_failures < config.threshold || entry.browned_at(now) {
            return false;
        }
        if config.require_network_health && !healthy {
            tracing::debug!(url, "network looks down; not browning relay");
            return false;
        }
        entry.skip_until = Some(now + config.cooldown);
        tracing::info!(
            url,
            failures = entry.consecutive_failures,
            cooldown_secs = config.cooldown.as_secs(),
            "relay browned"
        );
        true
    }

    pub fn record_success(&self, url: &str) {
        self.record_success_at(url, SystemTime::now());
    }

    /// Clears the relay and marks the network as up.
    pub fn record_success_at(&self, url: &str, now: SystemTime) {
        let mut inner = self.inner.lock();
        inner.last_success = Some(now);
        let mut recovered = false;
        if let Some(entry) = inner.entries.get_mut(url)
            && (entry.consecutive_failures > 0 || entry.skip_until.is_some())
        {
            entry.consecutive_failures = 0;
            entry.skip_until = None;
            entry.recoveries = entry.recoveries.saturating_add(1);
            recovered = true;
        }
        if recovered {
            inner.recovered += 1;
            tracing::debug!(url, "relay recovered");
        }
    }

    /// Number of relays the owner currently holds connected; any non-zero
    /// value counts as a healthy network.
    pub fn set_connected_count(&self, connected: usize) {
        self.inner.lock().connected = connected;
    }

    pub fn should_skip(&self, url: &str) -> bool {
        self.should_skip_at(url, SystemTime::now())
    }

    /// True while `url` is inside its cooldown. Elapsed cooldowns are
    /// cleared on the way.
    pub fn should_skip_at(&self, url: &str, now: SystemTime) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(url) else {
            return false;
        };
        match entry.skip_until {
            Some(until) if now < until => true,
            Some(_) => {
                entry.skip_until = None;
                entry.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn time_remaining(&self, url: &str) -> Option<Duration> {
        let now = SystemTime::now();
        self.inner
            .lock()
            .entries
            .get(url)
            .and_then(|e| e.skip_until)
            .and_then(|until| until.duration_since(now).ok())
    }

    pub fn failure_count(&self, url: &str) -> u32 {
        self.inner
            .lock()
            .entries
            .get(url)
            .map_or(0, |e| e.consecutive_failures)
    }

    pub fn clear(&self, url: &str) -> bool {
        self.inner.lock().entries.remove(url).is_some()
    }

    pub fn clear_all(&self) {
        self.inner.lock().entries.clear();
    }

    /// Drops entries whose cooldown has passed; returns how many.
    pub fn expire_stale(&self) -> usize {
        self.expire_stale_at(SystemTime::now())
    }

    pub fn expire_stale_at(&self, now: SystemTime) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.skip_until.is_none_or(|until| now < until));
        before - inner.entries.len()
    }

    /// Snapshot of every tracked relay.
    pub fn entries(&self) -> Vec<BrownEntry> {
        let mut entries: Vec<_> = self.inner.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        entries
    }

    pub fn stats(&self) -> BrownListStats {
        let now = SystemTime::now();
        let inner = self.inner.lock();
        let mut stats = BrownListStats {
            total: inner.entries.len(),
            recovered: inner.recovered,
            ..BrownListStats::default()
        };
        for entry in inner.entries.values() {
            if entry.browned_at(now) {
                stats.browned += 1;
            } else if entry.consecutive_failures > 0 {
                stats.failing += 1;
            } else {
                stats.healthy += 1;
            }
        }
        stats
    }

    /// Writes the list as JSON; cooldowns are stored as Unix seconds.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let persisted = Persisted {
            version: PERSIST_VERSION,
            entries: self
                .entries()
                .into_iter()
                .map(|e| PersistedEntry {
                    url: e.url,
                    consecutive_failures: e.consecutive_failures,
                    skip_until: e.skip_until.map(to_unix),
                    last_failure: e.last_failure.map(to_unix),
                    recoveries: e.recoveries,
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| Error::Internal(format!("encode brown list: {e}")))?;
        std::fs::write(path.as_ref(), json).map_err(|e| {
            Error::Internal(format!("write {}: {e}", path.as_ref().display()))
        })
    }

    /// Merges entries from a file written by [`BrownList::save`]. Entries
    /// whose cooldown already passed are loaded without it.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let raw = std::fs::read(path.as_ref())
            .map_err(|e| Error::Internal(format!("read {}: {e}", path.as_ref().display())))?;
        let persisted: Persisted = serde_json::from_slice(&raw)
            .map_err(|e| Error::Internal(format!("decode brown list: {e}")))?;
        if persisted.version != PERSIST_VERSION {
            return Err(Error::Internal(format!(
                "unsupported brown list version {}",
                persisted.version
            )));
        }
        let now = SystemTime::now();
        let max_entries = self.config().max_entries;
        let mut inner = self.inner.lock();
        let mut loaded = 0;
        for p in persisted.entries {
            if !inner.entries.contains_key(&p.url) {
                inner.make_room(max_entries, now);
            }
            let skip_until = p.skip_until.map(from_unix).filter(|until| now < *until);
            inner.entries.insert(
                p.url.clone(),
                BrownEntry {
                    url: p.url,
                    consecutive_failures: p.consecutive_failures,
                    skip_until,
                    last_failure: p.last_failure.map(from_unix),
                    recoveries: p.recoveries,
                },
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Inner {
    fn network_healthy(&self, now: SystemTime) -> bool {
        self.connected > 0
            || self.last_success.is_some_and(|at| {
                now.duration_since(at)
                    .is_ok_and(|age| age < NETWORK_HEALTH_WINDOW)
            })
    }

    /// Evicts expired entries, then the stalest failure, until one slot is free.
    fn make_room(&mut self, max_entries: usize, now: SystemTime) {
        if self.entries.len() < max_entries.max(1) {
            return;
        }
        self.entries
            .retain(|_, e| e.skip_until.is_none_or(|until| now < until) && e.consecutive_failures > 0);
        while self.entries.len() >= max_entries.max(1) {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.last_failure.unwrap_or(UNIX_EPOCH))
                .map(|e| e.url.clone());
            match oldest {
                Some(url) => {
                    self.entries.remove(&url);
                }
                None => break,
            }
        }
    }
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
