//! Bans pubkeys that keep sending events with bad signatures.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SigGuardConfig;

#[derive(Debug, Default)]
struct Track {
    failures: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

impl Track {
    fn last_seen(&self) -> Option<Instant> {
        self.failures.back().copied().max(self.banned_until)
    }
}

#[derive(Debug)]
pub struct SigGuard {
    config: SigGuardConfig,
    tracks: Mutex<HashMap<String, Track>>,
}

impl SigGuard {
    pub fn new(config: SigGuardConfig) -> Self {
        Self {
            config,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_banned(&self, pubkey: &str) -> bool {
        self.is_banned_at(pubkey, Instant::now())
    }

    pub fn is_banned_at(&self, pubkey: &str, now: Instant) -> bool {
        self.tracks
            .lock()
            .get(pubkey)
            .and_then(|t| t.banned_until)
            .is_some_and(|until| now < until)
    }

    pub fn record_failure(&self, pubkey: &str) -> bool {
        self.record_failure_at(pubkey, Instant::now())
    }

    /// Counts one bad signature; returns true when it triggered a ban.
    pub fn record_failure_at(&self, pubkey: &str, now: Instant) -> bool {
        let mut tracks = self.tracks.lock();
        if !tracks.contains_key(pubkey) && tracks.len() >= self.config.max_tracked.max(1) {
            evict_one(&mut tracks, now);
        }
        let track = tracks.entry(pubkey.to_string()).or_default();
        let window = self.config.window;
        while track
            .failures
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            track.failures.pop_front();
        }
        track.failures.push_back(now);

        if track.banned_until.is_some_and(|until| now < until) {
            return false;
        }
        if track.failures.len() as u32 >= self.config.threshold.max(1) {
            track.banned_until = Some(now + self.config.ban);
            track.failures.clear();
            tracing::warn!(
                pubkey,
                ban_secs = self.config.ban.as_secs(),
                "banning pubkey after repeated invalid signatures"
            );
            return true;
        }
        false
    }

    /// Pubkeys currently banned
    pub fn banned_count(&self) -> usize {
        let now = Instant::now();
        self.tracks
            .lock()
            .values()
            .filter(|t| t.banned_until.is_some_and(|until| now < until))
            .count()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn ban_remaining(&self, pubkey: &str) -> Option<Duration> {
        let now = Instant::now();
        self.tracks
            .lock()
            .get(pubkey)
            .and_then(|t| t.banned_until)
            .and_then(|until| until.checked_duration_since(now))
    }
}

/// Drops an expired ban if there is one, else the least recently seen key.
fn evict_one(tracks: &mut HashMap<String, Track>, now: Instant) {
    let victim = tracks
        .iter()
        .find(|(_, t)| t.banned_until.is_some_and(|until| until <= now))
        .or_else(|| tracks.iter().min_by_key(|(_, t)| t.last_seen()))
        .map(|(k, _)| k.clone());
    if let Some(key) = victim {
        tracks.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(threshold: u32, max_tracked: usize) -> SigGuard {
        SigGuard::new(SigGuardConfig {
            window: Duration::from_secs(60),
            threshold,
            ban: Duration::from_secs(600),
            max_tracked,
        })
    }

    #[test]
    fn bans_after_threshold_within_window() {
        let guard = guard(3, 100);
        let t0 = Instant::now();
        assert!(!guard.record_failure_at("pk", t0));
        assert!(!guard.record_failure_at("pk", t0 + Duration::from_secs(1)));
        assert!(guard.record_failure_at("pk", t0 + Duration::from_secs(2)));
        assert!(guard.is_banned_at("pk", t0 + Duration::from_secs(3)));
        assert!(!guard.is_banned_at("pk", t0 + Duration::from_secs(700)));
        assert!(!guard.is_banned_at("other", t0));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let guard = guard(2, 100);
        let t0 = Instant::now();
        assert!(!guard.record_failure_at("pk", t0));
        assert!(!guard.record_failure_at("pk", t0 + Duration::from_secs(61)));
        assert!(guard.record_failure_at("pk", t0 + Duration::from_secs(62)));
    }

    #[test]
    fn tracking_is_bounded() {
        let guard = guard(5, 2);
        let t0 = Instant::now();
        guard.record_failure_at("a", t0);
        guard.record_failure_at("b", t0 + Duration::from_secs(1));
        guard.record_failure_at("c", t0 + Duration::from_secs(2));
        assert_eq!(guard.tracked_count(), 2);
    }
}
