//! Runtime configuration
//!
//! Every tunable lives on [`Config`], which is built once and shared as
//! `Arc<Config>` by pools, relays, subscriptions and channels. The
//! `NOSTR_*` environment variables are honored only through
//! [`Config::from_env`]; nothing else in the crate reads the environment.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Default capacity of a subscription's `events` channel
pub const DEFAULT_SUB_EVENTS_CAPACITY: usize = 4096;

/// Default capacity of a subscription's `eose` channel
pub const DEFAULT_SUB_EOSE_CAPACITY: usize = 1;

/// Default capacity of the connection send/recv channels
pub const DEFAULT_CONNECTION_QUEUE_CAPACITY: usize = 1024;

/// Default size of the pool's event id dedup ring
pub const DEFAULT_DEDUP_CAPACITY: NonZeroUsize = match NonZeroUsize::new(65_536) {
    Some(v) => v,
    None => panic!("dedup capacity must be non-zero"),
};

/// Default grace period after an EOSE quorum before a query completes
pub const DEFAULT_QUORUM_GRACE: Duration = Duration::from_secs(2);

/// Default batch window of the query batcher
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(75);

/// Smallest accepted batch window
pub const MIN_BATCH_WINDOW: Duration = Duration::from_millis(1);

/// Largest accepted batch window
pub const MAX_BATCH_WINDOW: Duration = Duration::from_millis(1000);

/// Default EOSE wait cap for one batch
pub const DEFAULT_BATCH_EOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default WebSocket handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default NIP-11 fetch timeout
pub const DEFAULT_NIP11_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel spin-before-park tuning for OS-thread waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Short waits before the long park
    pub iters: u32,
    /// Length of one short wait
    pub pause: Duration,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            iters: 20,
            pause: Duration::from_micros(10),
        }
    }
}

/// Reconnect backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Lower jitter multiplier
    pub jitter_min: f64,
    /// Upper jitter multiplier
    pub jitter_max: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(300_000),
            jitter_min: 0.75,
            jitter_max: 1.25,
        }
    }
}

/// Brown list policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrownListConfig {
    /// Whether the pool consults the brown list at all
    pub enabled: bool,
    /// Consecutive failures before a relay is skipped
    pub threshold: u32,
    /// How long a browned relay is skipped
    pub cooldown: Duration,
    /// Maximum tracked relays
    pub max_entries: usize,
    /// Only brown relays while the network is demonstrably up
    pub require_network_health: bool,
}

impl BrownListConfig {
    /// Shortest accepted cooldown
    pub const MIN_COOLDOWN: Duration = Duration::from_secs(60);
}

impl Default for BrownListConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            cooldown: Duration::from_secs(1800),
            max_entries: 1000,
            require_network_health: false,
        }
    }
}

/// Invalid signature guard policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigGuardConfig {
    /// Sliding window over which failures are counted
    pub window: Duration,
    /// Failures within the window that ban a pubkey
    pub threshold: u32,
    /// Ban length
    pub ban: Duration,
    /// Maximum tracked pubkeys
    pub max_tracked: usize,
}

impl Default for SigGuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            ban: Duration::from_secs(600),
            max_tracked: 10_000,
        }
    }
}

/// Runtime configuration.
///
/// ```
/// use std::time::Duration;
/// use pika_relay_runtime::Config;
///
/// let config = Config::default()
///     .with_test_mode(true)
///     .with_sub_events_capacity(16)
///     .with_quorum_grace(Duration::from_millis(200));
/// assert_eq!(config.sub_events_capacity, 16);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Connect to in-process mock relays instead of real sockets
    pub test_mode: bool,
    /// Subscription `events` channel capacity
    pub sub_events_capacity: usize,
    /// Subscription `eose` channel capacity
    pub sub_eose_capacity: usize,
    /// Connection send/recv channel capacity
    pub connection_queue_capacity: usize,
    /// `query_single` returns on the first event or EOSE
    pub query_oneshot: bool,
    /// Pool closes subscriptions once they reach EOSE
    pub auto_unsub_on_eose: bool,
    /// Pool disconnects its relays on stop
    pub disconnect_on_stop: bool,
    /// Channel spin tuning
    pub spin: SpinConfig,
    /// Verbose channel diagnostics
    pub channel_debug: bool,
    /// Brown list policy
    pub brown_list: BrownListConfig,
    /// Reconnect backoff policy
    pub backoff: BackoffConfig,
    /// Reconnect automatically after unexpected connection loss
    pub auto_reconnect: bool,
    /// Invalid signature guard policy
    pub sig_guard: SigGuardConfig,
    /// Skip signature verification on received events
    pub assume_valid: bool,
    /// Pool dedup ring size
    pub dedup_capacity: NonZeroUsize,
    /// Grace after an EOSE quorum
    pub quorum_grace: Duration,
    /// Route `query_single` through the query batcher
    pub batching: bool,
    /// Query batcher window
    pub batch_window: Duration,
    /// Query batcher EOSE cap
    pub batch_eose_timeout: Duration,
    /// WebSocket handshake timeout
    pub connect_timeout: Duration,
    /// Fetch NIP-11 after connecting
    pub fetch_nip11: bool,
    /// NIP-11 fetch timeout
    pub nip11_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_mode: false,
            sub_events_capacity: DEFAULT_SUB_EVENTS_CAPACITY,
            sub_eose_capacity: DEFAULT_SUB_EOSE_CAPACITY,
            connection_queue_capacity: DEFAULT_CONNECTION_QUEUE_CAPACITY,
            query_oneshot: false,
            auto_unsub_on_eose: false,
            disconnect_on_stop: false,
            spin: SpinConfig::default(),
            channel_debug: false,
            brown_list: BrownListConfig::default(),
            backoff: BackoffConfig::default(),
            auto_reconnect: true,
            sig_guard: SigGuardConfig::default(),
            assume_valid: false,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            quorum_grace: DEFAULT_QUORUM_GRACE,
            batching: false,
            batch_window: DEFAULT_BATCH_WINDOW,
            batch_eose_timeout: DEFAULT_BATCH_EOSE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fetch_nip11: true,
            nip11_timeout: DEFAULT_NIP11_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults overlaid with the `NOSTR_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    /// Overlay variables from an arbitrary lookup; unparsable values are ignored.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).map(|v| v.trim() != "0" && !v.trim().is_empty());
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = flag("NOSTR_TEST_MODE") {
            self.test_mode = v;
        }
        if let Some(n) = number("NOSTR_SUB_EVENTS_CAP").filter(|n| *n > 0) {
            self.sub_events_capacity = n as usize;
        }
        if let Some(n) = number("NOSTR_SUB_EOSE_CAP").filter(|n| *n > 0) {
            self.sub_eose_capacity = n as usize;
        }
        if let Some(v) = flag("NOSTR_SIMPLE_POOL_ONESHOT") {
            self.query_oneshot = v;
        }
        if let Some(v) = flag("NOSTR_SIMPLE_POOL_AUTO_UNSUB_EOSE") {
            self.auto_unsub_on_eose = v;
        }
        if let Some(v) = flag("NOSTR_SIMPLE_POOL_DISCONNECT") {
            self.disconnect_on_stop = v;
        }
        if let Some(n) = number("NOSTR_SPIN_ITERS") {
            self.spin.iters = n.min(u32::MAX as u64) as u32;
        }
        if let Some(n) = number("NOSTR_SPIN_US") {
            self.spin.pause = Duration::from_micros(n);
        }
        if let Some(v) = flag("NOSTR_BROWN_LIST_ENABLED") {
            self.brown_list.enabled = v;
        }
        if let Some(v) = flag("NOSTR_CHAN_DEBUG") {
            self.channel_debug = v;
        }
        if let Some(n) = number("NOSTR_BATCH_WINDOW_MS") {
            self.batching = true;
            self = self.with_batch_window(Duration::from_millis(n));
        }
        self
    }

    /// Set test mode
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Set the subscription events capacity (minimum 1)
    pub fn with_sub_events_capacity(mut self, capacity: usize) -> Self {
        self.sub_events_capacity = capacity.max(1);
        self
    }

    /// Set the subscription EOSE capacity (minimum 1)
    pub fn with_sub_eose_capacity(mut self, capacity: usize) -> Self {
        self.sub_eose_capacity = capacity.max(1);
        self
    }

    /// Set one-shot query mode
    pub fn with_query_oneshot(mut self, oneshot: bool) -> Self {
        self.query_oneshot = oneshot;
        self
    }

    /// Set auto-unsubscribe on EOSE
    pub fn with_auto_unsub_on_eose(mut self, enabled: bool) -> Self {
        self.auto_unsub_on_eose = enabled;
        self
    }

    /// Set disconnect-on-stop
    pub fn with_disconnect_on_stop(mut self, enabled: bool) -> Self {
        self.disconnect_on_stop = enabled;
        self
    }

    /// Replace the brown list policy
    pub fn with_brown_list(mut self, brown_list: BrownListConfig) -> Self {
        self.brown_list = brown_list;
        self
    }

    /// Replace the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable auto reconnect
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Skip signature verification
    pub fn with_assume_valid(mut self, assume_valid: bool) -> Self {
        self.assume_valid = assume_valid;
        self
    }

    /// Set the dedup ring size
    pub fn with_dedup_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Set the EOSE quorum grace
    pub fn with_quorum_grace(mut self, grace: Duration) -> Self {
        self.quorum_grace = grace;
        self
    }

    /// Route `query_single` through the batcher
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    /// Set the batch window, clamped to 1..=1000 ms
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window.clamp(MIN_BATCH_WINDOW, MAX_BATCH_WINDOW);
        self
    }

    /// Set the per-batch EOSE cap
    pub fn with_batch_eose_timeout(mut self, timeout: Duration) -> Self {
        self.batch_eose_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable the NIP-11 fetch after connect
    pub fn with_fetch_nip11(mut self, enabled: bool) -> Self {
        self.fetch_nip11 = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert!(!config.test_mode);
        assert_eq!(config.sub_events_capacity, 4096);
        assert_eq!(config.sub_eose_capacity, 1);
        assert_eq!(config.dedup_capacity.get(), 65_536);
        assert_eq!(config.quorum_grace, Duration::from_secs(2));
        assert_eq!(config.batch_window, Duration::from_millis(75));
        assert_eq!(config.spin.iters, 20);
        assert_eq!(config.spin.pause, Duration::from_micros(10));
        assert!(config.brown_list.enabled);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn env_overlay_applies_every_variable() {
        let config = Config::default().apply_env(lookup(&[
            ("NOSTR_TEST_MODE", "1"),
            ("NOSTR_SUB_EVENTS_CAP", "8"),
            ("NOSTR_SUB_EOSE_CAP", "2"),
            ("NOSTR_SIMPLE_POOL_ONESHOT", "1"),
            ("NOSTR_SIMPLE_POOL_AUTO_UNSUB_EOSE", "1"),
            ("NOSTR_SIMPLE_POOL_DISCONNECT", "1"),
            ("NOSTR_SPIN_ITERS", "0"),
            ("NOSTR_SPIN_US", "50"),
            ("NOSTR_BROWN_LIST_ENABLED", "0"),
            ("NOSTR_CHAN_DEBUG", "1"),
        ]));
        assert!(config.test_mode);
        assert_eq!(config.sub_events_capacity, 8);
        assert_eq!(config.sub_eose_capacity, 2);
        assert!(config.query_oneshot);
        assert!(config.auto_unsub_on_eose);
        assert!(config.disconnect_on_stop);
        assert_eq!(config.spin.iters, 0);
        assert_eq!(config.spin.pause, Duration::from_micros(50));
        assert!(!config.brown_list.enabled);
        assert!(config.channel_debug);
    }

    #[test]
    fn garbage_env_values_are_ignored() {
        let config = Config::default().apply_env(lookup(&[
            ("NOSTR_SUB_EVENTS_CAP", "lots"),
            ("NOSTR_SUB_EOSE_CAP", "0"),
        ]));
        assert_eq!(config.sub_events_capacity, DEFAULT_SUB_EVENTS_CAPACITY);
        assert_eq!(config.sub_eose_capacity, DEFAULT_SUB_EOSE_CAPACITY);
    }

    #[test]
    fn batch_window_is_clamped() {
        let config = Config::default().with_batch_window(Duration::from_secs(5));
        assert_eq!(config.batch_window, MAX_BATCH_WINDOW);
        let config = Config::default().with_batch_window(Duration::ZERO);
        assert_eq!(config.batch_window, MIN_BATCH_WINDOW);
    }
}
