//! Relay pool
//!
//! A [`Pool`] owns a set of relays and a set of long-lived subscriptions.
//! One worker task multiplexes every subscription's channels and hands
//! events to the configured middleware. One-shot queries go through
//! [`Pool::query_single`], which consults an optional local cache first
//! and tolerates relays that never answer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::batcher::QueryBatcher;
use crate::brown_list::{BrownList, BrownListStats};
use crate::channel::{Channel, Select, TryRecvError};
use crate::config::Config;
use crate::context::{CancelHandle, Context};
use crate::error::Result;
use crate::event::Event;
use crate::filter::{Filter, Filters};
use crate::metrics::{Counter, Metrics};
use crate::relay::{Relay, normalize_url};
use crate::sub_registry::{QueueMetrics, SubRegistry};
use crate::subscription::{Subscription, SubscriptionOptions};

/// How long `stop()` waits for pool subscriptions to finish closing.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a cancelled batched query waits for in-flight batches.
const CANCEL_DRAIN: Duration = Duration::from_millis(50);

pub type EventMiddleware = Arc<dyn Fn(Event) + Send + Sync>;
pub type BatchMiddleware = Arc<dyn Fn(Vec<Event>) + Send + Sync>;
pub type EventSink = Arc<dyn Fn(&[Event]) + Send + Sync>;
pub type CacheQuery = Arc<dyn Fn(&Filters) -> Vec<Event> + Send + Sync>;

static NEXT_POOL: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Hooks {
    event_middleware: Option<EventMiddleware>,
    batch_middleware: Option<BatchMiddleware>,
    event_sink: Option<EventSink>,
    cache_query: Option<CacheQuery>,
}

#[derive(Clone)]
struct PoolSub {
    handle: u64,
    sub: Subscription,
    unique: bool,
}

/// The context pool subscriptions run under. `stop()` cancels it and
/// installs a fresh one so the pool can be started again.
struct Session {
    ctx: Context,
    cancel: CancelHandle,
}

impl Session {
    fn new() -> Self {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        Self { ctx, cancel }
    }
}

struct PoolInner {
    label: String,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    relays: Mutex<HashMap<String, Relay>>,
    subs: Mutex<Vec<PoolSub>>,
    seen: Mutex<LruCache<String, ()>>,
    hooks: Mutex<Hooks>,
    brown_list: BrownList,
    batcher: Option<QueryBatcher>,
    auto_unsub_on_eose: AtomicBool,
    session: Mutex<Session>,
    wake: Channel<()>,
    running: AtomicBool,
    epoch: AtomicU64,
    stopped: watch::Sender<bool>,
    next_handle: AtomicU64,
}

/// Handle for a fan-out subscription made through [`Pool::subscribe`].
#[derive(Debug, Clone)]
pub struct PoolSubscription {
    handle: u64,
    subs: Vec<Subscription>,
}

impl PoolSubscription {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Per-relay subscriptions; relays that were skipped or failed are absent.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subs
    }

    pub fn relay_count(&self) -> usize {
        self.subs.len()
    }
}

/// A set of relays plus the subscriptions fanned out over them.
/// Clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.inner.label)
            .field("relays", &self.inner.relays.lock().len())
            .field("subscriptions", &self.inner.subs.lock().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Pool {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_metrics(config, Metrics::global())
    }

    pub fn with_metrics(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        let batcher = config
            .batching
            .then(|| QueryBatcher::new(&config, metrics.clone()));
        let (stopped, _) = watch::channel(true);
        Self {
            inner: Arc::new(PoolInner {
                label: format!("pool-{}", NEXT_POOL.fetch_add(1, Ordering::Relaxed)),
                brown_list: BrownList::new(config.brown_list),
                seen: Mutex::new(LruCache::new(config.dedup_capacity)),
                auto_unsub_on_eose: AtomicBool::new(config.auto_unsub_on_eose),
                relays: Mutex::new(HashMap::new()),
                subs: Mutex::new(Vec::new()),
                hooks: Mutex::new(Hooks::default()),
                batcher,
                session: Mutex::new(Session::new()),
                wake: Channel::bounded(1),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                stopped,
                next_handle: AtomicU64::new(1),
                config,
                metrics,
            }),
        }
    }

    /// Registry group every pool subscription is tagged with
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // -- relays --

    /// Returns a connected relay for `url`, creating and connecting it on
    /// first use. `Ok(None)` means the brown list skipped it; no I/O was
    /// attempted.
    pub async fn ensure_relay(&self, url: &str) -> Result<Option<Relay>> {
        let url = normalize_url(url)?;
        let inner = &self.inner;
        if inner.brown_list.should_skip(&url) {
            inner.metrics.incr(Counter::PoolRelayBrownedSkip);
            tracing::debug!(url = %url, "skipping browned relay");
            return Ok(None);
        }

        let relay = inner.relay_for(&url)?;
        if relay.is_connected() {
            return Ok(Some(relay));
        }
        // The brown list gates pool connects, so the relay's own backoff
        // window must not swallow attempts it should be counting.
        match relay.connect_now().await {
            Ok(()) => {
                inner.brown_list.record_success(&url);
                inner.update_connected_count();
                Ok(Some(relay))
            }
            Err(err) => {
                inner.update_connected_count();
                inner.brown_list.record_failure(&url);
                tracing::debug!(url = %url, error = %err, "relay connect failed");
                Err(err)
            }
        }
    }

    /// Adds an externally constructed relay. Returns false when the pool
    /// already holds one for the same URL.
    pub fn add_relay(&self, relay: Relay) -> bool {
        let mut relays = self.inner.relays.lock();
        if relays.contains_key(relay.url()) {
            return false;
        }
        relays.insert(relay.url().to_string(), relay);
        true
    }

    /// Drops the pool's handle on `url`. Pool subscriptions pinned to it
    /// close with `"relay removed"`.
    pub fn remove_relay(&self, url: &str) -> bool {
        let Ok(url) = normalize_url(url) else {
            return false;
        };
        self.inner.remove_relay(&url)
    }

    /// Makes the relay set equal to `urls` without touching survivors.
    pub fn sync_relays<S: AsRef<str>>(&self, urls: &[S]) -> Result<()> {
        let wanted = urls
            .iter()
            .map(|u| normalize_url(u.as_ref()))
            .collect::<Result<HashSet<String>>>()?;
        let stale: Vec<String> = self
            .inner
            .relays
            .lock()
            .keys()
            .filter(|url| !wanted.contains(*url))
            .cloned()
            .collect();
        for url in &stale {
            self.inner.remove_relay(url);
        }
        for url in &wanted {
            self.inner.relay_for(url)?;
        }
        tracing::debug!(pool = %self.inner.label, removed = stale.len(), total = wanted.len(), "relays synced");
        Ok(())
    }

    pub fn relays(&self) -> Vec<Relay> {
        let mut relays: Vec<Relay> = self.inner.relays.lock().values().cloned().collect();
        relays.sort_by(|a, b| a.url().cmp(b.url()));
        relays
    }

    pub fn relay(&self, url: &str) -> Option<Relay> {
        let url = normalize_url(url).ok()?;
        self.inner.relays.lock().get(&url).cloned()
    }

    pub fn disconnect_all(&self) {
        let relays: Vec<Relay> = self.inner.relays.lock().values().cloned().collect();
        for relay in relays {
            relay.disconnect();
        }
        self.inner.update_connected_count();
    }

    // -- worker --

    /// Starts the worker task. Idempotent; must be called inside a runtime.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let epoch = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        inner.stopped.send_replace(false);
        let ctx = inner.session.lock().ctx.clone();
        let weak = Arc::downgrade(inner);
        let wake = inner.wake.clone();
        let label = inner.label.clone();
        tokio::spawn(async move {
            tracing::debug!(pool = %label, "pool worker started");
            run_worker(weak.clone(), ctx, wake).await;
            // A restart after stop() owns the flags from here on.
            if let Some(inner) = weak.upgrade()
                && inner.epoch.load(Ordering::Acquire) == epoch
            {
                inner.stopped.send_replace(true);
            }
            tracing::debug!(pool = %label, "pool worker stopped");
        });
    }

    /// Stops the worker and closes every pool subscription with CLOSED
    /// `"cancelled"`. Returns at
    /// once; the cleanup (and the disconnect when `disconnect_on_stop` is
    /// set) runs on the runtime. See [`Pool::stopped`].
    pub fn stop(&self) {
        let inner = &self.inner;
        let session = std::mem::replace(&mut *inner.session.lock(), Session::new());
        session.cancel.cancel();
        inner.running.store(false, Ordering::Release);
        let _ = inner.wake.try_send(());

        let subs: Vec<PoolSub> = std::mem::take(&mut *inner.subs.lock());
        inner.metrics.add(Counter::PoolSubRemoved, subs.len() as u64);
        // Their parent context just ended.
        for entry in &subs {
            entry.sub.close_with_reason("cancelled");
        }
        let relays: Vec<Relay> = if inner.config.disconnect_on_stop {
            inner.relays.lock().values().cloned().collect()
        } else {
            Vec::new()
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            relays.iter().for_each(Relay::disconnect);
            return;
        };
        let metrics = inner.metrics.clone();
        let label = inner.label.clone();
        runtime.spawn(async move {
            let joined = join_all(subs.iter().map(|entry| entry.sub.joined()));
            match tokio::time::timeout(CLEANUP_TIMEOUT, joined).await {
                Ok(_) => metrics.incr(Counter::PoolCleanupSuccess),
                Err(_) => {
                    metrics.incr(Counter::PoolCleanupTimeout);
                    tracing::warn!(pool = %label, subs = subs.len(), "pool cleanup timed out");
                }
            }
            for relay in &relays {
                relay.disconnect();
            }
            if !relays.is_empty() {
                tracing::debug!(pool = %label, relays = relays.len(), "relays disconnected on stop");
            }
        });
    }

    /// Resolves once the worker task has exited (immediately if it never ran).
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    // -- subscriptions --

    /// Fans `filters` out to every URL. Relays that are browned or fail to
    /// connect are skipped. With `unique`, events already seen by the pool
    /// are dropped before middleware.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        urls: &[S],
        filters: impl Into<Filters>,
        unique: bool,
    ) -> Result<PoolSubscription> {
        let filters = filters.into();
        filters.validate()?;
        let inner = &self.inner;
        let handle = inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let ctx = inner.session.lock().ctx.clone();

        let mut subs = Vec::new();
        for url in urls {
            let url = url.as_ref();
            let relay = match self.ensure_relay(url).await {
                Ok(Some(relay)) => relay,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(url, error = %err, "relay unavailable for subscription");
                    continue;
                }
            };
            let options = SubscriptionOptions::persistent().with_group(inner.label.clone());
            match relay.subscribe_with(&ctx, filters.clone(), options) {
                Ok(sub) => {
                    inner.metrics.incr(Counter::PoolSubRegistered);
                    subs.push(sub);
                }
                Err(err) => tracing::warn!(url, error = %err, "subscribe failed"),
            }
        }

        inner.subs.lock().extend(subs.iter().map(|sub| PoolSub {
            handle,
            sub: sub.clone(),
            unique,
        }));
        let _ = inner.wake.try_send(());
        Ok(PoolSubscription { handle, subs })
    }

    /// Closes and forgets every relay subscription behind `sub`.
    pub fn unsubscribe(&self, sub: &PoolSubscription) {
        let removed: Vec<PoolSub> = {
            let mut subs = self.inner.subs.lock();
            let (removed, kept) = std::mem::take(&mut *subs)
                .into_iter()
                .partition(|entry| entry.handle == sub.handle);
            *subs = kept;
            removed
        };
        self.inner
            .metrics
            .add(Counter::PoolSubRemoved, removed.len() as u64);
        for entry in &removed {
            entry.sub.close();
        }
        let _ = self.inner.wake.try_send(());
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().len()
    }

    // -- queries --

    /// One-shot query across `urls`.
    ///
    /// Ends when every relay has sent EOSE or CLOSED (or dropped), or once
    /// a strict majority sent EOSE and the quorum grace has passed.
    /// Cancelling `ctx` returns what arrived so far. Results are deduped
    /// by id, handed to the event sink and then to middleware.
    pub async fn query_single<S: AsRef<str>>(
        &self,
        ctx: &Context,
        urls: &[S],
        filter: Filter,
    ) -> Result<Vec<Event>> {
        filter.validate()?;
        let inner = &self.inner;

        let cache = inner.hooks.lock().cache_query.clone();
        if let Some(cache) = cache {
            let cached = cache(&Filters::from(filter.clone()));
            if !cached.is_empty() {
                tracing::debug!(events = cached.len(), "query answered from cache");
                return Ok(cached);
            }
        }

        let mut relays = Vec::new();
        for url in urls {
            let url = url.as_ref();
            match self.ensure_relay(url).await {
                Ok(Some(relay)) => relays.push(relay),
                Ok(None) => {}
                Err(err) => tracing::debug!(url, error = %err, "relay left out of query"),
            }
        }
        if relays.is_empty() {
            return Ok(Vec::new());
        }

        let events = match &inner.batcher {
            Some(batcher) => {
                query_batched(batcher, &relays, &filter, ctx, inner.config.quorum_grace).await
            }
            None => {
                let oneshot = inner.config.query_oneshot;
                query_direct(&relays, filter, ctx, inner.config.quorum_grace, oneshot).await
            }
        };

        let (sink, batch_mw, event_mw) = {
            let hooks = inner.hooks.lock();
            (
                hooks.event_sink.clone(),
                hooks.batch_middleware.clone(),
                hooks.event_mw(),
            )
        };
        if let Some(sink) = sink
            && !events.is_empty()
        {
            sink(&events);
        }
        if !events.is_empty() {
            deliver(batch_mw, event_mw, events.clone());
        }
        Ok(events)
    }

    // -- hooks --

    pub fn set_event_middleware(&self, middleware: impl Fn(Event) + Send + Sync + 'static) {
        self.inner.hooks.lock().event_middleware = Some(Arc::new(middleware));
    }

    /// Takes precedence over the per-event middleware when both are set.
    pub fn set_batch_middleware(&self, middleware: impl Fn(Vec<Event>) + Send + Sync + 'static) {
        self.inner.hooks.lock().batch_middleware = Some(Arc::new(middleware));
    }

    /// Receives the full result of every network query.
    pub fn set_event_sink(&self, sink: impl Fn(&[Event]) + Send + Sync + 'static) {
        self.inner.hooks.lock().event_sink = Some(Arc::new(sink));
    }

    /// Consulted before every query; a non-empty answer skips the network.
    pub fn set_cache_query(&self, query: impl Fn(&Filters) -> Vec<Event> + Send + Sync + 'static) {
        self.inner.hooks.lock().cache_query = Some(Arc::new(query));
    }

    pub fn clear_hooks(&self) {
        *self.inner.hooks.lock() = Hooks::default();
    }

    pub fn set_auto_unsub_on_eose(&self, enabled: bool) {
        self.inner.auto_unsub_on_eose.store(enabled, Ordering::Relaxed);
    }

    // -- brown list --

    pub fn set_brown_list_enabled(&self, enabled: bool) {
        self.inner.brown_list.set_enabled(enabled);
    }

    pub fn is_relay_browned(&self, url: &str) -> bool {
        normalize_url(url).is_ok_and(|url| self.inner.brown_list.should_skip(&url))
    }

    pub fn clear_relay_brown(&self, url: &str) -> bool {
        normalize_url(url).is_ok_and(|url| self.inner.brown_list.clear(&url))
    }

    pub fn brown_list_stats(&self) -> BrownListStats {
        self.inner.brown_list.stats()
    }

    pub fn brown_list(&self) -> &BrownList {
        &self.inner.brown_list
    }

    /// Queue health of this pool's subscriptions
    pub fn queue_metrics(&self) -> QueueMetrics {
        SubRegistry::global().queue_metrics(Some(&self.inner.label))
    }

    pub fn batcher(&self) -> Option<&QueryBatcher> {
        self.inner.batcher.as_ref()
    }
}

impl Hooks {
    /// The per-event middleware, or None when batch middleware shadows it.
    fn event_mw(&self) -> Option<EventMiddleware> {
        if self.batch_middleware.is_some() {
            None
        } else {
            self.event_middleware.clone()
        }
    }
}

fn deliver(batch: Option<BatchMiddleware>, single: Option<EventMiddleware>, events: Vec<Event>) {
    if let Some(batch) = batch {
        batch(events);
    } else if let Some(single) = single {
        for event in events {
            single(event);
        }
    }
}

impl PoolInner {
    /// Pool's handle for `url`, creating the shared relay if needed.
    fn relay_for(&self, url: &str) -> Result<Relay> {
        if let Some(relay) = self.relays.lock().get(url) {
            return Ok(relay.clone());
        }
        // Shared relays outlive any one pool, so they hang off the background context.
        let relay = Relay::get_or_create_with(
            &Context::background(),
            url,
            self.config.clone(),
            self.metrics.clone(),
        )?;
        Ok(self
            .relays
            .lock()
            .entry(url.to_string())
            .or_insert(relay)
            .clone())
    }

    fn remove_relay(&self, url: &str) -> bool {
        let Some(relay) = self.relays.lock().remove(url) else {
            return false;
        };
        let pinned: Vec<PoolSub> = {
            let mut subs = self.subs.lock();
            let (pinned, kept) = std::mem::take(&mut *subs)
                .into_iter()
                .partition(|entry| entry.sub.relay().same_relay(&relay));
            *subs = kept;
            pinned
        };
        self.metrics.add(Counter::PoolSubRemoved, pinned.len() as u64);
        for entry in &pinned {
            entry.sub.close_with_reason("relay removed");
        }
        drop(pinned);
        if relay.handle_count() == 1 {
            relay.disconnect();
        }
        let _ = self.wake.try_send(());
        self.update_connected_count();
        tracing::debug!(url, "relay removed from pool");
        true
    }

    fn update_connected_count(&self) {
        let connected = self.relays.lock().values().filter(|r| r.is_connected()).count();
        self.brown_list.set_connected_count(connected);
    }

    fn drop_sub(&self, target: &Subscription) {
        let mut subs = self.subs.lock();
        let before = subs.len();
        subs.retain(|entry| !entry.sub.same_subscription(target));
        if subs.len() < before {
            self.metrics.incr(Counter::PoolSubRemoved);
        }
    }

    /// Dedups (when asked) and hands a batch to middleware.
    fn dispatch(&self, unique: bool, mut events: Vec<Event>) {
        if unique {
            let mut seen = self.seen.lock();
            events.retain(|event| seen.put(event.id.clone(), ()).is_none());
        }
        if events.is_empty() {
            return;
        }
        let (batch, single) = {
            let hooks = self.hooks.lock();
            (hooks.batch_middleware.clone(), hooks.event_mw())
        };
        deliver(batch, single, events);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.session.get_mut().cancel.cancel();
        for entry in self.subs.get_mut().drain(..) {
            entry.sub.close();
        }
        if let Some(batcher) = &self.batcher {
            batcher.shutdown();
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Events,
    Eose,
    Closed,
}

async fn run_worker(weak: Weak<PoolInner>, ctx: Context, wake: Channel<()>) {
    loop {
        let snapshot = match weak.upgrade() {
            Some(inner) => inner.subs.lock().clone(),
            None => return,
        };
        let mut cases = Vec::with_capacity(snapshot.len() * 3);
        let ready = {
            let mut select = Select::new();
            let done = select.recv(ctx.done());
            let woken = select.recv(&wake);
            for (i, entry) in snapshot.iter().enumerate() {
                select.recv(entry.sub.events());
                cases.push((i, Signal::Events));
                select.recv(entry.sub.eose());
                cases.push((i, Signal::Eose));
                select.recv(entry.sub.closed());
                cases.push((i, Signal::Closed));
            }
            let index = select.ready().await;
            if index == done {
                return;
            }
            if index == woken {
                while wake.try_recv().is_ok() {}
                continue;
            }
            index - 2
        };

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let (i, signal) = cases[ready];
        let entry = &snapshot[i];
        match signal {
            Signal::Events => {
                let (events, closed) = drain(entry.sub.events());
                inner.dispatch(entry.unique, events);
                if closed {
                    inner.drop_sub(&entry.sub);
                }
            }
            Signal::Eose => {
                let (events, _) = drain(entry.sub.events());
                inner.dispatch(entry.unique, events);
                match entry.sub.eose().try_recv() {
                    Ok(()) if inner.auto_unsub_on_eose.load(Ordering::Relaxed) => {
                        inner.drop_sub(&entry.sub);
                        entry.sub.close();
                    }
                    Ok(()) | Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Closed) => inner.drop_sub(&entry.sub),
                }
            }
            Signal::Closed => {
                let (events, _) = drain(entry.sub.events());
                inner.dispatch(entry.unique, events);
                if let Ok(reason) = entry.sub.closed().try_recv() {
                    tracing::debug!(sub_id = entry.sub.id(), reason = %reason, "pool subscription closed by relay");
                }
                inner.drop_sub(&entry.sub);
            }
        }
    }
}

/// Takes everything buffered; the flag says the channel is closed and empty.
fn drain(channel: &Channel<Event>) -> (Vec<Event>, bool) {
    let mut events = Vec::new();
    loop {
        match channel.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) => return (events, false),
            Err(TryRecvError::Closed) => return (events, true),
        }
    }
}

fn merge_unique(into: &mut Vec<Event>, seen: &mut HashSet<String>, events: Vec<Event>) {
    for event in events {
        if seen.insert(event.id.clone()) {
            into.push(event);
        }
    }
}

/// Runs one batcher query per relay. Once a strict majority has finished,
/// stragglers get `grace` before they are abandoned.
async fn query_batched(
    batcher: &QueryBatcher,
    relays: &[Relay],
    filter: &Filter,
    ctx: &Context,
    grace: Duration,
) -> Vec<Event> {
    let (qctx, qcancel) = Context::with_cancel(ctx);
    let total = relays.len();
    let mut pending: FuturesUnordered<_> = relays
        .iter()
        .map(|relay| {
            let qctx = &qctx;
            async move { (relay.url(), batcher.query(relay, filter.clone(), qctx).await) }
        })
        .collect();

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut done = 0usize;
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut caller_cancelled = false;
    loop {
        let cutoff = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            next = pending.next() => {
                let Some((url, result)) = next else {
                    break;
                };
                done += 1;
                match result {
                    Ok(events) => merge_unique(&mut out, &mut seen, events),
                    Err(err) => tracing::debug!(url, error = %err, "batched query failed"),
                }
                if deadline.is_none() && done < total && done * 2 > total {
                    tracing::debug!(done, total, "batched query reached quorum");
                    deadline = Some(tokio::time::Instant::now() + grace);
                }
            }
            _ = ctx.cancelled(), if !caller_cancelled => {
                // Batches whose requesters all cancelled end on their own
                // with what they received.
                caller_cancelled = true;
                qcancel.cancel();
                let drain = tokio::time::Instant::now() + CANCEL_DRAIN;
                deadline = Some(deadline.map_or(drain, |at| at.min(drain)));
            }
            _ = cutoff => {
                tracing::debug!(done, total, "batched query grace expired");
                break;
            }
        }
    }
    qcancel.cancel();
    out
}

async fn query_direct(
    relays: &[Relay],
    filter: Filter,
    ctx: &Context,
    grace: Duration,
    oneshot: bool,
) -> Vec<Event> {
    let (qctx, qcancel) = Context::with_cancel(ctx);
    let filters = Filters::from(filter);
    let subs: Vec<Subscription> = relays
        .iter()
        .filter_map(|relay| {
            relay
                .subscribe_with(&qctx, filters.clone(), SubscriptionOptions::ephemeral())
                .inspect_err(|err| tracing::debug!(url = relay.url(), error = %err, "query REQ failed"))
                .ok()
        })
        .collect();

    let total = subs.len();
    let mut finished = vec![false; total];
    let mut eose_count = 0usize;
    let mut quorum_at: Option<Instant> = None;
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    while finished.iter().any(|f| !f) {
        if oneshot && (eose_count > 0 || !out.is_empty()) {
            break;
        }
        let mut cases = Vec::with_capacity(total * 3);
        let ready = {
            let mut select = Select::new();
            let done = select.recv(ctx.done());
            for (i, sub) in subs.iter().enumerate() {
                if finished[i] {
                    continue;
                }
                select.recv(sub.events());
                cases.push((i, Signal::Events));
                select.recv(sub.eose());
                cases.push((i, Signal::Eose));
                select.recv(sub.closed());
                cases.push((i, Signal::Closed));
            }
            let index = match quorum_at {
                Some(at) => {
                    let left = grace.saturating_sub(at.elapsed());
                    match select.ready_timeout(left).await {
                        Some(index) => index,
                        None => {
                            tracing::debug!(eose_count, total, "quorum grace elapsed");
                            break;
                        }
                    }
                }
                None => select.ready().await,
            };
            if index == done {
                tracing::debug!(events = out.len(), "query cancelled; returning partial results");
                break;
            }
            index - 1
        };

        let (i, signal) = cases[ready];
        let sub = &subs[i];
        let (events, closed) = drain(sub.events());
        merge_unique(&mut out, &mut seen, events);
        match signal {
            Signal::Events => finished[i] = closed,
            Signal::Eose => {
                if sub.eose().try_recv().is_ok() {
                    eose_count += 1;
                    if quorum_at.is_none() && eose_count * 2 > total {
                        quorum_at = Some(Instant::now());
                    }
                }
                finished[i] = true;
            }
            Signal::Closed => finished[i] = true,
        }
    }

    for sub in &subs {
        let (events, _) = drain(sub.events());
        merge_unique(&mut out, &mut seen, events);
        sub.close();
    }
    qcancel.cancel();
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::mock::{MockConfig, MockRelay};

    fn pool() -> Pool {
        let config = Config::default()
            .with_test_mode(true)
            .with_assume_valid(true)
            .with_auto_reconnect(false);
        Pool::with_metrics(Arc::new(config), Arc::new(Metrics::new()))
    }

    fn note(n: u8) -> Event {
        Event {
            id: format!("{n:064x}"),
            pubkey: "1".repeat(64),
            created_at: 1_700_000_000 + n as u64,
            kind: 1,
            tags: Vec::new(),
            content: format!("pool note {n}"),
            sig: "2".repeat(128),
        }
    }

    fn events(n: u8) -> Vec<Event> {
        (0..n).map(note).collect()
    }

    #[test]
    fn batch_middleware_shadows_event_middleware() {
        let pool = pool();
        let singles = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(AtomicUsize::new(0));
        let s = singles.clone();
        pool.set_event_middleware(move |_| {
            s.fetch_add(1, Ordering::Relaxed);
        });
        pool.inner.dispatch(false, events(2));
        assert_eq!(singles.load(Ordering::Relaxed), 2);

        let b = batches.clone();
        pool.set_batch_middleware(move |batch| {
            b.fetch_add(batch.len(), Ordering::Relaxed);
        });
        pool.inner.dispatch(false, events(3));
        assert_eq!(batches.load(Ordering::Relaxed), 3);
        assert_eq!(singles.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unique_drops_seen_ids() {
        let pool = pool();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        pool.set_event_middleware(move |event| g.lock().push(event.id));
        let batch = events(2);
        pool.inner.dispatch(true, batch.clone());
        pool.inner.dispatch(true, batch.clone());
        assert_eq!(got.lock().len(), 2);
        pool.inner.dispatch(false, batch);
        assert_eq!(got.lock().len(), 4);
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let pool = pool();
        let cached = events(1);
        let answer = cached.clone();
        pool.set_cache_query(move |_| answer.clone());
        let ctx = Context::background();
        // Unreachable URL: a network attempt would fail, not return the cached event.
        let got = pool
            .query_single(&ctx, &["ws://cache-only.invalid"], Filter::new().kind(1))
            .await
            .unwrap();
        assert_eq!(got, cached);
        assert!(pool.relays().is_empty());
    }

    #[tokio::test]
    async fn query_feeds_sink_and_dedups_across_relays() {
        let a = MockRelay::start("ws://pool-sink-a.mock", MockConfig::default()).unwrap();
        let b = MockRelay::start("ws://pool-sink-b.mock", MockConfig::default()).unwrap();
        let fixtures = events(3);
        a.seed(fixtures.clone());
        b.seed(fixtures[..2].to_vec());

        let pool = pool();
        let sunk = Arc::new(AtomicUsize::new(0));
        let s = sunk.clone();
        pool.set_event_sink(move |events| {
            s.fetch_add(events.len(), Ordering::Relaxed);
        });
        let ctx = Context::background();
        let got = pool
            .query_single(&ctx, &[a.url(), b.url()], Filter::new().kind(1))
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(sunk.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn worker_delivers_and_auto_unsubs_on_eose() {
        let relay = MockRelay::start("ws://pool-worker.mock", MockConfig::default()).unwrap();
        relay.seed(events(2));
        let pool = pool();
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        pool.set_event_middleware(move |_| {
            g.fetch_add(1, Ordering::Relaxed);
        });
        pool.set_auto_unsub_on_eose(true);
        pool.start();

        let handle = pool
            .subscribe(&[relay.url()], Filter::new().kind(1), true)
            .await
            .unwrap();
        assert_eq!(handle.relay_count(), 1);
        for _ in 0..100 {
            if pool.subscription_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(got.load(Ordering::Relaxed), 2);
        assert_eq!(pool.subscription_count(), 0);
        assert_eq!(pool.metrics().get(Counter::PoolSubRemoved), 1);

        pool.stop();
        pool.stopped().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn sync_relays_closes_pinned_subscriptions() {
        let a = MockRelay::start("ws://pool-sync-a.mock", MockConfig::default()).unwrap();
        let b = MockRelay::start("ws://pool-sync-b.mock", MockConfig::default()).unwrap();
        let pool = pool();
        let handle = pool
            .subscribe(&[a.url(), b.url()], Filter::new().kind(1), false)
            .await
            .unwrap();
        assert_eq!(pool.relays().len(), 2);

        pool.sync_relays(&[b.url()]).unwrap();
        assert_eq!(pool.relays().len(), 1);
        let on_a = handle
            .subscriptions()
            .iter()
            .find(|s| s.relay().url() == a.url())
            .unwrap();
        assert_eq!(on_a.closed().try_recv().unwrap(), "relay removed");
        assert_eq!(pool.subscription_count(), 1);
    }

    #[tokio::test]
    async fn browned_relay_is_skipped() {
        let pool = pool();
        pool.set_brown_list_enabled(true);
        for _ in 0..pool.brown_list().config().threshold {
            pool.brown_list().record_failure("ws://pool-brown.mock");
        }
        assert!(pool.is_relay_browned("ws://pool-brown.mock/"));
        assert!(pool.ensure_relay("ws://pool-brown.mock").await.unwrap().is_none());
        assert_eq!(pool.metrics().get(Counter::PoolRelayBrownedSkip), 1);
        assert!(pool.clear_relay_brown("ws://pool-brown.mock"));
        assert!(!pool.is_relay_browned("ws://pool-brown.mock"));
    }
}
