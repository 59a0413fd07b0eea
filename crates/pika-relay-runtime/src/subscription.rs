//! One REQ on one relay
//!
//! A [`Subscription`] moves through
//! `Pending → Active → EoseReceived → Closed`, or `Pending → Error` when
//! [`Subscription::fire`] is refused. Deliveries land on three channels:
//!
//! - `events`: bounded; when full the newest event is dropped and counted,
//!   the dispatcher never waits.
//! - `eose`: signalled once stored events are exhausted.
//! - `closed`: the reason, from a relay CLOSED or a local teardown.
//!
//! Closing is immediate and idempotent. Values already buffered stay
//! readable; [`Subscription::joined`] resolves once teardown is done.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::channel::{Channel, ChannelOptions, TrySendError};
use crate::context::{CancelHandle, Context};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filters;
use crate::metrics::{Counter, Metrics};
use crate::relay::Relay;
use crate::sub_registry::{QueueProbe, QueueStats, RegistrationId, SubKind};

static NEXT_ID: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(rand::random::<u32>() as u64));

/// Fresh wire id such as `sub_000000003a1f09c2`.
pub(crate) fn next_request_id(prefix: &str) -> String {
    format!("{prefix}_{:016x}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubState {
    Pending = 0,
    Active = 1,
    EoseReceived = 2,
    Closed = 3,
    Error = 4,
}

impl SubState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::EoseReceived,
            3 => Self::Closed,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::EoseReceived => "eose",
            Self::Closed => "closed",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub kind: SubKind,
    /// Registry group, used for per-pool queue metrics
    pub group: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            kind: SubKind::Persistent,
            group: None,
        }
    }
}

impl SubscriptionOptions {
    /// Closed on connection loss, never re-sent
    pub fn ephemeral() -> Self {
        Self {
            kind: SubKind::Ephemeral,
            group: None,
        }
    }

    pub fn persistent() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

type StateCallback = Arc<dyn Fn(SubState) + Send + Sync>;

pub(crate) struct SubInner {
    id: String,
    relay: Relay,
    filters: Arc<Filters>,
    ctx: Context,
    cancel: CancelHandle,
    kind: SubKind,
    group: Option<String>,
    events: Channel<Event>,
    eose: Channel<()>,
    closed: Channel<String>,
    state: AtomicU8,
    events_dropped: AtomicU64,
    registration: Mutex<Option<RegistrationId>>,
    on_state: Mutex<Option<StateCallback>>,
    joined: watch::Sender<bool>,
    metrics: Arc<Metrics>,
}

/// Handle to a subscription. Clones share it; dropping the last one
/// closes it.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("relay", &self.inner.relay.url())
            .field("state", &self.state())
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        relay: Relay,
        parent: &Context,
        filters: Arc<Filters>,
        options: SubscriptionOptions,
    ) -> Self {
        let config = Arc::clone(relay.config());
        let metrics = Arc::clone(relay.metrics());
        let (ctx, cancel) = Context::with_cancel(parent);
        let options_for = |label: &'static str| {
            ChannelOptions::from_config(&config, Arc::clone(&metrics), label)
        };
        let (joined, _) = watch::channel(false);
        Self {
            inner: Arc::new(SubInner {
                id: next_request_id("sub"),
                filters,
                ctx,
                cancel,
                kind: options.kind,
                group: options.group,
                events: Channel::with_options(config.sub_events_capacity, options_for("sub-events")),
                eose: Channel::with_options(config.sub_eose_capacity, options_for("sub-eose")),
                closed: Channel::with_options(1, options_for("sub-closed")),
                state: AtomicU8::new(SubState::Pending as u8),
                events_dropped: AtomicU64::new(0),
                registration: Mutex::new(None),
                on_state: Mutex::new(None),
                joined,
                metrics,
                relay,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn relay(&self) -> &Relay {
        &self.inner.relay
    }

    pub fn filters(&self) -> &Arc<Filters> {
        &self.inner.filters
    }

    pub fn kind(&self) -> SubKind {
        self.inner.kind
    }

    pub fn group(&self) -> Option<&str> {
        self.inner.group.as_deref()
    }

    pub fn state(&self) -> SubState {
        self.inner.state()
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn events(&self) -> &Channel<Event> {
        &self.inner.events
    }

    pub fn eose(&self) -> &Channel<()> {
        &self.inner.eose
    }

    pub fn closed(&self) -> &Channel<String> {
        &self.inner.closed
    }

    /// Events discarded because `events` was full
    pub fn events_dropped(&self) -> u64 {
        self.inner.events_dropped.load(Ordering::Relaxed)
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueProbe::queue_stats(&*self.inner)
    }

    /// Called on every state change, never under a lock.
    pub fn set_state_callback(&self, callback: impl Fn(SubState) + Send + Sync + 'static) {
        *self.inner.on_state.lock() = Some(Arc::new(callback));
    }

    /// Sends the REQ. Never waits: refusals come back as errors and leave
    /// the subscription in [`SubState::Error`].
    pub fn fire(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        if state != SubState::Pending {
            return Err(Error::InvalidState(format!(
                "subscription {} is {state}, not pending",
                inner.id
            )));
        }
        if inner.ctx.is_cancelled() {
            inner.transition(SubState::Pending, SubState::Error);
            return Err(Error::Cancelled);
        }
        if let Err(err) = inner.relay.inner.start_subscription(&self.inner) {
            inner.transition(SubState::Pending, SubState::Error);
            tracing::debug!(url = %inner.relay.url(), sub_id = %inner.id, %err, "subscription refused");
            return Err(err);
        }
        self.activate();
        Ok(())
    }

    /// Registers a subscription whose REQ is already on the wire.
    fn activate(&self) {
        let inner = &self.inner;
        {
            let mut registration = inner.registration.lock();
            // A CLOSED from the relay can land before we register; the REQ
            // went out and the subscription already ended normally.
            if inner.state() == SubState::Closed {
                tracing::debug!(sub_id = %inner.id, "closed by relay before activation");
                return;
            }
            let probe: Arc<dyn QueueProbe> = self.inner.clone();
            *registration = Some(inner.relay.inner.registry().register(
                inner.relay.url(),
                &inner.id,
                inner.kind,
                inner.group.as_deref(),
                Arc::downgrade(&probe),
            ));
        }
        // An EOSE may already have moved us past Active.
        inner.transition(SubState::Pending, SubState::Active);
        tracing::debug!(url = %inner.relay.url(), sub_id = %inner.id, "REQ sent");

        watch_cancel(Arc::downgrade(&self.inner), inner.ctx.clone());
    }

    /// Sends CLOSE when live and tears down. Returns immediately.
    pub fn close(&self) {
        self.inner.shutdown(true, None);
    }

    pub fn unsubscribe(&self) {
        self.close();
    }

    /// Local teardown that also posts `reason` on `closed`.
    pub fn close_with_reason(&self, reason: impl Into<String>) {
        self.inner.shutdown(true, Some(reason.into()));
    }

    /// Resolves once the subscription is closed and detached.
    pub async fn joined(&self) {
        let mut rx = self.inner.joined.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Receives events until EOSE, CLOSED or `ctx` ends, then drains what is
    /// buffered. Never fails; partial results are returned as-is.
    pub async fn collect(&self, ctx: &Context) -> Vec<Event> {
        let inner = &self.inner;
        let mut out = Vec::new();
        loop {
            tokio::select! {
                biased;
                event = inner.events.recv() => match event {
                    Ok(event) => out.push(event),
                    Err(_) => break,
                },
                _ = inner.eose.recv() => break,
                _ = inner.closed.recv() => break,
                _ = ctx.cancelled() => break,
            }
        }
        while let Ok(event) = inner.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub(crate) fn same_subscription(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SubInner {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn kind(&self) -> SubKind {
        self.kind
    }

    fn state(&self) -> SubState {
        SubState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn req_frame(&self) -> String {
        Envelope::Req {
            sub_id: self.id.clone(),
            filters: (*self.filters).clone(),
        }
        .to_json()
    }

    fn transition(&self, from: SubState, to: SubState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.notify(to);
        }
        moved
    }

    fn notify(&self, state: SubState) {
        let callback = self.on_state.lock().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    pub(crate) fn deliver_event(&self, event: Event) {
        if self.state() == SubState::Closed {
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => self.metrics.incr(Counter::SubscriptionsReceived),
            Err(TrySendError::Full(event)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr(Counter::EventsDropped);
                tracing::debug!(sub_id = %self.id, id = %event.id, "events queue full, dropping newest");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn deliver_eose(&self) {
        if !self.transition(SubState::Active, SubState::EoseReceived) {
            self.transition(SubState::Pending, SubState::EoseReceived);
        }
        let _ = self.eose.try_send(());
    }

    pub(crate) fn deliver_closed(&self, reason: String) {
        self.shutdown(false, Some(reason));
    }

    /// Idempotent teardown. `send_close` only matters while the REQ is live.
    pub(crate) fn shutdown(&self, send_close: bool, reason: Option<String>) {
        let prev = SubState::from_u8(self.state.swap(SubState::Closed as u8, Ordering::AcqRel));
        if prev == SubState::Closed {
            return;
        }
        let relay = &self.relay.inner;
        if send_close && matches!(prev, SubState::Active | SubState::EoseReceived) {
            relay.send_close(&self.id);
        }
        relay.detach(&self.id);
        if let Some(id) = self.registration.lock().take() {
            relay.registry().unregister(id);
        }
        if let Some(reason) = &reason {
            let _ = self.closed.try_send(reason.clone());
        }
        self.events.close();
        self.eose.close();
        self.closed.close();
        self.cancel.cancel();
        self.joined.send_replace(true);
        tracing::debug!(sub_id = %self.id, reason = reason.as_deref().unwrap_or("local"), "subscription closed");
        self.notify(SubState::Closed);
    }
}

/// Tears the subscription down with `"cancelled"` once `ctx` ends. The
/// subscription's own context ends on close, so the watcher never outlives it.
fn watch_cancel(weak: Weak<SubInner>, ctx: Context) {
    let fire = move || {
        if let Some(inner) = weak.upgrade() {
            inner.shutdown(true, Some("cancelled".to_string()));
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                ctx.cancelled().await;
                fire();
            });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("pika-sub-cancel".to_string())
                .spawn(move || {
                    let _ = ctx.done().recv_blocking();
                    fire();
                });
            if let Err(err) = spawned {
                tracing::warn!(%err, "failed to spawn subscription cancel watcher");
            }
        }
    }
}

impl QueueProbe for SubInner {
    fn queue_stats(&self) -> QueueStats {
        let stats = self.events.stats();
        QueueStats {
            enqueued: stats.enqueued,
            dequeued: stats.dequeued,
            dropped: self.events_dropped.load(Ordering::Relaxed),
            depth: stats.depth,
            capacity: stats.capacity,
            peak_depth: stats.peak_depth,
        }
    }
}

impl Drop for SubInner {
    fn drop(&mut self) {
        self.shutdown(true, None);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::filter::Filter;
    use crate::mock::{MockConfig, MockRelay};
    use crate::nip11::{RelayInformation, RelayLimitation};

    fn note(n: u8) -> Event {
        Event {
            id: format!("{n:064x}"),
            pubkey: "c".repeat(64),
            created_at: 1_700_000_000 + n as u64,
            kind: 1,
            tags: Vec::new(),
            content: String::new(),
            sig: "d".repeat(128),
        }
    }

    async fn connected(url: &str, mock_config: MockConfig, config: Config) -> (MockRelay, Relay) {
        let mock = MockRelay::start(url, mock_config).unwrap();
        let config = config
            .with_test_mode(true)
            .with_assume_valid(true)
            .with_auto_reconnect(false);
        let relay = Relay::new(&Context::background(), url, Arc::new(config)).unwrap();
        relay.connect().await.unwrap();
        (mock, relay)
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id("sub");
        let b = next_request_id("sub");
        assert_ne!(a, b);
        assert!(a.starts_with("sub_"));
        assert_eq!(a.len(), 4 + 16);
    }

    #[tokio::test]
    async fn fire_twice_is_rejected() {
        let (_mock, relay) =
            connected("ws://sub-twice.mock", MockConfig::default(), Config::default()).await;
        let sub = relay
            .prepare_subscription(&Context::background(), Filter::new().kind(1))
            .unwrap();
        assert_eq!(sub.state(), SubState::Pending);
        sub.fire().unwrap();
        assert!(matches!(sub.fire(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn fire_without_connection_errors() {
        let relay = Relay::new(
            &Context::background(),
            "ws://sub-offline.mock",
            Arc::new(Config::default().with_test_mode(true)),
        )
        .unwrap();
        let sub = relay
            .prepare_subscription(&Context::background(), Filter::new())
            .unwrap();
        assert_eq!(sub.fire(), Err(Error::NotConnected));
        assert_eq!(sub.state(), SubState::Error);
        sub.close();
        assert_eq!(sub.state(), SubState::Closed);
    }

    #[tokio::test]
    async fn relay_policy_is_enforced() {
        let info = RelayInformation {
            limitation: Some(RelayLimitation {
                auth_required: true,
                ..RelayLimitation::default()
            }),
            ..RelayInformation::default()
        };
        let (_mock, relay) = connected(
            "ws://sub-auth-policy.mock",
            MockConfig {
                info: Some(info),
                ..MockConfig::default()
            },
            Config::default(),
        )
        .await;
        let err = relay
            .subscribe(&Context::background(), Filter::new())
            .unwrap_err();
        assert_eq!(err, Error::AuthRequired);

        let limited = RelayInformation {
            limitation: Some(RelayLimitation {
                max_subscriptions: 1,
                ..RelayLimitation::default()
            }),
            ..RelayInformation::default()
        };
        relay.set_info(Some(limited));
        let first = relay.subscribe(&Context::background(), Filter::new()).unwrap();
        assert_eq!(
            relay
                .subscribe(&Context::background(), Filter::new())
                .unwrap_err(),
            Error::SubscriptionLimit(1)
        );
        first.close();
        relay.subscribe(&Context::background(), Filter::new()).unwrap();
    }

    #[tokio::test]
    async fn events_then_eose_in_order() {
        let (mock, relay) =
            connected("ws://sub-order.mock", MockConfig::default(), Config::default()).await;
        mock.seed([note(1), note(2), note(3)]);
        let sub = relay
            .subscribe(&Context::background(), Filter::new().kind(1).limit(10))
            .unwrap();
        sub.eose().recv().await.unwrap();
        assert_eq!(sub.state(), SubState::EoseReceived);
        let mut ids = Vec::new();
        while let Ok(event) = sub.events().try_recv() {
            ids.push(event.id);
        }
        assert_eq!(ids, vec![note(1).id, note(2).id, note(3).id]);
        assert_eq!(sub.events_dropped(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let (mock, relay) = connected(
            "ws://sub-full.mock",
            MockConfig::default(),
            Config::default().with_sub_events_capacity(1),
        )
        .await;
        mock.seed([note(1), note(2)]);
        let sub = relay.subscribe(&Context::background(), Filter::new()).unwrap();
        sub.eose().recv().await.unwrap();
        assert_eq!(sub.events().try_recv().unwrap().id, note(1).id);
        assert_eq!(sub.events_dropped(), 1);
        assert_eq!(sub.queue_stats().dropped, 1);
    }

    #[tokio::test]
    async fn relay_closed_is_terminal() {
        let (mock, relay) =
            connected("ws://sub-closed.mock", MockConfig::default(), Config::default()).await;
        let sub = relay.subscribe(&Context::background(), Filter::new()).unwrap();
        sub.eose().recv().await.unwrap();
        mock.inject_closed(sub.id(), "error: shutting down");
        assert_eq!(sub.closed().recv().await.unwrap(), "error: shutting down");
        sub.joined().await;
        assert_eq!(sub.state(), SubState::Closed);
        assert!(sub.events().recv().await.is_err());
        assert!(sub.eose().recv().await.is_err());
        assert_eq!(relay.subscription_count(), 0);
    }

    #[tokio::test]
    async fn cancelling_context_closes_with_reason() {
        let (mock, relay) =
            connected("ws://sub-cancel.mock", MockConfig::default(), Config::default()).await;
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let sub = relay.subscribe(&ctx, Filter::new()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sub.set_state_callback(move |s| log.lock().push(s));

        cancel.cancel();
        assert_eq!(sub.closed().recv().await.unwrap(), "cancelled");
        sub.joined().await;
        assert_eq!(seen.lock().last(), Some(&SubState::Closed));

        for _ in 0..50 {
            if mock.stats().close_received == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.stats().close_received, 1);
    }

    #[tokio::test]
    async fn closed_before_activation_is_not_an_error() {
        let (_mock, relay) =
            connected("ws://sub-early-closed.mock", MockConfig::default(), Config::default()).await;
        let sub = relay
            .prepare_subscription(&Context::background(), Filter::new())
            .unwrap();
        relay.inner.start_subscription(&sub.inner).unwrap();
        // What the dispatcher does on CLOSED.
        sub.inner.shutdown(false, Some("blocked: no REQs".to_string()));
        sub.activate();
        assert_eq!(sub.state(), SubState::Closed);
        assert_eq!(sub.closed().try_recv().unwrap(), "blocked: no REQs");
        assert_eq!(relay.inner.registry().count(relay.url()), 0);
    }

    #[test]
    fn cancel_closes_subscription_outside_a_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (_mock, relay) = rt.block_on(connected(
            "ws://sub-blocking-cancel.mock",
            MockConfig::default(),
            Config::default(),
        ));
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let sub = relay.prepare_subscription(&ctx, Filter::new()).unwrap();
        sub.fire().unwrap();

        cancel.cancel();
        assert_eq!(sub.closed().recv_blocking().unwrap(), "cancelled");
        assert_eq!(sub.state(), SubState::Closed);
    }

    #[tokio::test]
    async fn close_keeps_buffered_events() {
        let (mock, relay) =
            connected("ws://sub-drain.mock", MockConfig::default(), Config::default()).await;
        mock.seed([note(7)]);
        let sub = relay.subscribe(&Context::background(), Filter::new()).unwrap();
        sub.eose().recv().await.unwrap();
        sub.close();
        sub.joined().await;
        assert_eq!(sub.events().recv().await.unwrap().id, note(7).id);
        assert!(sub.events().recv().await.is_err());
    }
}
