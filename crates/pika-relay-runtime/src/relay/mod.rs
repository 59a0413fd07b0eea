//! Per-relay connection state machine
//!
//! A [`Relay`] owns at most one [`Connection`] and a dispatcher task that
//! turns incoming frames into subscription deliveries and callbacks.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!       ▲                         │                  │
//!       │                       error             lost/disconnect()
//!       │                         ▼                  │
//!       └──────window over─── Backoff ◀──────────────┘ (auto reconnect)
//! ```
//!
//! Relays are cheap handles over shared state. [`Relay::get_or_create`]
//! shares one instance per URL across the process so several pools reuse a
//! single socket.

mod backoff;
mod registry;
mod sig_guard;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use url::Url;

pub use self::backoff::Backoff;
pub use self::registry::{is_shared, shared_count};
pub use self::sig_guard::SigGuard;
use crate::config::Config;
use crate::connection::Connection;
use crate::context::{CancelHandle, Context};
use crate::envelope::{AuthPayload, CountPayload, Envelope};
use crate::error::{Error, Result};
use crate::event::{Event, EventSigner, EventTemplate};
use crate::filter::Filters;
use crate::metrics::{Counter, Metrics};
use crate::nip11::{self, RelayInformation};
use crate::sub_registry::{SubKind, SubRegistry};
use crate::subscription::{self, SubInner, Subscription, SubscriptionOptions};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Validates a relay URL and returns its canonical form.
///
/// Only `ws://` and `wss://` are accepted; a bare trailing `/` is dropped
/// so `wss://relay.example/` and `wss://relay.example` share one entry.
pub fn normalize_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim())?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(Error::InvalidUrl(format!("{url}: unsupported scheme {other}"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidUrl(format!("{url}: missing host")));
    }
    let mut out = parsed.to_string();
    if parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none() {
        out.truncate(out.trim_end_matches('/').len());
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        })
    }
}

/// Relay answer to a published event or AUTH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkStatus {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

type StateCallback = Arc<dyn Fn(RelayStatus) + Send + Sync>;
type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
type OkCallback = Arc<dyn Fn(&OkStatus) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    state: Option<StateCallback>,
    auth: Option<TextCallback>,
    notice: Option<TextCallback>,
    ok: Option<OkCallback>,
    custom: Option<TextCallback>,
}

struct RelayState {
    status: RelayStatus,
    conn: Option<Arc<Connection>>,
    /// Bumped whenever `conn` is replaced or dropped
    generation: u64,
    subs: HashMap<String, Weak<SubInner>>,
    info: Option<RelayInformation>,
    authenticated: bool,
    challenge: Option<String>,
    backoff: Backoff,
    pending_ok: HashMap<String, Vec<oneshot::Sender<OkStatus>>>,
    pending_count: HashMap<String, oneshot::Sender<Result<u64>>>,
    manual_disconnect: bool,
    reconnecting: bool,
}

pub(crate) struct RelayInner {
    url: String,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    ctx: Context,
    cancel: CancelHandle,
    state: Mutex<RelayState>,
    callbacks: Mutex<Callbacks>,
    sig_guard: SigGuard,
    assume_valid: AtomicBool,
    registry: &'static SubRegistry,
    shared: bool,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect: Arc<Notify>,
}

/// Handle to one relay. Clones share the connection.
#[derive(Clone)]
pub struct Relay {
    pub(crate) inner: Arc<RelayInner>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl Relay {
    /// Standalone relay; does not touch the network until [`Relay::connect`].
    pub fn new(ctx: &Context, url: &str, config: Arc<Config>) -> Result<Self> {
        Self::with_metrics(ctx, url, config, Metrics::global())
    }

    pub fn with_metrics(
        ctx: &Context,
        url: &str,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let url = normalize_url(url)?;
        Ok(Self {
            inner: RelayInner::new(ctx, url, config, metrics, false),
        })
    }

    /// Process-wide relay for `url`, created on first use.
    pub fn get_or_create(ctx: &Context, url: &str, config: Arc<Config>) -> Result<Self> {
        Self::get_or_create_with(ctx, url, config, Metrics::global())
    }

    /// Like [`Relay::get_or_create`]; `config` and `metrics` only apply when
    /// the relay is created here.
    pub fn get_or_create_with(
        ctx: &Context,
        url: &str,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let url = normalize_url(url)?;
        let inner = registry::get_or_insert_with(&url, || {
            RelayInner::new(ctx, url.clone(), config, metrics, true)
        });
        Ok(Self { inner })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn status(&self) -> RelayStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    /// Live handles, this one included
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Subscriptions currently attached
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .subs
            .values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    pub fn same_relay(&self, other: &Relay) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connects unless already connected.
    ///
    /// Inside a backoff window this fails with [`Error::Backoff`] without
    /// any I/O.
    pub async fn connect(&self) -> Result<()> {
        self.connect_inner(true).await
    }

    /// Connects right away even inside a backoff window. A failure still
    /// counts toward the backoff schedule.
    pub async fn connect_now(&self) -> Result<()> {
        self.connect_inner(false).await
    }

    async fn connect_inner(&self, respect_backoff: bool) -> Result<()> {
        let inner = &self.inner;
        let _serial = inner.connect_lock.lock().await;
        {
            let mut state = inner.state.lock();
            if state.status == RelayStatus::Connected {
                return Ok(());
            }
            if respect_backoff && let Some(remaining) = state.backoff.remaining(Instant::now()) {
                return Err(Error::Backoff(remaining));
            }
            state.manual_disconnect = false;
        }
        if inner.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        inner.set_status(RelayStatus::Connecting);
        let opened = Connection::open(
            &inner.url,
            &inner.ctx,
            &inner.config,
            Arc::clone(&inner.metrics),
        )
        .await;
        match opened {
            Ok(conn) => {
                inner.attach(conn);
                tracing::info!(url = %inner.url, "relay connected");
                Ok(())
            }
            Err(err) => {
                let (delay, attempts) = {
                    let mut state = inner.state.lock();
                    let delay = state.backoff.fail(Instant::now());
                    (delay, state.backoff.attempts())
                };
                inner.set_status(RelayStatus::Backoff);
                tracing::warn!(
                    url = %inner.url,
                    %err,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "relay connect failed"
                );
                Err(err)
            }
        }
    }

    /// Closes the connection. Attached subscriptions get CLOSED
    /// `"relay disconnected"`; no automatic reconnect follows.
    pub fn disconnect(&self) {
        self.inner.drop_connection("relay disconnected", true);
    }

    /// Skips whatever is left of the backoff window.
    pub fn reconnect_now(&self) {
        self.inner.state.lock().backoff.skip();
        self.inner.reconnect.notify_one();
    }

    /// Time until the backoff window closes
    pub fn next_reconnect_in(&self) -> Option<Duration> {
        self.inner.state.lock().backoff.remaining(Instant::now())
    }

    /// Failed connects since the last success
    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().backoff.attempts()
    }

    /// Builds a persistent subscription without sending anything.
    pub fn prepare_subscription(
        &self,
        ctx: &Context,
        filters: impl Into<Filters>,
    ) -> Result<Subscription> {
        self.prepare_subscription_with(ctx, filters, SubscriptionOptions::default())
    }

    pub fn prepare_subscription_with(
        &self,
        ctx: &Context,
        filters: impl Into<Filters>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let filters = filters.into();
        filters.validate()?;
        Ok(Subscription::new(self.clone(), ctx, Arc::new(filters), options))
    }

    /// Prepares and fires a persistent subscription.
    pub fn subscribe(&self, ctx: &Context, filters: impl Into<Filters>) -> Result<Subscription> {
        self.subscribe_with(ctx, filters, SubscriptionOptions::default())
    }

    pub fn subscribe_with(
        &self,
        ctx: &Context,
        filters: impl Into<Filters>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let sub = self.prepare_subscription_with(ctx, filters, options)?;
        sub.fire()?;
        Ok(sub)
    }

    /// Queues `["EVENT", event]`; does not wait for the relay's OK.
    pub fn publish(&self, event: &Event) -> Result<()> {
        let frame = Envelope::Event {
            sub_id: None,
            event: Box::new(event.clone()),
        }
        .to_json();
        self.inner.write_frame(frame)?;
        tracing::debug!(url = %self.inner.url, id = %event.id, "event published");
        Ok(())
    }

    /// Publishes and waits for the matching OK.
    pub async fn publish_and_wait(&self, event: &Event, timeout: Duration) -> Result<OkStatus> {
        let rx = self.inner.expect_ok(&event.id);
        if let Err(err) = self.publish(event) {
            self.inner.forget_ok(&event.id);
            return Err(err);
        }
        self.inner.await_ok(&event.id, rx, timeout).await
    }

    /// Answers the relay's pending NIP-42 challenge.
    pub async fn auth(&self, signer: &dyn EventSigner) -> Result<()> {
        let challenge = self
            .inner
            .state
            .lock()
            .challenge
            .clone()
            .ok_or_else(|| Error::InvalidState("no auth challenge received".to_string()))?;
        let event = signer.sign(EventTemplate::client_auth(&self.inner.url, &challenge))?;

        let rx = self.inner.expect_ok(&event.id);
        let frame = Envelope::Auth(AuthPayload::Event(Box::new(event.clone()))).to_json();
        if let Err(err) = self.inner.write_frame(frame) {
            self.inner.forget_ok(&event.id);
            return Err(err);
        }
        let status = self.inner.await_ok(&event.id, rx, AUTH_TIMEOUT).await?;
        if !status.accepted {
            return Err(Error::AuthFailed(status.message));
        }
        {
            let mut state = self.inner.state.lock();
            if state.challenge.as_deref() == Some(challenge.as_str()) {
                state.authenticated = true;
            }
        }
        tracing::info!(url = %self.inner.url, "authenticated");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().authenticated
    }

    /// Latest challenge received from the relay
    pub fn auth_challenge(&self) -> Option<String> {
        self.inner.state.lock().challenge.clone()
    }

    /// NIP-45 COUNT.
    pub async fn count(&self, ctx: &Context, filters: impl Into<Filters>) -> Result<u64> {
        let filters = filters.into();
        filters.validate()?;
        let id = subscription::next_request_id("count");
        let (tx, rx) = oneshot::channel();
        self.inner
            .state
            .lock()
            .pending_count
            .insert(id.clone(), tx);

        let frame = Envelope::Count {
            sub_id: id.clone(),
            payload: CountPayload::Query(filters),
        }
        .to_json();
        if let Err(err) = self.inner.write_frame(frame) {
            self.inner.state.lock().pending_count.remove(&id);
            return Err(err);
        }

        let result = tokio::select! {
            answer = rx => answer.unwrap_or(Err(Error::Disconnected)),
            _ = ctx.cancelled() => Err(Error::Cancelled),
        };
        self.inner.state.lock().pending_count.remove(&id);
        result
    }

    /// Collects events until EOSE, CLOSED or `ctx` ends. A CLOSED or a
    /// cancelled context yields what arrived so far.
    pub async fn query_sync(&self, ctx: &Context, filters: impl Into<Filters>) -> Result<Vec<Event>> {
        let sub = self.subscribe_with(
            ctx,
            filters,
            SubscriptionOptions::ephemeral(),
        )?;
        let events = sub.collect(ctx).await;
        sub.close();
        Ok(events)
    }

    /// NIP-11 document, from the relay or set by the caller
    pub fn info(&self) -> Option<RelayInformation> {
        self.inner.state.lock().info.clone()
    }

    pub fn set_info(&self, info: Option<RelayInformation>) {
        self.inner.state.lock().info = info;
    }

    /// Fetches the NIP-11 document now and stores it.
    pub async fn refresh_info(&self) -> Result<RelayInformation> {
        let info = nip11::fetch_relay_info(&self.inner.url, self.inner.config.nip11_timeout).await?;
        self.set_info(Some(info.clone()));
        Ok(info)
    }

    /// Skip signature checks on received events
    pub fn set_assume_valid(&self, assume_valid: bool) {
        self.inner.assume_valid.store(assume_valid, Ordering::Relaxed);
    }

    pub fn sig_guard(&self) -> &SigGuard {
        &self.inner.sig_guard
    }

    /// Called with the new status on every real change.
    pub fn set_state_callback(&self, callback: impl Fn(RelayStatus) + Send + Sync + 'static) {
        self.inner.callbacks.lock().state = Some(Arc::new(callback));
    }

    /// Called with each AUTH challenge.
    pub fn set_auth_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.lock().auth = Some(Arc::new(callback));
    }

    pub fn set_notice_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.lock().notice = Some(Arc::new(callback));
    }

    /// Called with every OK frame.
    pub fn set_ok_callback(&self, callback: impl Fn(&OkStatus) + Send + Sync + 'static) {
        self.inner.callbacks.lock().ok = Some(Arc::new(callback));
    }

    /// Receives frames the codec could not parse.
    pub fn set_custom_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.lock().custom = Some(Arc::new(handler));
    }
}

impl RelayInner {
    fn new(
        parent: &Context,
        url: String,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        shared: bool,
    ) -> Arc<Self> {
        let (ctx, cancel) = Context::with_cancel(parent);
        Arc::new(Self {
            state: Mutex::new(RelayState {
                status: RelayStatus::Disconnected,
                conn: None,
                generation: 0,
                subs: HashMap::new(),
                info: None,
                authenticated: false,
                challenge: None,
                backoff: Backoff::new(config.backoff),
                pending_ok: HashMap::new(),
                pending_count: HashMap::new(),
                manual_disconnect: false,
                reconnecting: false,
            }),
            sig_guard: SigGuard::new(config.sig_guard),
            assume_valid: AtomicBool::new(config.assume_valid),
            url,
            config,
            metrics,
            ctx,
            cancel,
            callbacks: Mutex::new(Callbacks::default()),
            registry: SubRegistry::global(),
            shared,
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn registry(&self) -> &'static SubRegistry {
        self.registry
    }

    fn set_status(&self, status: RelayStatus) {
        let changed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.status, status) != status
        };
        if !changed {
            return;
        }
        tracing::debug!(url = %self.url, %status, "relay status");
        let callback = self.callbacks.lock().state.clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn attach(self: &Arc<Self>, conn: Connection) {
        let conn = Arc::new(conn);
        let (generation, resubscribe) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.conn = Some(Arc::clone(&conn));
            state.backoff.reset();
            state.authenticated = false;
            state.challenge = None;
            if let Some(info) = conn.served_info() {
                state.info = Some(info.clone());
            }
            let live: Vec<Arc<SubInner>> = state.subs.values().filter_map(Weak::upgrade).collect();
            (state.generation, live)
        };

        tokio::spawn(dispatch(Arc::downgrade(self), Arc::clone(&conn), generation));
        self.set_status(RelayStatus::Connected);

        for sub in resubscribe {
            match conn.write_message(sub.req_frame()) {
                Ok(()) => tracing::debug!(url = %self.url, sub_id = sub.id(), "subscription re-sent"),
                Err(err) => sub.shutdown(false, Some(format!("resubscribe failed: {err}"))),
            }
        }

        if self.config.fetch_nip11 && !conn.is_test_mode() {
            let weak = Arc::downgrade(self);
            let url = self.url.clone();
            let timeout = self.config.nip11_timeout;
            tokio::spawn(async move {
                match nip11::fetch_relay_info(&url, timeout).await {
                    Ok(info) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.state.lock().info = Some(info);
                        }
                    }
                    Err(err) => tracing::debug!(%url, %err, "nip11 fetch failed"),
                }
            });
        }
    }

    /// Tears the current connection down; `manual` suppresses reconnect.
    fn drop_connection(self: &Arc<Self>, reason: &str, manual: bool) {
        let (conn, subs, pending_count) = {
            let mut state = self.state.lock();
            if manual {
                state.manual_disconnect = true;
            }
            state.generation += 1;
            state.authenticated = false;
            state.challenge = None;
            state.pending_ok.clear();
            let subs: Vec<Arc<SubInner>> = state.subs.values().filter_map(Weak::upgrade).collect();
            (
                state.conn.take(),
                subs,
                std::mem::take(&mut state.pending_count),
            )
        };
        if let Some(conn) = conn {
            conn.close();
        }
        for (_, tx) in pending_count {
            let _ = tx.send(Err(Error::Disconnected));
        }
        self.set_status(RelayStatus::Disconnected);
        for sub in subs {
            sub.shutdown(false, Some(reason.to_string()));
        }
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, err: Error) {
        let auto = self.config.auto_reconnect && !self.ctx.is_cancelled();
        let (conn, subs, pending_count, spawn_reconnect) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.authenticated = false;
            state.challenge = None;
            state.pending_ok.clear();
            let spawn_reconnect = auto && !state.manual_disconnect && !state.reconnecting;
            if auto && !state.manual_disconnect {
                state.backoff.fail(Instant::now());
            }
            if spawn_reconnect {
                state.reconnecting = true;
            }
            let subs: Vec<Arc<SubInner>> = state.subs.values().filter_map(Weak::upgrade).collect();
            (
                state.conn.take(),
                subs,
                std::mem::take(&mut state.pending_count),
                spawn_reconnect,
            )
        };
        tracing::warn!(url = %self.url, %err, "relay connection lost");
        if let Some(conn) = conn {
            conn.close();
        }
        for (_, tx) in pending_count {
            let _ = tx.send(Err(Error::Disconnected));
        }
        self.set_status(RelayStatus::Disconnected);

        for sub in subs {
            if !auto || sub.kind() == SubKind::Ephemeral {
                sub.shutdown(false, Some("disconnected".to_string()));
            }
        }
        if spawn_reconnect {
            tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        }
    }

    /// Writes one frame, enforcing the advertised `max_message_length`.
    pub(crate) fn write_frame(&self, frame: String) -> Result<()> {
        let (conn, max) = {
            let state = self.state.lock();
            let conn = state.conn.clone().ok_or(Error::NotConnected)?;
            let max = state
                .info
                .as_ref()
                .and_then(|i| i.limitation.as_ref())
                .map_or(0, |l| l.max_message_length);
            (conn, max)
        };
        if max > 0 && frame.len() as u64 > max {
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max,
            });
        }
        conn.write_message(frame)
    }

    /// Checks relay policy, attaches `sub` and sends its REQ.
    pub(crate) fn start_subscription(&self, sub: &Arc<SubInner>) -> Result<()> {
        let frame = sub.req_frame();
        let conn = {
            let mut state = self.state.lock();
            let conn = state.conn.clone().ok_or(Error::NotConnected)?;
            let limits = state.info.as_ref().map(RelayInformation::limits).unwrap_or_default();
            if limits.auth_required && !state.authenticated {
                return Err(Error::AuthRequired);
            }
            if limits.payment_required {
                return Err(Error::PaymentRequired);
            }
            // Counted under the same lock as the insert below, so concurrent
            // fires cannot both take the last slot.
            let attached = state.subs.values().filter(|s| s.strong_count() > 0).count();
            if limits.max_subscriptions > 0 && attached as u64 >= limits.max_subscriptions {
                return Err(Error::SubscriptionLimit(limits.max_subscriptions));
            }
            if limits.max_message_length > 0 && frame.len() as u64 > limits.max_message_length {
                return Err(Error::MessageTooLarge {
                    size: frame.len(),
                    max: limits.max_message_length,
                });
            }
            state.subs.insert(sub.id().to_string(), Arc::downgrade(sub));
            conn
        };
        if let Err(err) = conn.write_message(frame) {
            self.detach(sub.id());
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn send_close(&self, sub_id: &str) {
        let frame = Envelope::Close {
            sub_id: sub_id.to_string(),
        }
        .to_json();
        if let Err(err) = self.write_frame(frame) {
            tracing::trace!(url = %self.url, sub_id, %err, "CLOSE not sent");
        }
    }

    pub(crate) fn detach(&self, sub_id: &str) {
        self.state.lock().subs.remove(sub_id);
    }

    fn lookup(&self, sub_id: &str) -> Option<Arc<SubInner>> {
        self.state.lock().subs.get(sub_id).and_then(Weak::upgrade)
    }

    fn expect_ok(&self, event_id: &str) -> oneshot::Receiver<OkStatus> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .pending_ok
            .entry(event_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn forget_ok(&self, event_id: &str) {
        self.state.lock().pending_ok.remove(event_id);
    }

    async fn await_ok(
        &self,
        event_id: &str,
        rx: oneshot::Receiver<OkStatus>,
        timeout: Duration,
    ) -> Result<OkStatus> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.forget_ok(event_id);
                Err(Error::Timeout)
            }
        }
    }

    fn handle_frame(&self, frame: &str) {
        let env = match Envelope::parse(frame) {
            Ok(env) => env,
            Err(err) => {
                self.metrics.incr(Counter::InvalidFrames);
                let handler = self.callbacks.lock().custom.clone();
                if let Some(handler) = handler {
                    handler(frame);
                }
                tracing::warn!(url = %self.url, %err, "unparsable frame from relay");
                return;
            }
        };

        match env {
            Envelope::Event {
                sub_id: Some(sub_id),
                event,
            } => self.route_event(&sub_id, *event),
            Envelope::Eose { sub_id } => match self.lookup(&sub_id) {
                Some(sub) => sub.deliver_eose(),
                None => {
                    self.metrics.incr(Counter::EoseLateArrival);
                    tracing::trace!(url = %self.url, %sub_id, "EOSE for unknown subscription");
                }
            },
            Envelope::Closed { sub_id, reason } => {
                self.metrics.incr(Counter::CloseReceived);
                let count = self.state.lock().pending_count.remove(&sub_id);
                if let Some(tx) = count {
                    let _ = tx.send(Err(Error::from_closed_reason(&reason)));
                    return;
                }
                tracing::debug!(url = %self.url, %sub_id, %reason, "subscription closed by relay");
                if let Some(sub) = self.lookup(&sub_id) {
                    sub.deliver_closed(reason);
                }
            }
            Envelope::Notice { message } => {
                tracing::info!(url = %self.url, %message, "relay notice");
                let callback = self.callbacks.lock().notice.clone();
                if let Some(callback) = callback {
                    callback(&message);
                }
            }
            Envelope::Ok {
                event_id,
                accepted,
                reason,
            } => {
                let status = OkStatus {
                    event_id,
                    accepted,
                    message: reason,
                };
                if !status.accepted {
                    tracing::debug!(url = %self.url, id = %status.event_id, reason = %status.message, "event rejected");
                }
                let waiters = self.state.lock().pending_ok.remove(&status.event_id);
                for tx in waiters.into_iter().flatten() {
                    let _ = tx.send(status.clone());
                }
                let callback = self.callbacks.lock().ok.clone();
                if let Some(callback) = callback {
                    callback(&status);
                }
            }
            Envelope::Auth(AuthPayload::Challenge(challenge)) => {
                {
                    let mut state = self.state.lock();
                    state.challenge = Some(challenge.clone());
                    state.authenticated = false;
                }
                tracing::debug!(url = %self.url, "auth challenge received");
                let callback = self.callbacks.lock().auth.clone();
                if let Some(callback) = callback {
                    callback(&challenge);
                }
            }
            Envelope::Count {
                sub_id,
                payload: CountPayload::Result(count),
            } => {
                let pending = self.state.lock().pending_count.remove(&sub_id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(Ok(count));
                    }
                    None => tracing::trace!(url = %self.url, %sub_id, "COUNT for unknown request"),
                }
            }
            other => {
                self.metrics.incr(Counter::InvalidFrames);
                tracing::debug!(url = %self.url, label = other.label(), "client-bound frame from relay ignored");
            }
        }
    }

    fn route_event(&self, sub_id: &str, event: Event) {
        let Some(sub) = self.lookup(sub_id) else {
            self.metrics.incr(Counter::EventsUnknownSub);
            tracing::trace!(url = %self.url, sub_id, "event for unknown subscription");
            return;
        };
        if !self.assume_valid.load(Ordering::Relaxed) {
            if self.sig_guard.is_banned(&event.pubkey) {
                self.metrics.incr(Counter::BannedPubkeyDrops);
                return;
            }
            if let Err(err) = event.verify() {
                self.metrics.incr(Counter::InvalidSignatures);
                self.sig_guard.record_failure(&event.pubkey);
                tracing::debug!(url = %self.url, sub_id, %err, "dropping invalid event");
                return;
            }
        }
        sub.deliver_event(event);
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(conn) = self.state.get_mut().conn.take() {
            conn.close();
        }
        if self.shared {
            registry::remove(&self.url, self as *const RelayInner);
        }
        tracing::debug!(url = %self.url, "relay dropped");
    }
}

async fn dispatch(relay: Weak<RelayInner>, conn: Arc<Connection>, generation: u64) {
    loop {
        let frame = conn.read_message().await;
        let Some(inner) = relay.upgrade() else {
            break;
        };
        match frame {
            Ok(frame) => inner.handle_frame(&frame),
            Err(err) => {
                inner.connection_lost(generation, err);
                break;
            }
        }
    }
}

async fn reconnect_loop(relay: Weak<RelayInner>) {
    loop {
        let (wait, notify, ctx) = {
            let Some(inner) = relay.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.status == RelayStatus::Connected
                || state.manual_disconnect
                || inner.ctx.is_cancelled()
            {
                state.reconnecting = false;
                return;
            }
            let wait = state.backoff.remaining(Instant::now()).unwrap_or_default();
            drop(state);
            (wait, Arc::clone(&inner.reconnect), inner.ctx.clone())
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = notify.notified() => {}
            _ = ctx.cancelled() => return,
        }

        let Some(inner) = relay.upgrade() else {
            return;
        };
        let relay_handle = Relay { inner };
        match relay_handle.connect().await {
            Ok(()) => {
                relay_handle.inner.state.lock().reconnecting = false;
                return;
            }
            Err(Error::Backoff(_)) => {}
            Err(err) => {
                tracing::debug!(url = %relay_handle.url(), %err, "reconnect attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::mock::{MockConfig, MockRelay};
    use crate::nip11::RelayLimitation;

    fn test_config() -> Arc<Config> {
        Arc::new(
            Config::default()
                .with_test_mode(true)
                .with_assume_valid(true)
                .with_auto_reconnect(false),
        )
    }

    fn note(n: u8) -> Event {
        Event {
            id: format!("{n:064x}"),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000 + n as u64,
            kind: 1,
            tags: Vec::new(),
            content: format!("note {n}"),
            sig: "b".repeat(128),
        }
    }

    #[test]
    fn urls_are_normalized() {
        assert_eq!(normalize_url("wss://relay.example/").unwrap(), "wss://relay.example");
        assert_eq!(normalize_url(" ws://relay.example ").unwrap(), "ws://relay.example");
        assert_eq!(
            normalize_url("wss://relay.example/nostr").unwrap(),
            "wss://relay.example/nostr"
        );
        assert!(matches!(
            normalize_url("https://relay.example"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(normalize_url("not a url"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(RelayStatus::Backoff.to_string(), "backoff");
        assert_eq!(RelayStatus::Connected.to_string(), "connected");
    }

    #[tokio::test]
    async fn shared_relays_are_deduplicated() {
        let ctx = Context::background();
        let a = Relay::get_or_create(&ctx, "ws://relay-shared.mock/", test_config()).unwrap();
        let b = Relay::get_or_create(&ctx, "ws://relay-shared.mock", test_config()).unwrap();
        assert!(a.same_relay(&b));
        assert_eq!(a.handle_count(), 2);
        assert!(is_shared("ws://relay-shared.mock"));
        drop(a);
        drop(b);
        assert!(!is_shared("ws://relay-shared.mock"));

        let standalone = Relay::new(&ctx, "ws://relay-shared.mock", test_config()).unwrap();
        assert!(!is_shared(standalone.url()));
    }

    #[tokio::test]
    async fn connect_subscribe_and_receive() {
        let mock = MockRelay::start("ws://relay-basic.mock", MockConfig::default()).unwrap();
        mock.seed([note(1), note(2)]);
        let relay = Relay::new(&Context::background(), mock.url(), test_config()).unwrap();
        relay.connect().await.unwrap();
        relay.connect().await.unwrap();
        assert!(relay.is_connected());

        let events = relay
            .query_sync(&Context::background(), Filter::new().kind(1))
            .await
            .unwrap();
        let ids: Vec<String> = events.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![note(1).id, note(2).id]);
    }

    #[tokio::test]
    async fn failed_connect_enters_backoff() {
        let relay = Relay::new(&Context::background(), "ws://relay-missing.mock", test_config())
            .unwrap();
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        relay.set_state_callback(move |s| seen.lock().push(s));

        assert!(matches!(relay.connect().await, Err(Error::ConnectionFailed(_))));
        assert_eq!(relay.status(), RelayStatus::Backoff);
        assert!(matches!(relay.connect().await, Err(Error::Backoff(_))));
        assert_eq!(relay.connect_attempts(), 1);
        assert_eq!(
            *states.lock(),
            vec![RelayStatus::Connecting, RelayStatus::Backoff]
        );

        relay.reconnect_now();
        assert!(relay.next_reconnect_in().is_none());
        assert!(matches!(relay.connect().await, Err(Error::ConnectionFailed(_))));
        assert_eq!(relay.connect_attempts(), 2);

        assert!(relay.next_reconnect_in().is_some());
        assert!(matches!(relay.connect_now().await, Err(Error::ConnectionFailed(_))));
        assert_eq!(relay.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn publish_requires_connection_and_gets_ok() {
        let mock = MockRelay::start("ws://relay-publish.mock", MockConfig::default()).unwrap();
        let relay = Relay::new(&Context::background(), mock.url(), test_config()).unwrap();
        assert_eq!(relay.publish(&note(1)), Err(Error::NotConnected));

        relay.connect().await.unwrap();
        let status = relay
            .publish_and_wait(&note(1), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(status.accepted);
        assert_eq!(mock.published(), vec![note(1)]);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let info = RelayInformation {
            limitation: Some(RelayLimitation {
                max_message_length: 64,
                ..RelayLimitation::default()
            }),
            ..RelayInformation::default()
        };
        let mock = MockRelay::start(
            "ws://relay-limits.mock",
            MockConfig {
                info: Some(info),
                ..MockConfig::default()
            },
        )
        .unwrap();
        let relay = Relay::new(&Context::background(), mock.url(), test_config()).unwrap();
        relay.connect().await.unwrap();
        assert!(matches!(
            relay.publish(&note(1)),
            Err(Error::MessageTooLarge { max: 64, .. })
        ));
    }

    #[tokio::test]
    async fn count_round_trip() {
        let mock = MockRelay::start("ws://relay-count.mock", MockConfig::default()).unwrap();
        mock.seed([note(1), note(2), note(3)]);
        let relay = Relay::new(&Context::background(), mock.url(), test_config()).unwrap();
        relay.connect().await.unwrap();
        let n = relay
            .count(&Context::background(), Filter::new().kind(1))
            .await
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn notices_and_garbage_reach_callbacks() {
        let mock = MockRelay::start("ws://relay-notice.mock", MockConfig::default()).unwrap();
        let relay = Relay::with_metrics(
            &Context::background(),
            mock.url(),
            test_config(),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();
        let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel();
        relay.set_notice_callback(move |m| {
            let _ = notice_tx.send(m.to_string());
        });
        relay.set_custom_handler(move |f| {
            let _ = raw_tx.send(f.to_string());
        });
        relay.connect().await.unwrap();

        mock.inject_notice("hello");
        mock.inject_raw("not json");
        assert_eq!(notice_rx.recv().await.unwrap(), "hello");
        assert_eq!(raw_rx.recv().await.unwrap(), "not json");
        assert_eq!(relay.metrics().get(Counter::InvalidFrames), 1);
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn disconnect_closes_subscriptions() {
        let mock = MockRelay::start("ws://relay-disconnect.mock", MockConfig::default()).unwrap();
        let relay = Relay::new(&Context::background(), mock.url(), test_config()).unwrap();
        relay.connect().await.unwrap();
        let sub = relay
            .subscribe(&Context::background(), Filter::new().kind(1))
            .unwrap();
        sub.eose().recv().await.unwrap();
        relay.disconnect();
        assert_eq!(relay.status(), RelayStatus::Disconnected);
        assert_eq!(sub.closed().recv().await.unwrap(), "relay disconnected");
        assert_eq!(relay.subscription_count(), 0);
    }
}
