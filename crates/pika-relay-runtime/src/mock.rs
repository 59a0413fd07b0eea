//! In-process relay
//!
//! With [`Config::test_mode`](crate::Config) set, connections to a URL that
//! has a running [`MockRelay`] are served here instead of over a socket.
//! The mock stores seeded and published events, answers REQ/COUNT/AUTH the
//! way a NIP-01 relay would, and can inject arbitrary frames or faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::channel::Channel;
use crate::envelope::{AuthPayload, CountPayload, Envelope};
use crate::error::{Error, Result};
use crate::event::{Event, KIND_CLIENT_AUTH};
use crate::filter::Filters;
use crate::nip11::RelayInformation;
use crate::relay::normalize_url;

static HUB: LazyLock<Mutex<HashMap<String, Weak<MockShared>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Delay before handling each client frame
    pub response_delay: Duration,
    /// Cap on stored events per REQ; 0 means no cap
    pub max_events_per_req: usize,
    /// Send EOSE after stored events
    pub auto_eose: bool,
    /// Reject published events with bad signatures
    pub validate_signatures: bool,
    /// Send an AUTH challenge on connect and require AUTH before publishing
    pub simulate_auth: bool,
    /// Fixed challenge; random when unset
    pub auth_challenge: Option<String>,
    /// NIP-11 document handed to connecting clients
    pub info: Option<RelayInformation>,
    /// Count connection attempts but refuse them all
    pub refuse_connections: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            response_delay: Duration::ZERO,
            max_events_per_req: 0,
            auto_eose: true,
            validate_signatures: false,
            simulate_auth: false,
            auth_challenge: None,
            info: None,
            refuse_connections: false,
        }
    }
}

/// Misbehavior applied to every REQ after `after_n` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Drop the connection
    Disconnect,
    /// Go silent: no EOSE, no CLOSED
    Timeout,
    /// Send a frame that is not JSON, then carry on
    InvalidJson,
    /// CLOSED with a `rate-limited:` reason
    RateLimit,
    /// CLOSED with an `auth-required:` reason
    AuthRequired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MockStats {
    pub connections: u64,
    pub subscriptions_received: u64,
    pub events_matched: u64,
    pub events_published: u64,
    pub close_received: u64,
    pub faults_triggered: u64,
    pub connect_attempts: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    subscriptions_received: AtomicU64,
    events_matched: AtomicU64,
    events_published: AtomicU64,
    close_received: AtomicU64,
    faults_triggered: AtomicU64,
    connect_attempts: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

struct Peer {
    id: u64,
    to_client: Channel<String>,
    from_client: Channel<String>,
    subs: Mutex<HashMap<String, Filters>>,
    authed: AtomicBool,
    challenge: Mutex<String>,
}

impl Peer {
    async fn push(&self, env: &Envelope) -> bool {
        self.to_client.send(env.to_json()).await.is_ok()
    }

    fn shutdown(&self) {
        self.to_client.close();
        self.from_client.close();
    }
}

struct MockShared {
    url: String,
    config: Mutex<MockConfig>,
    events: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    peers: Mutex<Vec<Arc<Peer>>>,
    fault: Mutex<Option<(Fault, usize)>>,
    counters: Counters,
    publish_feed: Channel<Event>,
    sub_feed: Channel<(String, Filters)>,
    next_peer: AtomicU64,
}

/// Handle to a running mock. Clones share the relay; it stops accepting
/// connections once every handle is dropped.
#[derive(Clone)]
pub struct MockRelay {
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelay")
            .field("url", &self.shared.url)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MockRelay {
    /// Registers a mock at `url`, replacing any previous one.
    pub fn start(url: &str, config: MockConfig) -> Result<Self> {
        let url = normalize_url(url)?;
        let shared = Arc::new(MockShared {
            url: url.clone(),
            config: Mutex::new(config),
            events: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            counters: Counters::default(),
            publish_feed: Channel::bounded(FEED_CAPACITY),
            sub_feed: Channel::bounded(FEED_CAPACITY),
            next_peer: AtomicU64::new(1),
        });
        HUB.lock().insert(url.clone(), Arc::downgrade(&shared));
        tracing::debug!(%url, "mock relay started");
        Ok(Self { shared })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Unregisters the mock and drops every connection.
    pub fn stop(&self) {
        {
            let mut hub = HUB.lock();
            if hub
                .get(&self.shared.url)
                .is_some_and(|w| w.as_ptr() == Arc::as_ptr(&self.shared))
            {
                hub.remove(&self.shared.url);
            }
        }
        self.disconnect_all();
    }

    /// Stored events served to REQs, in seed order.
    pub fn seed(&self, events: impl IntoIterator<Item = Event>) {
        self.shared.events.lock().extend(events);
    }

    pub fn update_config(&self, update: impl FnOnce(&mut MockConfig)) {
        update(&mut self.shared.config.lock());
    }

    /// Events accepted from clients
    pub fn published(&self) -> Vec<Event> {
        self.shared.published.lock().clone()
    }

    /// Waits for the next accepted publish.
    pub async fn await_publish(&self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.shared.publish_feed.recv())
            .await
            .ok()?
            .ok()
    }

    /// Waits for the next REQ; yields its id and filters.
    pub async fn await_subscription(&self, timeout: Duration) -> Option<(String, Filters)> {
        tokio::time::timeout(timeout, self.shared.sub_feed.recv())
            .await
            .ok()?
            .ok()
    }

    /// Applies `fault` to every following REQ once `after_n` events were sent.
    pub fn set_fault(&self, fault: Fault, after_n: usize) {
        *self.shared.fault.lock() = Some((fault, after_n));
    }

    pub fn clear_fault(&self) {
        *self.shared.fault.lock() = None;
    }

    pub fn inject_event(&self, sub_id: &str, event: Event) {
        self.broadcast(&Envelope::Event {
            sub_id: Some(sub_id.to_string()),
            event: Box::new(event),
        });
    }

    pub fn inject_eose(&self, sub_id: &str) {
        self.broadcast(&Envelope::Eose {
            sub_id: sub_id.to_string(),
        });
    }

    pub fn inject_closed(&self, sub_id: &str, reason: &str) {
        for peer in self.shared.peers() {
            peer.subs.lock().remove(sub_id);
        }
        self.broadcast(&Envelope::Closed {
            sub_id: sub_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn inject_notice(&self, message: &str) {
        self.broadcast(&Envelope::Notice {
            message: message.to_string(),
        });
    }

    pub fn inject_ok(&self, event_id: &str, accepted: bool, reason: &str) {
        self.broadcast(&Envelope::Ok {
            event_id: event_id.to_string(),
            accepted,
            reason: reason.to_string(),
        });
    }

    /// Sends a fresh challenge; connected clients must authenticate again.
    pub fn inject_auth(&self, challenge: &str) {
        for peer in self.shared.peers() {
            *peer.challenge.lock() = challenge.to_string();
            peer.authed.store(false, Ordering::SeqCst);
        }
        self.broadcast(&Envelope::Auth(AuthPayload::Challenge(challenge.to_string())));
    }

    /// Sends `frame` verbatim.
    pub fn inject_raw(&self, frame: &str) {
        for peer in self.shared.peers() {
            let _ = peer.to_client.try_send(frame.to_string());
        }
    }

    /// Drops every open connection.
    pub fn disconnect_all(&self) {
        let peers = std::mem::take(&mut *self.shared.peers.lock());
        for peer in peers {
            peer.shutdown();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Live subscription ids across every connection
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .peers()
            .iter()
            .flat_map(|p| p.subs.lock().keys().cloned().collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.shared.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MockStats {
            connections: load(&c.connections),
            subscriptions_received: load(&c.subscriptions_received),
            events_matched: load(&c.events_matched),
            events_published: load(&c.events_published),
            close_received: load(&c.close_received),
            faults_triggered: load(&c.faults_triggered),
            connect_attempts: load(&c.connect_attempts),
        }
    }

    fn broadcast(&self, env: &Envelope) {
        let frame = env.to_json();
        for peer in self.shared.peers() {
            if peer.to_client.try_send(frame.clone()).is_err() {
                tracing::debug!(url = %self.shared.url, "mock peer queue full; frame dropped");
            }
        }
    }
}

/// Connects a client's frame channels to the mock registered at `url`.
/// Returns the NIP-11 document the mock advertises.
pub(crate) fn attach(
    url: &str,
    from_client: &Channel<String>,
    to_client: &Channel<String>,
) -> Result<Option<RelayInformation>> {
    let url = normalize_url(url)?;
    let shared = HUB
        .lock()
        .get(&url)
        .and_then(Weak::upgrade)
        .ok_or_else(|| Error::ConnectionFailed(format!("{url}: no mock relay")))?;
    bump(&shared.counters.connect_attempts, 1);

    let config = shared.config.lock().clone();
    if config.refuse_connections {
        return Err(Error::ConnectionFailed(format!("{url}: connection refused")));
    }
    bump(&shared.counters.connections, 1);

    let challenge = config
        .auth_challenge
        .clone()
        .unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
    let peer = Arc::new(Peer {
        id: shared.next_peer.fetch_add(1, Ordering::Relaxed),
        to_client: to_client.clone(),
        from_client: from_client.clone(),
        subs: Mutex::new(HashMap::new()),
        authed: AtomicBool::new(false),
        challenge: Mutex::new(challenge.clone()),
    });
    if config.simulate_auth {
        let _ = to_client.try_send(Envelope::Auth(AuthPayload::Challenge(challenge)).to_json());
    }
    shared.peers.lock().push(Arc::clone(&peer));
    tokio::spawn(serve_peer(shared, peer));
    Ok(config.info)
}

async fn serve_peer(shared: Arc<MockShared>, peer: Arc<Peer>) {
    while let Ok(frame) = peer.from_client.recv().await {
        let delay = shared.config.lock().response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !shared.handle_frame(&peer, &frame).await {
            break;
        }
    }
    peer.shutdown();
    shared.peers.lock().retain(|p| p.id != peer.id);
    tracing::debug!(url = %shared.url, peer = peer.id, "mock peer gone");
}

impl MockShared {
    fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().clone()
    }

    /// Returns false when the connection should be dropped.
    async fn handle_frame(&self, peer: &Peer, frame: &str) -> bool {
        let env = match Envelope::parse(frame) {
            Ok(env) => env,
            Err(err) => {
                return peer
                    .push(&Envelope::Notice {
                        message: format!("error: {err}"),
                    })
                    .await;
            }
        };
        match env {
            Envelope::Req { sub_id, filters } => self.handle_req(peer, sub_id, filters).await,
            Envelope::Close { sub_id } => {
                peer.subs.lock().remove(&sub_id);
                bump(&self.counters.close_received, 1);
                true
            }
            Envelope::Event { event, .. } => self.handle_publish(peer, *event).await,
            Envelope::Auth(AuthPayload::Event(event)) => self.handle_auth(peer, &event).await,
            Envelope::Count {
                sub_id,
                payload: CountPayload::Query(filters),
            } => {
                let count = self
                    .events
                    .lock()
                    .iter()
                    .filter(|e| filters.matches(e))
                    .count() as u64;
                peer.push(&Envelope::Count {
                    sub_id,
                    payload: CountPayload::Result(count),
                })
                .await
            }
            other => {
                peer.push(&Envelope::Notice {
                    message: format!("unsupported: {}", other.label()),
                })
                .await
            }
        }
    }

    async fn handle_req(&self, peer: &Peer, sub_id: String, filters: Filters) -> bool {
        bump(&self.counters.subscriptions_received, 1);
        let _ = self.sub_feed.try_send((sub_id.clone(), filters.clone()));

        let config = self.config.lock().clone();
        let cap = request_cap(&filters, config.max_events_per_req);
        let matched: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| filters.matches(e))
            .take(cap)
            .cloned()
            .collect();
        let fault = *self.fault.lock();
        let before_fault = fault.map_or(matched.len(), |(_, n)| n.min(matched.len()));

        for event in &matched[..before_fault] {
            if !self.send_event(peer, &sub_id, event).await {
                return false;
            }
        }

        if let Some((fault, _)) = fault {
            bump(&self.counters.faults_triggered, 1);
            tracing::debug!(url = %self.url, %sub_id, ?fault, "mock fault");
            match fault {
                Fault::Disconnect => return false,
                Fault::Timeout => {
                    peer.subs.lock().insert(sub_id, filters);
                    return true;
                }
                Fault::RateLimit => {
                    return peer
                        .push(&Envelope::Closed {
                            sub_id,
                            reason: "rate-limited: slow down".to_string(),
                        })
                        .await;
                }
                Fault::AuthRequired => {
                    return peer
                        .push(&Envelope::Closed {
                            sub_id,
                            reason: "auth-required: authenticate first".to_string(),
                        })
                        .await;
                }
                Fault::InvalidJson => {
                    if peer.to_client.send("[\"EVENT\",{".to_string()).await.is_err() {
                        return false;
                    }
                    for event in &matched[before_fault..] {
                        if !self.send_event(peer, &sub_id, event).await {
                            return false;
                        }
                    }
                }
            }
        }

        peer.subs.lock().insert(sub_id.clone(), filters);
        if config.auto_eose {
            return peer.push(&Envelope::Eose { sub_id }).await;
        }
        true
    }

    async fn send_event(&self, peer: &Peer, sub_id: &str, event: &Event) -> bool {
        bump(&self.counters.events_matched, 1);
        peer.push(&Envelope::Event {
            sub_id: Some(sub_id.to_string()),
            event: Box::new(event.clone()),
        })
        .await
    }

    async fn handle_publish(&self, peer: &Peer, event: Event) -> bool {
        let config = self.config.lock().clone();
        let rejection = if config.simulate_auth && !peer.authed.load(Ordering::SeqCst) {
            Some("auth-required: authenticate to publish".to_string())
        } else if config.validate_signatures {
            event.verify().err().map(|e| format!("invalid: {e}"))
        } else {
            None
        };
        if let Some(reason) = rejection {
            return peer
                .push(&Envelope::Ok {
                    event_id: event.id,
                    accepted: false,
                    reason,
                })
                .await;
        }

        bump(&self.counters.events_published, 1);
        self.events.lock().push(event.clone());
        self.published.lock().push(event.clone());
        let _ = self.publish_feed.try_send(event.clone());

        if !peer
            .push(&Envelope::Ok {
                event_id: event.id.clone(),
                accepted: true,
                reason: String::new(),
            })
            .await
        {
            return false;
        }

        for other in self.peers() {
            let live: Vec<String> = other
                .subs
                .lock()
                .iter()
                .filter(|(_, f)| f.matches(&event))
                .map(|(id, _)| id.clone())
                .collect();
            for sub_id in live {
                let frame = Envelope::Event {
                    sub_id: Some(sub_id),
                    event: Box::new(event.clone()),
                };
                let _ = other.to_client.try_send(frame.to_json());
            }
        }
        true
    }

    async fn handle_auth(&self, peer: &Peer, event: &Event) -> bool {
        let validate = self.config.lock().validate_signatures;
        let challenge = peer.challenge.lock().clone();
        let accepted = event.kind == KIND_CLIENT_AUTH
            && event.tag_values("challenge").any(|c| c == challenge)
            && (!validate || event.verify().is_ok());
        if accepted {
            peer.authed.store(true, Ordering::SeqCst);
        }
        peer.push(&Envelope::Ok {
            event_id: event.id.clone(),
            accepted,
            reason: if accepted {
                String::new()
            } else {
                "restricted: bad auth event".to_string()
            },
        })
        .await
    }
}

/// Events to serve for one REQ: the mock's cap, then the largest filter
/// `limit` when every filter carries one.
fn request_cap(filters: &Filters, max_events_per_req: usize) -> usize {
    let mut cap = if max_events_per_req == 0 {
        usize::MAX
    } else {
        max_events_per_req
    };
    let limits: Option<Vec<usize>> = filters.iter().map(|f| f.limit).collect();
    if let Some(max_limit) = limits.and_then(|l| l.into_iter().max()) {
        cap = cap.min(max_limit);
    }
    cap
}
