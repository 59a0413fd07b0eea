//! End-to-end scenarios against the in-process mock relay.
//!
//! Every test uses its own mock URLs and its own `Metrics`, so they can run
//! in parallel within one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pika_relay_runtime::config::BrownListConfig;
use pika_relay_runtime::mock::{Fault, MockConfig, MockRelay};
use pika_relay_runtime::subscription::SubState;
use pika_relay_runtime::{
    Config, Context, Counter, Error, Event, Filter, Metrics, Pool, Relay, RelayInformation,
    RelayLimitation,
};
use pika_test_utils::{Author, tampered};

/// RUST_LOG=pika_relay_runtime=debug shows the runtime's view of a failing test.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> Config {
    init_logging();
    Config::default()
        .with_test_mode(true)
        .with_auto_reconnect(false)
}

fn signed_notes(author: &Author, n: usize) -> Vec<Event> {
    author
        .notes(n)
        .iter()
        .map(|json| Event::from_json(json).expect("fixture event"))
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn basic_subscribe_delivers_seed_order_then_eose() {
    let author = Author::new();
    let notes = signed_notes(&author, 3);
    let mock = MockRelay::start("ws://scenario-basic.mock", MockConfig::default()).unwrap();
    mock.seed(notes.clone());

    let relay = Relay::with_metrics(
        &Context::background(),
        mock.url(),
        Arc::new(config()),
        Arc::new(Metrics::new()),
    )
    .unwrap();
    relay.connect().await.unwrap();
    let sub = relay
        .subscribe(&Context::background(), Filter::new().kind(1).limit(10))
        .unwrap();

    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(sub.events().recv().await.unwrap());
    }
    sub.eose().recv().await.unwrap();
    assert_eq!(got, notes);
    assert!(sub.events().try_recv().is_err());
    assert_eq!(sub.events_dropped(), 0);
    assert_eq!(relay.metrics().get(Counter::InvalidSignatures), 0);
}

#[tokio::test]
async fn unique_subscription_dedups_across_relays() {
    let author = Author::new();
    let shared = signed_notes(&author, 1);
    let a = MockRelay::start("ws://scenario-dedup-a.mock", MockConfig::default()).unwrap();
    let b = MockRelay::start("ws://scenario-dedup-b.mock", MockConfig::default()).unwrap();
    a.seed(shared.clone());
    b.seed(shared.clone());

    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    pool.set_event_middleware(move |event| sink.lock().push(event.id));
    pool.start();

    let handle = pool
        .subscribe(&[a.url(), b.url()], Filter::new().kind(1), true)
        .await
        .unwrap();
    assert_eq!(handle.relay_count(), 2);
    assert!(eventually(|| a.stats().events_matched == 1 && b.stats().events_matched == 1).await);
    assert!(eventually(|| !seen.lock().is_empty()).await);
    // Give the second copy time to reach the worker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock(), vec![shared[0].id.clone()]);

    pool.stop();
    pool.stopped().await;
}

#[tokio::test]
async fn full_queue_drops_newest_and_still_sees_eose() {
    let author = Author::new();
    let notes = signed_notes(&author, 2);
    let mock = MockRelay::start("ws://scenario-full.mock", MockConfig::default()).unwrap();
    mock.seed(notes.clone());

    let metrics = Arc::new(Metrics::new());
    let relay = Relay::with_metrics(
        &Context::background(),
        mock.url(),
        Arc::new(config().with_sub_events_capacity(1)),
        metrics.clone(),
    )
    .unwrap();
    relay.connect().await.unwrap();
    let sub = relay
        .subscribe(&Context::background(), Filter::new().kind(1))
        .unwrap();

    sub.eose().recv().await.unwrap();
    assert_eq!(sub.events().try_recv().unwrap(), notes[0]);
    assert!(sub.events().try_recv().is_err());
    assert_eq!(sub.events_dropped(), 1);
    assert_eq!(metrics.get(Counter::EventsDropped), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_mid_query_returns_partial_results() {
    let author = Author::new();
    let note = signed_notes(&author, 1).remove(0);
    let mock = MockRelay::start(
        "ws://scenario-closed.mock",
        MockConfig {
            auto_eose: false,
            ..MockConfig::default()
        },
    )
    .unwrap();

    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    let ctx = Context::background();
    let relays = [mock.url()];
    let query = pool.query_single(&ctx, &relays, Filter::new().kind(1));
    let relay_side = async {
        let (sub_id, _) = mock
            .await_subscription(Duration::from_secs(2))
            .await
            .unwrap();
        mock.inject_event(&sub_id, note.clone());
        mock.inject_closed(&sub_id, "error: shutting down");
    };
    let (result, ()) = tokio::join!(query, relay_side);
    assert_eq!(result.unwrap(), vec![note]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eose_quorum_ends_query_despite_silent_relay() {
    let author = Author::new();
    let notes = signed_notes(&author, 4);
    let responsive = MockConfig {
        response_delay: Duration::from_millis(20),
        ..MockConfig::default()
    };
    let a = MockRelay::start("ws://scenario-quorum-a.mock", responsive.clone()).unwrap();
    let b = MockRelay::start("ws://scenario-quorum-b.mock", responsive).unwrap();
    let silent = MockRelay::start("ws://scenario-quorum-c.mock", MockConfig::default()).unwrap();
    a.seed(notes[..2].to_vec());
    b.seed(notes[2..3].to_vec());
    silent.seed(notes[3..].to_vec());
    silent.set_fault(Fault::Timeout, 0);

    let grace = Duration::from_millis(300);
    let pool = Pool::with_metrics(
        Arc::new(config().with_quorum_grace(grace)),
        Arc::new(Metrics::new()),
    );
    let ctx = Context::background();
    let started = Instant::now();
    let mut got = pool
        .query_single(&ctx, &[a.url(), b.url(), silent.url()], Filter::new().kind(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    got.sort_by_key(|e| e.created_at);
    assert_eq!(got, notes[..3].to_vec());
    assert!(elapsed >= grace, "returned before the grace window: {elapsed:?}");
    assert!(elapsed < grace + Duration::from_millis(150), "took {elapsed:?}");
    assert_eq!(silent.stats().faults_triggered, 1);
}

#[tokio::test]
async fn brown_list_trips_after_threshold() {
    let mock = MockRelay::start(
        "ws://scenario-brown.mock",
        MockConfig {
            refuse_connections: true,
            ..MockConfig::default()
        },
    )
    .unwrap();
    let config = config().with_brown_list(BrownListConfig {
        threshold: 3,
        ..BrownListConfig::default()
    });
    let pool = Pool::with_metrics(Arc::new(config), Arc::new(Metrics::new()));

    // Back to back, well inside the relay's default backoff window.
    for attempt in 1..=3 {
        assert!(pool.ensure_relay(mock.url()).await.is_err());
        assert_eq!(mock.stats().connect_attempts, attempt);
    }
    assert!(pool.is_relay_browned(mock.url()));

    assert!(pool.ensure_relay(mock.url()).await.unwrap().is_none());
    assert_eq!(mock.stats().connect_attempts, 3);
    assert_eq!(pool.metrics().get(Counter::PoolRelayBrownedSkip), 1);
    assert_eq!(pool.brown_list_stats().browned, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batched_query_ends_on_eose_quorum() {
    let author = Author::new();
    let notes = signed_notes(&author, 3);
    let responsive = MockConfig {
        response_delay: Duration::from_millis(20),
        ..MockConfig::default()
    };
    let a = MockRelay::start("ws://scenario-batch-quorum-a.mock", responsive.clone()).unwrap();
    let b = MockRelay::start("ws://scenario-batch-quorum-b.mock", responsive).unwrap();
    let silent =
        MockRelay::start("ws://scenario-batch-quorum-c.mock", MockConfig::default()).unwrap();
    a.seed(notes[..1].to_vec());
    b.seed(notes[1..2].to_vec());
    silent.seed(notes[2..].to_vec());
    silent.set_fault(Fault::Timeout, 0);

    let grace = Duration::from_millis(300);
    let pool = Pool::with_metrics(
        Arc::new(config().with_batching(true).with_quorum_grace(grace)),
        Arc::new(Metrics::new()),
    );
    let ctx = Context::background();
    let started = Instant::now();
    let mut got = pool
        .query_single(&ctx, &[a.url(), b.url(), silent.url()], Filter::new().kind(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    got.sort_by_key(|e| e.created_at);
    assert_eq!(got, notes[..2].to_vec());
    assert!(elapsed >= grace, "returned before the grace window: {elapsed:?}");
    assert!(elapsed < grace + Duration::from_millis(250), "took {elapsed:?}");
    assert!(pool.batcher().is_some_and(|b| b.stats().total_batches >= 3));
}

#[tokio::test]
async fn stop_closes_live_pool_subscriptions() {
    let mock = MockRelay::start(
        "ws://scenario-stop.mock",
        MockConfig {
            auto_eose: false,
            ..MockConfig::default()
        },
    )
    .unwrap();
    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    pool.start();
    let handle = pool
        .subscribe(&[mock.url()], Filter::new().kind(1), false)
        .await
        .unwrap();
    let sub = handle.subscriptions()[0].clone();
    assert!(eventually(|| mock.stats().subscriptions_received == 1).await);

    pool.stop();
    sub.joined().await;
    assert_eq!(sub.state(), SubState::Closed);
    assert_eq!(pool.subscription_count(), 0);
    pool.stopped().await;
    assert!(!pool.is_running());
    assert!(eventually(|| mock.stats().close_received == 1).await);
    assert!(eventually(|| pool.metrics().get(Counter::PoolCleanupSuccess) == 1).await);
    assert_eq!(pool.metrics().get(Counter::PoolSubRemoved), 1);
}

#[tokio::test]
async fn stopping_the_pool_reports_cancelled() {
    let mock = MockRelay::start(
        "ws://scenario-stop-cancelled.mock",
        MockConfig {
            auto_eose: false,
            ..MockConfig::default()
        },
    )
    .unwrap();
    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    // No worker, so nothing else reads `closed`.
    let handle = pool
        .subscribe(&[mock.url()], Filter::new().kind(1), false)
        .await
        .unwrap();
    let sub = handle.subscriptions()[0].clone();

    pool.stop();
    assert_eq!(sub.closed().recv().await.unwrap(), "cancelled");
    assert!(sub.events().recv().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscription_limit_holds_under_concurrent_fires() {
    let limit = 3u64;
    let info = RelayInformation {
        limitation: Some(RelayLimitation {
            max_subscriptions: limit,
            ..RelayLimitation::default()
        }),
        ..RelayInformation::default()
    };
    let mock = MockRelay::start(
        "ws://scenario-limit.mock",
        MockConfig {
            info: Some(info),
            ..MockConfig::default()
        },
    )
    .unwrap();
    let relay = Relay::with_metrics(
        &Context::background(),
        mock.url(),
        Arc::new(config()),
        Arc::new(Metrics::new()),
    )
    .unwrap();
    relay.connect().await.unwrap();

    let start = Arc::new(tokio::sync::Barrier::new(limit as usize + 1));
    let tasks: Vec<_> = (0..=limit)
        .map(|_| {
            let relay = relay.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                relay.subscribe(&Context::background(), Filter::new().kind(1))
            })
        })
        .collect();

    let mut accepted = Vec::new();
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(sub) => accepted.push(sub),
            Err(Error::SubscriptionLimit(n)) => {
                assert_eq!(n, limit);
                refused += 1;
            }
            Err(err) => panic!("unexpected subscribe error: {err}"),
        }
    }
    assert_eq!(accepted.len(), limit as usize);
    assert_eq!(refused, 1);
    assert_eq!(relay.subscription_count(), limit as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_query_keeps_what_arrived() {
    let author = Author::new();
    let notes = signed_notes(&author, 2);
    let mock = MockRelay::start(
        "ws://scenario-cancel.mock",
        MockConfig {
            auto_eose: false,
            ..MockConfig::default()
        },
    )
    .unwrap();

    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    let (ctx, cancel) = Context::with_cancel(&Context::background());
    let relays = [mock.url()];
    let query = pool.query_single(&ctx, &relays, Filter::new().kind(1));
    let relay_side = async {
        let (sub_id, _) = mock
            .await_subscription(Duration::from_secs(2))
            .await
            .unwrap();
        for note in &notes {
            mock.inject_event(&sub_id, note.clone());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(query, relay_side);
    assert_eq!(result.unwrap(), notes);
}

#[tokio::test]
async fn forged_events_never_reach_subscribers() {
    let author = Author::new();
    let good = author.event(1, "real", 0);
    let forged = tampered(&author.event(1, "forged", 1));
    let mock = MockRelay::start("ws://scenario-forged.mock", MockConfig::default()).unwrap();
    mock.seed([
        Event::from_json(&forged).unwrap(),
        Event::from_json(&good).unwrap(),
    ]);

    let metrics = Arc::new(Metrics::new());
    let relay = Relay::with_metrics(&Context::background(), mock.url(), Arc::new(config()), metrics.clone())
        .unwrap();
    relay.connect().await.unwrap();
    let got = relay
        .query_sync(&Context::background(), Filter::new().kind(1))
        .await
        .unwrap();
    assert_eq!(got, vec![Event::from_json(&good).unwrap()]);
    assert_eq!(metrics.get(Counter::InvalidSignatures), 1);
}

#[tokio::test]
async fn cache_hit_skips_relays_and_sink_sees_network_results() {
    let author = Author::new();
    let notes = signed_notes(&author, 2);
    let mock = MockRelay::start("ws://scenario-cache.mock", MockConfig::default()).unwrap();
    mock.seed(notes.clone());

    let pool = Pool::with_metrics(Arc::new(config()), Arc::new(Metrics::new()));
    let cache: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let (reader, writer) = (cache.clone(), cache.clone());
    pool.set_cache_query(move |_| reader.lock().clone());
    pool.set_event_sink(move |events| writer.lock().extend_from_slice(events));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    pool.set_batch_middleware(move |batch| {
        counter.fetch_add(batch.len(), Ordering::Relaxed);
    });

    let ctx = Context::background();
    let first = pool
        .query_single(&ctx, &[mock.url()], Filter::new().kind(1))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(delivered.load(Ordering::Relaxed), 2);
    assert_eq!(mock.stats().subscriptions_received, 1);

    let second = pool
        .query_single(&ctx, &[mock.url()], Filter::new().kind(1))
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(mock.stats().subscriptions_received, 1);
}
