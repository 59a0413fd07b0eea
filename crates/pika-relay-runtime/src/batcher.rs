//! Query batching
//!
//! Single-filter queries against the same relay that arrive within one
//! window are merged into one REQ carrying every filter. Results are
//! demultiplexed back to each requester with [`Filter::matches`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{Config, MAX_BATCH_WINDOW, MIN_BATCH_WINDOW};
use crate::context::{CancelHandle, Context};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::{Filter, Filters};
use crate::metrics::{Counter, Metrics};
use crate::relay::Relay;
use crate::subscription::SubscriptionOptions;

type Completion = Box<dyn FnOnce(Result<Vec<Event>>) + Send + 'static>;

struct Request {
    filter: Filter,
    ctx: Context,
    complete: Completion,
}

struct Batch {
    relay: Relay,
    requests: Vec<Request>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub total_requests: u64,
    pub total_batches: u64,
    pub total_events_demuxed: u64,
    /// Requests waiting for their window to close
    pub pending_requests: usize,
}

struct Inner {
    window: Duration,
    eose_timeout: Duration,
    metrics: Arc<Metrics>,
    ctx: Context,
    cancel: CancelHandle,
    batches: Mutex<HashMap<String, Batch>>,
    shut_down: Mutex<bool>,
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    total_events_demuxed: AtomicU64,
}

#[derive(Clone)]
pub struct QueryBatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueryBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBatcher")
            .field("window", &self.inner.window)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryBatcher {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        Self {
            inner: Arc::new(Inner {
                window: config.batch_window.clamp(MIN_BATCH_WINDOW, MAX_BATCH_WINDOW),
                eose_timeout: config.batch_eose_timeout,
                metrics,
                ctx,
                cancel,
                batches: Mutex::new(HashMap::new()),
                shut_down: Mutex::new(false),
                total_requests: AtomicU64::new(0),
                total_batches: AtomicU64::new(0),
                total_events_demuxed: AtomicU64::new(0),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Queues `filter` for `relay`. `complete` runs exactly once, from a
    /// runtime task, with the matching events or the error that ended the
    /// batch. Cancelling `ctx` withdraws the request before the flush.
    pub fn submit(
        &self,
        relay: &Relay,
        filter: Filter,
        ctx: &Context,
        complete: impl FnOnce(Result<Vec<Event>>) + Send + 'static,
    ) -> Result<()> {
        filter.validate()?;
        if *self.inner.shut_down.lock() {
            return Err(Error::InvalidState("query batcher is shut down".to_string()));
        }
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.incr(Counter::TotalRequests);

        let request = Request {
            filter,
            ctx: ctx.clone(),
            complete: Box::new(complete),
        };
        let mut batches = self.inner.batches.lock();
        let batch = batches
            .entry(relay.url().to_string())
            .or_insert_with(|| Batch {
                relay: relay.clone(),
                requests: Vec::new(),
                timer: None,
            });
        batch.requests.push(request);
        if batch.timer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let url = relay.url().to_string();
            let window = self.inner.window;
            batch.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(inner) = weak.upgrade() {
                    inner.flush(&url, true);
                }
            }));
        }
        Ok(())
    }

    /// Submits and awaits the result.
    pub async fn query(&self, relay: &Relay, filter: Filter, ctx: &Context) -> Result<Vec<Event>> {
        let (tx, rx) = oneshot::channel();
        self.submit(relay, filter, ctx, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Flushes every pending batch without waiting for its window.
    pub fn flush_now(&self) {
        let urls: Vec<String> = self.inner.batches.lock().keys().cloned().collect();
        for url in urls {
            self.inner.flush(&url, false);
        }
    }

    /// Fails pending requests with [`Error::Cancelled`] and stops in-flight
    /// batches, which complete with what they received.
    pub fn shutdown(&self) {
        *self.inner.shut_down.lock() = true;
        let batches: Vec<Batch> = self.inner.batches.lock().drain().map(|(_, b)| b).collect();
        for batch in batches {
            if let Some(timer) = batch.timer {
                timer.abort();
            }
            for request in batch.requests {
                (request.complete)(Err(Error::Cancelled));
            }
        }
        self.inner.cancel.cancel();
    }

    pub fn stats(&self) -> BatcherStats {
        let inner = &self.inner;
        BatcherStats {
            total_requests: inner.total_requests.load(Ordering::Relaxed),
            total_batches: inner.total_batches.load(Ordering::Relaxed),
            total_events_demuxed: inner.total_events_demuxed.load(Ordering::Relaxed),
            pending_requests: inner.batches.lock().values().map(|b| b.requests.len()).sum(),
        }
    }
}

impl Inner {
    fn flush(self: &Arc<Self>, url: &str, from_timer: bool) {
        let Some(batch) = self.batches.lock().remove(url) else {
            return;
        };
        if !from_timer && let Some(timer) = &batch.timer {
            timer.abort();
        }

        let (live, cancelled): (Vec<Request>, Vec<Request>) =
            batch.requests.into_iter().partition(|r| !r.ctx.is_cancelled());
        for request in cancelled {
            (request.complete)(Err(Error::Cancelled));
        }
        if live.is_empty() {
            tracing::trace!(url, "batch fully cancelled, no REQ sent");
            return;
        }

        let filters = Filters::new(live.iter().map(|r| r.filter.clone()).collect());
        let subscribed = batch
            .relay
            .subscribe_with(&self.ctx, filters, SubscriptionOptions::ephemeral());
        let sub = match subscribed {
            Ok(sub) => sub,
            Err(err) => {
                tracing::debug!(url, %err, "batch REQ refused");
                for request in live {
                    (request.complete)(Err(err.clone()));
                }
                return;
            }
        };
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr(Counter::TotalBatches);
        tracing::debug!(url, requests = live.len(), sub_id = sub.id(), "batch flushed");

        let weak = Arc::downgrade(self);
        let eose_timeout = self.eose_timeout;
        tokio::spawn(async move {
            let mut results: Vec<Vec<Event>> = vec![Vec::new(); live.len()];
            {
                let all_cancelled = join_all(live.iter().map(|r| r.ctx.cancelled()));
                tokio::pin!(all_cancelled);
                let cap = tokio::time::sleep(eose_timeout);
                tokio::pin!(cap);

                loop {
                    tokio::select! {
                        biased;
                        event = sub.events().recv() => match event {
                            Ok(event) => demux(&weak, &live, &mut results, event),
                            Err(_) => break,
                        },
                        _ = sub.eose().recv() => break,
                        _ = sub.closed().recv() => break,
                        _ = &mut all_cancelled => break,
                        _ = &mut cap => {
                            tracing::debug!(sub_id = sub.id(), "batch hit its EOSE cap");
                            break;
                        }
                    }
                }
            }
            while let Ok(event) = sub.events().try_recv() {
                demux(&weak, &live, &mut results, event);
            }
            sub.close();
            for (request, events) in live.into_iter().zip(results) {
                (request.complete)(Ok(events));
            }
        });
    }
}

fn demux(inner: &Weak<Inner>, requests: &[Request], results: &mut [Vec<Event>], event: Event) {
    let mut delivered = 0u64;
    for (request, out) in requests.iter().zip(results.iter_mut()) {
        if request.filter.matches(&event) {
            out.push(event.clone());
            delivered += 1;
        }
    }
    if delivered > 0
        && let Some(inner) = inner.upgrade()
    {
        inner.total_events_demuxed.fetch_add(delivered, Ordering::Relaxed);
        inner.metrics.add(Counter::TotalEventsDemuxed, delivered);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (_, batch) in self.batches.get_mut().drain() {
            if let Some(timer) = batch.timer {
                timer.abort();
            }
            for request in batch.requests {
                (request.complete)(Err(Error::Cancelled));
            }
        }
    }
}
