//! Waiting on several channels at once.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use super::waiters::SelectSignal;
use super::{Channel, SelectOp};

trait SelectHandle: Send + Sync {
    fn ready_for(&self, op: SelectOp) -> bool;
    fn watch(&self, signal: &Arc<SelectSignal>) -> u64;
    fn unwatch(&self, id: u64);
}

impl<T: Send> SelectHandle for Channel<T> {
    fn ready_for(&self, op: SelectOp) -> bool {
        Channel::ready_for(self, op)
    }

    fn watch(&self, signal: &Arc<SelectSignal>) -> u64 {
        Channel::watch(self, signal)
    }

    fn unwatch(&self, id: u64) {
        Channel::unwatch(self, id)
    }
}

struct Case<'a> {
    handle: &'a dyn SelectHandle,
    op: SelectOp,
}

/// Readiness selector over a set of channel operations.
///
/// `ready*` returns the index of a case whose operation would not block.
/// The caller then performs the matching `try_*` call; a competing
/// consumer can still win the race, so callers loop on `Empty`/`Full`.
///
/// ```
/// # async fn demo() {
/// use pika_relay_runtime::channel::{Channel, Select};
///
/// let a = Channel::<u32>::bounded(1);
/// let b = Channel::<&str>::bounded(1);
/// b.try_send("hi").unwrap();
///
/// let mut select = Select::new();
/// let _ia = select.recv(&a);
/// let ib = select.recv(&b);
/// assert_eq!(select.ready().await, ib);
/// assert_eq!(b.try_recv(), Ok("hi"));
/// # }
/// ```
#[derive(Default)]
pub struct Select<'a> {
    cases: Vec<Case<'a>>,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Adds a receive case; returns its index.
    pub fn recv<T: Send>(&mut self, channel: &'a Channel<T>) -> usize {
        self.push(channel, SelectOp::Recv)
    }

    /// Adds a send case; returns its index.
    pub fn send<T: Send>(&mut self, channel: &'a Channel<T>) -> usize {
        self.push(channel, SelectOp::Send)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    fn push(&mut self, handle: &'a dyn SelectHandle, op: SelectOp) -> usize {
        self.cases.push(Case { handle, op });
        self.cases.len() - 1
    }

    /// Checks every case once, in random order.
    pub fn try_ready(&self) -> Option<usize> {
        shuffled(self.cases.len())
            .into_iter()
            .find(|&i| self.cases[i].handle.ready_for(self.cases[i].op))
    }

    /// Waits until a case is ready. Never resolves for an empty selector.
    pub async fn ready(&mut self) -> usize {
        if let Some(i) = self.try_ready() {
            return i;
        }
        let signal = SelectSignal::new();
        let _watches = Watches::register(&self.cases, &signal);
        if let Some(i) = self.try_ready() {
            return i;
        }
        poll_fn(|cx| {
            signal.set_waker(cx.waker());
            signal.take_fired();
            match self.try_ready() {
                Some(i) => Poll::Ready(i),
                None => Poll::Pending,
            }
        })
        .await
    }

    /// Like [`Select::ready`] but gives up after `timeout`.
    pub async fn ready_timeout(&mut self, timeout: Duration) -> Option<usize> {
        tokio::time::timeout(timeout, self.ready()).await.ok()
    }

    /// Thread-blocking variant of [`Select::ready`].
    pub fn ready_blocking(&mut self) -> usize {
        loop {
            if let Some(i) = self.ready_blocking_until(None) {
                return i;
            }
        }
    }

    /// Thread-blocking wait with a deadline.
    pub fn ready_blocking_timeout(&mut self, timeout: Duration) -> Option<usize> {
        self.ready_blocking_until(Some(Instant::now() + timeout))
    }

    fn ready_blocking_until(&mut self, deadline: Option<Instant>) -> Option<usize> {
        if let Some(i) = self.try_ready() {
            return Some(i);
        }
        let signal = SelectSignal::new();
        let _watches = Watches::register(&self.cases, &signal);
        loop {
            signal.take_fired();
            if let Some(i) = self.try_ready() {
                return Some(i);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            signal.park(deadline);
        }
    }
}

struct Watches<'a> {
    entries: Vec<(&'a dyn SelectHandle, u64)>,
}

impl<'a> Watches<'a> {
    fn register(cases: &[Case<'a>], signal: &Arc<SelectSignal>) -> Self {
        Self {
            entries: cases
                .iter()
                .map(|case| (case.handle, case.handle.watch(signal)))
                .collect(),
        }
    }
}

impl Drop for Watches<'_> {
    fn drop(&mut self) {
        for (handle, id) in self.entries.drain(..) {
            handle.unwatch(id);
        }
    }
}

fn shuffled(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rand::thread_rng());
    order
}
