//! Bounded multi-producer multi-consumer channel
//!
//! [`Channel`] is the queue every other part of the runtime is built on:
//! connection frames, subscription events, EOSE signals and context `done`
//! notifications all travel through one.
//!
//! # Semantics
//!
//! - Capacity is rounded up to a power of two.
//! - `try_send`/`try_recv` never block and are lock-free.
//! - `send`/`recv` are async and park the task as a waker;
//!   `send_blocking`/`recv_blocking` park the OS thread on a condvar after a
//!   short spin.
//! - Each successful transfer wakes exactly one parked peer plus every
//!   [`Select`] watching the channel. `close` wakes everything.
//! - After `close`, sends fail and receivers drain buffered values before
//!   observing [`RecvError::Closed`].
//!
//! Handles are reference counted. A waiter always borrows a live handle, so
//! the queue cannot be freed while anybody is parked on it.

mod ring;
mod select;
mod waiters;

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Instant;

pub use self::select::Select;
use self::ring::{Pop, Push, Ring};
use self::waiters::{Parker, SelectSignal, WaitKind, WaitQueue, Waiter};
use crate::config::{Config, SpinConfig};
use crate::context::Context;
use crate::metrics::{Counter, HistogramId, Metrics};

/// Error returned by [`Channel::try_send`].
#[derive(PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    /// Channel at capacity
    #[error("channel full")]
    Full(T),
    /// Channel closed
    #[error("channel closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Value that was not sent
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Error returned by the blocking and context-aware sends.
#[derive(PartialEq, Eq, thiserror::Error)]
pub enum SendError<T> {
    /// Channel closed
    #[error("channel closed")]
    Closed(T),
    /// Context cancelled while waiting for space
    #[error("cancelled")]
    Cancelled(T),
}

impl<T> SendError<T> {
    /// Value that was not sent
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(v) | Self::Cancelled(v) => v,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing buffered
    #[error("channel empty")]
    Empty,
    /// Closed and drained
    #[error("channel closed")]
    Closed,
}

/// Error returned by the blocking and context-aware receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Closed and drained
    #[error("channel closed")]
    Closed,
    /// Context cancelled while waiting
    #[error("cancelled")]
    Cancelled,
}

/// Per-channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Spin-before-park for OS-thread waiters
    pub spin: SpinConfig,
    /// Trace every operation
    pub debug: bool,
    /// Label used in diagnostics
    pub label: &'static str,
    /// Counter sink
    pub metrics: Arc<Metrics>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            spin: SpinConfig::default(),
            debug: false,
            label: "chan",
            metrics: Metrics::global(),
        }
    }
}

impl ChannelOptions {
    /// Options derived from a runtime config.
    pub fn from_config(config: &Config, metrics: Arc<Metrics>, label: &'static str) -> Self {
        Self {
            spin: config.spin,
            debug: config.channel_debug,
            label,
            metrics,
        }
    }
}

/// Traffic seen by one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Values accepted
    pub enqueued: u64,
    /// Values handed to receivers
    pub dequeued: u64,
    /// Current depth
    pub depth: usize,
    /// Highest depth observed
    pub peak_depth: usize,
    /// Capacity
    pub capacity: usize,
}

struct Shared<T> {
    ring: Ring<T>,
    waiters: WaitQueue,
    options: ChannelOptions,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    peak_depth: AtomicUsize,
}

/// Bounded MPMC channel handle. Clones share the same queue.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.shared.options.label)
            .field("capacity", &self.capacity())
            .field("depth", &self.depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Channel<T> {
    /// Channel with default options.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_options(capacity, ChannelOptions::default())
    }

    pub fn with_options(capacity: usize, options: ChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                ring: Ring::new(capacity),
                waiters: WaitQueue::default(),
                options,
                enqueued: AtomicU64::new(0),
                dequeued: AtomicU64::new(0),
                peak_depth: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Number of buffered values
    pub fn depth(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.ring.is_closed()
    }

    /// Whether two handles refer to the same queue
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            dequeued: self.shared.dequeued.load(Ordering::Relaxed),
            depth: self.depth(),
            peak_depth: self.shared.peak_depth.load(Ordering::Relaxed),
            capacity: self.capacity(),
        }
    }

    /// Closes the channel. Idempotent; wakes every waiter.
    pub fn close(&self) {
        if self.shared.ring.close() {
            self.metrics().incr(Counter::CloseBroadcasts);
            if self.shared.options.debug {
                tracing::trace!(chan = self.shared.options.label, "close");
            }
            self.shared.waiters.notify_all();
        }
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match self.push(value) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics().incr(Counter::TrySendFailures);
                Err(e)
            }
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.pop() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.metrics().incr(Counter::TryRecvFailures);
                Err(e)
            }
        }
    }

    /// Waits for space, then sends.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = match self.push(value) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
            Err(TrySendError::Full(v)) => Some(v),
        };
        self.metrics().incr(Counter::BlockSends);
        let started = Instant::now();
        let mut guard = WaitGuard::new(&self.shared.waiters, WaitKind::NotFull);

        let result = poll_fn(|cx| {
            loop {
                let Some(v) = value.take() else {
                    return Poll::Ready(Ok(()));
                };
                match self.push(v) {
                    Ok(()) => {
                        guard.complete();
                        return Poll::Ready(Ok(()));
                    }
                    Err(TrySendError::Closed(v)) => {
                        guard.complete();
                        return Poll::Ready(Err(SendError::Closed(v)));
                    }
                    Err(TrySendError::Full(v)) => value = Some(v),
                }
                if !guard.arm(cx.waker()) {
                    return Poll::Pending;
                }
            }
        })
        .await;

        self.observe_wait(HistogramId::SendWaitNs, started);
        result
    }

    /// Waits for a value. Returns `Closed` once closed and drained.
    pub async fn recv(&self) -> Result<T, RecvError> {
        match self.pop() {
            Ok(v) => return Ok(v),
            Err(TryRecvError::Closed) => return Err(RecvError::Closed),
            Err(TryRecvError::Empty) => {}
        }
        self.metrics().incr(Counter::BlockRecvs);
        let started = Instant::now();
        let mut guard = WaitGuard::new(&self.shared.waiters, WaitKind::NotEmpty);

        let result = poll_fn(|cx| {
            loop {
                match self.pop() {
                    Ok(v) => {
                        guard.complete();
                        return Poll::Ready(Ok(v));
                    }
                    Err(TryRecvError::Closed) => {
                        guard.complete();
                        return Poll::Ready(Err(RecvError::Closed));
                    }
                    Err(TryRecvError::Empty) => {}
                }
                if !guard.arm(cx.waker()) {
                    return Poll::Pending;
                }
            }
        })
        .await;

        self.observe_wait(HistogramId::RecvWaitNs, started);
        result
    }

    /// Sends, or gives the value back when `ctx` is cancelled first.
    pub async fn send_with_context(&self, value: T, ctx: &Context) -> Result<(), SendError<T>>
    where
        T: Send,
    {
        let mut value = value;
        loop {
            match self.push(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
                Err(TrySendError::Full(v)) => value = v,
            }
            if ctx.is_cancelled() {
                return Err(SendError::Cancelled(value));
            }
            let mut select = Select::new();
            select.send(self);
            select.recv(ctx.done());
            select.ready().await;
        }
    }

    /// Receives, or fails with `Cancelled` when `ctx` is cancelled first.
    pub async fn recv_with_context(&self, ctx: &Context) -> Result<T, RecvError>
    where
        T: Send,
    {
        loop {
            match self.pop() {
                Ok(v) => return Ok(v),
                Err(TryRecvError::Closed) => return Err(RecvError::Closed),
                Err(TryRecvError::Empty) => {}
            }
            if ctx.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let mut select = Select::new();
            select.recv(self);
            select.recv(ctx.done());
            select.ready().await;
        }
    }

    /// Thread-blocking send for callers outside the async runtime.
    pub fn send_blocking(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = match self.push(value) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
            Err(TrySendError::Full(v)) => v,
        };
        self.metrics().incr(Counter::BlockSends);
        let started = Instant::now();

        let spin = self.shared.options.spin;
        for _ in 0..spin.iters {
            std::thread::sleep(spin.pause);
            match self.push(value) {
                Ok(()) => {
                    self.observe_wait(HistogramId::SendWaitNs, started);
                    return Ok(());
                }
                Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
                Err(TrySendError::Full(v)) => value = v,
            }
        }

        let parker = Parker::new();
        loop {
            let id = self
                .shared
                .waiters
                .register(WaitKind::NotFull, Waiter::Thread(Arc::clone(&parker)));
            match self.push(value) {
                Ok(()) => {
                    self.shared.waiters.unregister(WaitKind::NotFull, id);
                    self.observe_wait(HistogramId::SendWaitNs, started);
                    return Ok(());
                }
                Err(TrySendError::Closed(v)) => {
                    self.shared.waiters.unregister(WaitKind::NotFull, id);
                    return Err(SendError::Closed(v));
                }
                Err(TrySendError::Full(v)) => value = v,
            }
            parker.park(None);
            self.shared.waiters.unregister(WaitKind::NotFull, id);
        }
    }

    /// Thread-blocking receive for callers outside the async runtime.
    pub fn recv_blocking(&self) -> Result<T, RecvError> {
        self.recv_blocking_until(None)?
            .ok_or(RecvError::Closed)
    }

    /// Thread-blocking receive with a deadline; `Ok(None)` on timeout.
    pub fn recv_blocking_until(&self, deadline: Option<Instant>) -> Result<Option<T>, RecvError> {
        match self.pop() {
            Ok(v) => return Ok(Some(v)),
            Err(TryRecvError::Closed) => return Err(RecvError::Closed),
            Err(TryRecvError::Empty) => {}
        }
        self.metrics().incr(Counter::BlockRecvs);
        let started = Instant::now();

        let spin = self.shared.options.spin;
        for _ in 0..spin.iters {
            std::thread::sleep(spin.pause);
            match self.pop() {
                Ok(v) => {
                    self.observe_wait(HistogramId::RecvWaitNs, started);
                    return Ok(Some(v));
                }
                Err(TryRecvError::Closed) => return Err(RecvError::Closed),
                Err(TryRecvError::Empty) => {}
            }
        }

        let parker = Parker::new();
        loop {
            let id = self
                .shared
                .waiters
                .register(WaitKind::NotEmpty, Waiter::Thread(Arc::clone(&parker)));
            match self.pop() {
                Ok(v) => {
                    self.shared.waiters.unregister(WaitKind::NotEmpty, id);
                    self.observe_wait(HistogramId::RecvWaitNs, started);
                    return Ok(Some(v));
                }
                Err(TryRecvError::Closed) => {
                    self.shared.waiters.unregister(WaitKind::NotEmpty, id);
                    return Err(RecvError::Closed);
                }
                Err(TryRecvError::Empty) => {}
            }
            let woke = parker.park(deadline);
            if !self.shared.waiters.unregister(WaitKind::NotEmpty, id) && !woke {
                // Woken by a sender right as the deadline passed; pass it on.
                self.shared.waiters.notify_one(WaitKind::NotEmpty);
            }
            if !woke && deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    fn metrics(&self) -> &Metrics {
        &self.shared.options.metrics
    }

    fn observe_wait(&self, histogram: HistogramId, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.metrics().observe(histogram, nanos);
    }

    fn push(&self, value: T) -> Result<(), TrySendError<T>> {
        match self.shared.ring.push(value) {
            Push::Ok => {
                let depth = self.shared.ring.len();
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                self.shared.peak_depth.fetch_max(depth, Ordering::Relaxed);
                let metrics = self.metrics();
                metrics.incr(Counter::SendSuccesses);
                metrics.add(Counter::SendDepthSum, depth as u64);
                if self.shared.options.debug {
                    tracing::trace!(chan = self.shared.options.label, depth, "send");
                }
                self.shared.waiters.notify_one(WaitKind::NotEmpty);
                Ok(())
            }
            Push::Full(v) => Err(TrySendError::Full(v)),
            Push::Closed(v) => Err(TrySendError::Closed(v)),
        }
    }

    fn pop(&self) -> Result<T, TryRecvError> {
        match self.shared.ring.pop() {
            Pop::Ok(v) => {
                let depth = self.shared.ring.len();
                self.shared.dequeued.fetch_add(1, Ordering::Relaxed);
                let metrics = self.metrics();
                metrics.incr(Counter::RecvSuccesses);
                metrics.add(Counter::RecvDepthSum, depth as u64);
                if self.shared.options.debug {
                    tracing::trace!(chan = self.shared.options.label, depth, "recv");
                }
                self.shared.waiters.notify_one(WaitKind::NotFull);
                Ok(v)
            }
            Pop::Empty => Err(TryRecvError::Empty),
            Pop::Closed => Err(TryRecvError::Closed),
        }
    }

    pub(crate) fn ready_for(&self, op: SelectOp) -> bool {
        let ring = &self.shared.ring;
        ring.is_closed()
            || match op {
                SelectOp::Recv => !ring.is_empty(),
                SelectOp::Send => !ring.is_full(),
            }
    }

    pub(crate) fn watch(&self, signal: &Arc<SelectSignal>) -> u64 {
        self.shared.waiters.watch(Arc::clone(signal))
    }

    pub(crate) fn unwatch(&self, id: u64) {
        self.shared.waiters.unwatch(id);
    }
}

/// Direction of a select case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOp {
    /// Ready when a value is buffered or the channel is closed
    Recv,
    /// Ready when there is space or the channel is closed
    Send,
}

/// Registration of one async waiter. A waiter that is woken but then
/// dropped before finishing hands its wakeup to the next waiter.
struct WaitGuard<'a> {
    queue: &'a WaitQueue,
    kind: WaitKind,
    id: Option<u64>,
    done: bool,
}

impl<'a> WaitGuard<'a> {
    fn new(queue: &'a WaitQueue, kind: WaitKind) -> Self {
        Self {
            queue,
            kind,
            id: None,
            done: false,
        }
    }

    /// Ensures a live registration. Returns true when a new entry was added,
    /// in which case the caller retries before parking.
    fn arm(&mut self, waker: &std::task::Waker) -> bool {
        if let Some(id) = self.id
            && self.queue.refresh(self.kind, id, waker)
        {
            return false;
        }
        self.id = Some(self.queue.register(self.kind, Waiter::Task(waker.clone())));
        true
    }

    fn complete(&mut self) {
        self.done = true;
        if let Some(id) = self.id.take() {
            self.queue.unregister(self.kind, id);
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(id) = self.id.take()
            && !self.queue.unregister(self.kind, id)
        {
            self.queue.notify_one(self.kind);
        }
    }
}
