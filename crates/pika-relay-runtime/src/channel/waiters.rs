//! Parked senders, receivers and selectors of one channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::task::Waker;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Condvar parker for OS-thread waiters.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until unparked or `deadline`; returns false on timeout.
    pub(crate) fn park(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut notified, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cv.wait(&mut notified),
            }
        }
        std::mem::replace(&mut *notified, false)
    }

    pub(crate) fn unpark(&self) {
        *self.notified.lock() = true;
        self.cv.notify_one();
    }
}

#[derive(Debug)]
pub(crate) enum Waiter {
    Task(Waker),
    Thread(Arc<Parker>),
}

impl Waiter {
    fn wake(self) {
        match self {
            Waiter::Task(waker) => waker.wake(),
            Waiter::Thread(parker) => parker.unpark(),
        }
    }
}

/// Wakeup shared by every channel a `Select` watches.
#[derive(Debug, Default)]
pub(crate) struct SelectSignal {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
    parker: Parker,
}

impl SelectSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn notify(&self) {
        self.fired.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
        self.parker.unpark();
    }

    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    pub(crate) fn take_fired(&self) -> bool {
        self.fired.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn park(&self, deadline: Option<Instant>) -> bool {
        self.parker.park(deadline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    NotEmpty,
    NotFull,
}

#[derive(Debug, Default)]
struct Lists {
    next_id: u64,
    not_empty: VecDeque<(u64, Waiter)>,
    not_full: VecDeque<(u64, Waiter)>,
    selects: Vec<(u64, Arc<SelectSignal>)>,
}

impl Lists {
    fn list(&mut self, kind: WaitKind) -> &mut VecDeque<(u64, Waiter)> {
        match kind {
            WaitKind::NotEmpty => &mut self.not_empty,
            WaitKind::NotFull => &mut self.not_full,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Waiter registry. `registered` mirrors the total entry count so the fast
/// path can skip the mutex when nobody waits.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    lists: Mutex<Lists>,
    registered: AtomicUsize,
}

impl WaitQueue {
    /// Adds a waiter; the caller must retry its operation once afterwards.
    pub(crate) fn register(&self, kind: WaitKind, waiter: Waiter) -> u64 {
        let mut lists = self.lists.lock();
        let id = lists.next_id();
        lists.list(kind).push_back((id, waiter));
        self.registered.fetch_add(1, Ordering::SeqCst);
        drop(lists);
        fence(Ordering::SeqCst);
        id
    }

    /// Refreshes the waker of a still-queued entry. Returns false if the
    /// entry was already consumed by a wakeup.
    pub(crate) fn refresh(&self, kind: WaitKind, id: u64, waker: &Waker) -> bool {
        let mut lists = self.lists.lock();
        match lists.list(kind).iter_mut().find(|(i, _)| *i == id) {
            Some((_, waiter)) => {
                if !matches!(waiter, Waiter::Task(w) if w.will_wake(waker)) {
                    *waiter = Waiter::Task(waker.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Removes an entry; returns false if a wakeup already consumed it.
    pub(crate) fn unregister(&self, kind: WaitKind, id: u64) -> bool {
        let mut lists = self.lists.lock();
        let list = lists.list(kind);
        match list.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                list.remove(pos);
                self.registered.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub(crate) fn watch(&self, signal: Arc<SelectSignal>) -> u64 {
        let mut lists = self.lists.lock();
        let id = lists.next_id();
        lists.selects.push((id, signal));
        self.registered.fetch_add(1, Ordering::SeqCst);
        drop(lists);
        fence(Ordering::SeqCst);
        id
    }

    pub(crate) fn unwatch(&self, id: u64) {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.selects.iter().position(|(i, _)| *i == id) {
            lists.selects.swap_remove(pos);
            self.registered.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wakes one `kind` waiter plus every selector. Called after each
    /// successful transfer.
    pub(crate) fn notify_one(&self, kind: WaitKind) {
        fence(Ordering::SeqCst);
        if self.registered.load(Ordering::SeqCst) == 0 {
            return;
        }
        let (waiter, selects) = {
            let mut lists = self.lists.lock();
            let waiter = lists.list(kind).pop_front();
            if waiter.is_some() {
                self.registered.fetch_sub(1, Ordering::SeqCst);
            }
            let selects: Vec<_> = lists.selects.iter().map(|(_, s)| Arc::clone(s)).collect();
            (waiter, selects)
        };
        if let Some((_, waiter)) = waiter {
            waiter.wake();
        }
        for signal in selects {
            signal.notify();
        }
    }

    /// Wakes everything; used on close.
    pub(crate) fn notify_all(&self) {
        let (waiters, selects) = {
            let mut lists = self.lists.lock();
            let mut waiters: Vec<Waiter> = lists.not_empty.drain(..).map(|(_, w)| w).collect();
            waiters.extend(lists.not_full.drain(..).map(|(_, w)| w));
            self.registered.fetch_sub(waiters.len(), Ordering::SeqCst);
            let selects: Vec<_> = lists.selects.iter().map(|(_, s)| Arc::clone(s)).collect();
            (waiters, selects)
        };
        for waiter in waiters {
            waiter.wake();
        }
        for signal in selects {
            signal.notify();
        }
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn parker_times_out_without_unpark() {
        let parker = Parker::new();
        let woke = parker.park(Some(Instant::now() + Duration::from_millis(10)));
        assert!(!woke);
    }

    #[test]
    fn parker_wakes_across_threads() {
        let parker = Parker::new();
        let remote = Arc::clone(&parker);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            remote.unpark();
        });
        assert!(parker.park(None));
        handle.join().unwrap();
    }

    #[test]
    fn notify_one_consumes_a_single_entry() {
        let queue = WaitQueue::default();
        let a = Parker::new();
        let b = Parker::new();
        let id_a = queue.register(WaitKind::NotEmpty, Waiter::Thread(Arc::clone(&a)));
        let id_b = queue.register(WaitKind::NotEmpty, Waiter::Thread(Arc::clone(&b)));
        assert_eq!(queue.registered(), 2);

        queue.notify_one(WaitKind::NotEmpty);
        assert!(!queue.unregister(WaitKind::NotEmpty, id_a));
        assert!(queue.unregister(WaitKind::NotEmpty, id_b));
        assert_eq!(queue.registered(), 0);
    }

    #[test]
    fn close_reaches_selectors() {
        let queue = WaitQueue::default();
        let signal = SelectSignal::new();
        let id = queue.watch(Arc::clone(&signal));
        queue.notify_all();
        assert!(signal.take_fired());
        queue.unwatch(id);
        assert_eq!(queue.registered(), 0);
    }
}
