//! Lock-free bounded ring with per-slot sequence numbers.
//!
//! Slot `i` starts with `seq = i`. A producer holding index `t` may write the
//! slot when `seq == t` and publishes with `seq = t + 1`; a consumer holding
//! index `h` may read when `seq == h + 1` and releases with `seq = h + slots`.
//! Both sides claim their index with a CAS. The top bit of `tail` is the
//! closed mark so no producer can claim an index after close.

use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

const MARK: usize = 1 << (usize::BITS - 1);

pub(crate) enum Push<T> {
    Ok,
    Full(T),
    Closed(T),
}

pub(crate) enum Pop<T> {
    Ok(T),
    Empty,
    Closed,
}

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(crate) struct Ring<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: a slot's value is only touched by the single thread that won the
// CAS for its index, and hand-off is ordered by the Release/Acquire pair on
// `seq`.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// `capacity` is rounded up to a power of two. One-slot rings get two
    /// physical slots since `t + 1` and `h + 1` would otherwise collide.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let physical = capacity.max(2);
        let slots = (0..physical)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: physical - 1,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn push(&self, value: T) -> Push<T> {
        let mut spins = 0u32;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail & MARK != 0 {
                return Push::Closed(value);
            }
            let head = self.head.load(Ordering::Acquire);
            if tail.saturating_sub(head) >= self.capacity {
                return Push::Full(value);
            }

            let slot = &self.slots[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == tail {
                if self
                    .tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: the CAS gave us exclusive ownership of index
                    // `tail`, and `seq == tail` means the previous occupant
                    // was already moved out.
                    unsafe { (*slot.value.get()).write(value) };
                    slot.seq.store(tail + 1, Ordering::Release);
                    return Push::Ok;
                }
            } else if seq < tail {
                // A consumer claimed the previous lap but has not released it yet.
                snooze(&mut spins);
            }
        }
    }

    pub(crate) fn pop(&self) -> Pop<T> {
        let physical = self.slots.len();
        let mut spins = 0u32;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let slot = &self.slots[head & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == head + 1 {
                if self
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: the CAS gave us exclusive ownership of index
                    // `head`, and `seq == head + 1` means the producer
                    // finished writing it.
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.seq.store(head + physical, Ordering::Release);
                    return Pop::Ok(value);
                }
            } else if seq <= head {
                let tail = self.tail.load(Ordering::SeqCst);
                if tail & !MARK == head {
                    return if tail & MARK != 0 {
                        Pop::Closed
                    } else {
                        Pop::Empty
                    };
                }
                if tail & !MARK > head {
                    // A producer claimed this index and is still writing.
                    snooze(&mut spins);
                }
            }
        }
    }

    /// Marks the ring closed; returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        self.tail.fetch_or(MARK, Ordering::SeqCst) & MARK == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tail.load(Ordering::SeqCst) & MARK != 0
    }

    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::SeqCst) & !MARK;
        let head = self.head.load(Ordering::SeqCst);
        tail.saturating_sub(head).min(self.capacity)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut() & !MARK;
        for index in head..tail {
            let slot = &mut self.slots[index & self.mask];
            if *slot.seq.get_mut() == index + 1 {
                // SAFETY: published and never consumed; we have `&mut self`.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

fn snooze(spins: &mut u32) {
    if *spins < 6 {
        for _ in 0..(1 << *spins) {
            hint::spin_loop();
        }
        *spins += 1;
    } else {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(Ring::<u8>::new(0).capacity(), 1);
        assert_eq!(Ring::<u8>::new(3).capacity(), 4);
        assert_eq!(Ring::<u8>::new(64).capacity(), 64);
    }

    #[test]
    fn one_slot_ring_never_overwrites() {
        let ring = Ring::new(1);
        assert!(matches!(ring.push(1), Push::Ok));
        assert!(matches!(ring.push(2), Push::Full(2)));
        assert!(matches!(ring.pop(), Pop::Ok(1)));
        assert!(matches!(ring.push(3), Push::Ok));
        assert!(matches!(ring.pop(), Pop::Ok(3)));
        assert!(matches!(ring.pop(), Pop::Empty));
    }

    #[test]
    fn closed_ring_drains_then_reports_closed() {
        let ring = Ring::new(4);
        assert!(matches!(ring.push("a"), Push::Ok));
        assert!(matches!(ring.push("b"), Push::Ok));
        assert!(ring.close());
        assert!(!ring.close());
        assert!(matches!(ring.push("c"), Push::Closed("c")));
        assert!(matches!(ring.pop(), Pop::Ok("a")));
        assert!(matches!(ring.pop(), Pop::Ok("b")));
        assert!(matches!(ring.pop(), Pop::Closed));
    }

    #[test]
    fn drop_releases_unread_values() {
        let marker = Arc::new(());
        let ring = Ring::new(8);
        for _ in 0..5 {
            assert!(matches!(ring.push(Arc::clone(&marker)), Push::Ok));
        }
        let _ = ring.pop();
        drop(ring);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers_see_every_value_once() {
        let ring = Arc::new(Ring::new(16));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        let mut v = p * 1_000_000 + i;
                        loop {
                            match ring.push(v) {
                                Push::Ok => break,
                                Push::Full(back) => {
                                    v = back;
                                    thread::yield_now();
                                }
                                Push::Closed(_) => panic!("closed early"),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 4000 {
            match ring.pop() {
                Pop::Ok(v) => seen.push(v),
                Pop::Empty => thread::yield_now(),
                Pop::Closed => unreachable!(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4000);
    }
}
