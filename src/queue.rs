// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Growable multi-producer queues.
//!
//! [`SharedQueue`] backs both the per-(worker, priority) affinity queue
//! (many producers, one consumer) and the per-(scheduler, priority) overflow
//! queue (many producers, many consumers). Steady-state push and pop are
//! lock-free over a ring of sequence-stamped slots; when a ring fills up,
//! a producer takes the growth lock, links a ring of double the capacity
//! behind the full one and closes the old ring to new producers. Consumers
//! drain a closed ring completely before stepping to its successor, so FIFO
//! order survives growth. Every ring ever allocated stays alive until the
//! queue drops: a stalled producer or consumer may still hold a pointer into
//! a retired ring.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use core::mem::MaybeUninit;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

/// Half the index range, so position differences stay representable.
const MAX_CAPACITY: u64 = u64::MAX / 2;

/// Folded into `enqueue_pos` when a ring is closed for growth. Closing and
/// reservation contend on the same CAS word, so a producer can never reserve
/// a slot in a ring that consumers already drained and left behind.
const CLOSED_BIT: u64 = 1 << 63;

struct Slot<T> {
    /// Sequence stamp: `pos` when free for the enqueuer at `pos`, `pos + 1`
    /// when holding that enqueuer's value, `pos + capacity` once consumed.
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct QueueRing<T> {
    mask: u64,
    /// The replacement ring, once grown.
    next: AtomicPtr<QueueRing<T>>,
    /// Reservation cursor; the high bit closes the ring to new producers.
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    slots: Box<[Slot<T>]>,
}

// === impl QueueRing ===

impl<T> QueueRing<T> {
    fn alloc(capacity: u64) -> *mut Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|seq| Slot {
                seq: AtomicU64::new(seq),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Box::into_raw(Box::new(Self {
            mask: capacity - 1,
            next: AtomicPtr::new(core::ptr::null_mut()),
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
            slots,
        }))
    }

    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    fn is_closed(&self) -> bool {
        self.enqueue_pos.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    /// Closes the ring to new reservations, returning the final reservation
    /// count. In-flight reservations still publish normally.
    fn close(&self) -> u64 {
        self.enqueue_pos.fetch_or(CLOSED_BIT, Ordering::SeqCst) & !CLOSED_BIT
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            if pos & CLOSED_BIT != 0 {
                return Err(value);
            }

            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the reservation CAS grants exclusive access
                        // to this slot until the sequence is published.
                        slot.value.with_mut(|v| unsafe { (*v).write(value) });
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if seq < pos {
                // The slot still holds an unconsumed value: full.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos + 1 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the reservation CAS grants exclusive access
                        // to the published value.
                        let value = slot.value.with_mut(|v| unsafe { (*v).assume_init_read() });
                        slot.seq.store(pos + self.capacity(), Ordering::Release);
                        return Some(value);
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if seq <= pos {
                // Empty, or the producer at `pos` has reserved but not yet
                // published. Either way there is nothing to take here.
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// `true` once every reservation ever made in this ring was consumed.
    fn is_drained(&self) -> bool {
        let enqueued = self.enqueue_pos.load(Ordering::SeqCst) & !CLOSED_BIT;
        let dequeued = self.dequeue_pos.load(Ordering::SeqCst);
        dequeued >= enqueued
    }

    fn len(&self) -> u64 {
        let enqueued = self.enqueue_pos.load(Ordering::Acquire) & !CLOSED_BIT;
        let dequeued = self.dequeue_pos.load(Ordering::Acquire);
        enqueued.saturating_sub(dequeued)
    }
}

pub(crate) struct SharedQueue<T> {
    /// The ring consumers currently drain.
    head: AtomicPtr<QueueRing<T>>,
    /// The ring producers currently fill.
    tail: AtomicPtr<QueueRing<T>>,
    /// Growth lock and arena of every ring ever allocated.
    rings: Mutex<Vec<*mut QueueRing<T>>>,
}

// Safety: values are handed across threads; ring access is mediated by the
// slot sequence protocol.
unsafe impl<T: Send> Send for SharedQueue<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for SharedQueue<T> {}

// === impl SharedQueue ===

impl<T> SharedQueue<T> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(64)
    }

    pub(crate) fn with_capacity(capacity: u64) -> Self {
        let ring = QueueRing::alloc(capacity.next_power_of_two());
        Self {
            head: AtomicPtr::new(ring),
            tail: AtomicPtr::new(ring),
            rings: Mutex::new(vec![ring]),
        }
    }

    /// Enqueues `value`. Any thread. Grows instead of failing.
    pub(crate) fn push(&self, mut value: T) {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: rings are retired to the arena, never freed before drop.
            match unsafe { &*tail }.try_push(value) {
                Ok(()) => return,
                Err(rejected) => {
                    value = rejected;
                    self.grow(tail);
                }
            }
        }
    }

    /// Dequeues the oldest value, draining retired rings first.
    pub(crate) fn try_pop(&self) -> Option<T> {
        loop {
            let head_ptr = self.head.load(Ordering::Acquire);
            // Safety: rings are retired to the arena, never freed before drop.
            let head = unsafe { &*head_ptr };

            if let Some(value) = head.try_pop() {
                return Some(value);
            }

            if head.is_closed() && head.is_drained() {
                let next = head.next.load(Ordering::Acquire);
                if !next.is_null() {
                    // Step past the exhausted ring; a lost race just means
                    // someone else already advanced.
                    let _ = self.head.compare_exchange(
                        head_ptr,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
            }

            return None;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advisory element count across the ring chain.
    pub(crate) fn len(&self) -> u64 {
        let mut total = 0;
        let mut ring_ptr = self.head.load(Ordering::Acquire);
        while !ring_ptr.is_null() {
            // Safety: rings are retired to the arena, never freed before drop.
            let ring = unsafe { &*ring_ptr };
            total += ring.len();
            ring_ptr = ring.next.load(Ordering::Acquire);
        }
        total
    }

    #[cold]
    fn grow(&self, observed_tail: *mut QueueRing<T>) {
        let mut rings = self.rings.lock();

        // Someone else grew while this producer waited for the lock.
        if self.tail.load(Ordering::Relaxed) != observed_tail {
            return;
        }

        // Safety: rings are retired to the arena, never freed before drop.
        let old = unsafe { &*observed_tail };
        let new_capacity = old.capacity() * 2;
        if new_capacity > MAX_CAPACITY {
            // Cannot grow further; producers will spin against consumers.
            return;
        }

        let new = QueueRing::alloc(new_capacity);
        rings.push(new);

        // Close the old ring to new reservations, then publish its successor.
        // In-flight reservations in the old ring finish normally; consumers
        // wait for them through the drain check before advancing.
        old.close();
        old.next.store(new, Ordering::Release);
        self.tail.store(new, Ordering::Release);
    }
}

impl<T> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        // Drop any values still queued, then free the ring chain.
        while self.try_pop().is_some() {}
        for ring in self.rings.get_mut().drain(..) {
            // Safety: created by `Box::into_raw`; all users are gone in drop.
            drop(unsafe { Box::from_raw(ring) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn fifo_through_growth() {
        crate::loom::model(|| {
            let queue = SharedQueue::with_capacity(4);
            for i in 0..100u64 {
                queue.push(i);
            }
            assert_eq!(queue.len(), 100);
            for i in 0..100u64 {
                assert_eq!(queue.try_pop(), Some(i));
            }
            assert_eq!(queue.try_pop(), None);
            assert!(queue.is_empty());
        });
    }

    // Too many interleavings for loom; real threads only.
    #[cfg(not(loom))]
    #[test]
    fn per_producer_order_with_single_consumer() {
        const PER_PRODUCER: u64 = 5_000;
        let queue = Arc::new(SharedQueue::with_capacity(8));

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push((p, i));
                    }
                })
            })
            .collect();

        let mut last_seen = [0u64; 4];
        let mut seen = 0;
        while seen < 4 * PER_PRODUCER {
            if let Some((p, i)) = queue.try_pop() {
                let expected = &mut last_seen[p as usize];
                assert!(
                    i == 0 && *expected == 0 || i == *expected,
                    "producer {p} out of order: got {i}, expected {expected}"
                );
                *expected = i + 1;
                seen += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(queue.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn mpmc_multiset_conservation() {
        const PER_PRODUCER: u64 = 5_000;
        const PRODUCERS: u64 = 3;
        const CONSUMERS: usize = 3;

        let queue = Arc::new(SharedQueue::with_capacity(4));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while !done.load(Ordering::Acquire) || !queue.is_empty() {
                        if let Some(v) = queue.try_pop() {
                            got.push(v);
                        }
                    }
                    got
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::Release);

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "no element delivered twice");
    }

    #[test]
    fn drops_leftover_values() {
        crate::loom::model(|| {
            let tracker = Arc::new(());
            let queue = SharedQueue::with_capacity(4);
            for _ in 0..10 {
                queue.push(tracker.clone());
            }
            drop(queue);
            assert_eq!(Arc::strong_count(&tracker), 1);
        });
    }
}
