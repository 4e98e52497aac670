// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Chase-Lev work-stealing deque.
//!
//! One deque per (worker, priority). The owning worker pushes and pops at the
//! *back*; thieves steal from the *front*. Indices are monotonic u64 values
//! taken modulo a power-of-two ring capacity. The ring grows by doubling
//! under a producer-side lock; retired rings are kept alive until the deque
//! drops because a thief may still be reading through a stale ring pointer;
//! a stale ring is always large enough to hold `front..back`, since rings
//! only ever grow.
//!
//! After Chase & Lev, "Dynamic Circular Work-Stealing Deque", with the
//! memory-order improvements of Lê et al., "Correct and Efficient
//! Work-Stealing for Weak Memory Models" (PPoPP '13).

use crate::loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use crate::task::{TaskHeader, TaskRef};
use core::ptr::NonNull;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

/// Half the index range, so `back - front` stays representable.
const MAX_CAPACITY: u64 = u64::MAX / 2;

struct Ring {
    mask: u64,
    slots: Box<[AtomicPtr<TaskHeader>]>,
}

impl Ring {
    fn alloc(capacity: u64) -> *mut Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect();
        Box::into_raw(Box::new(Self {
            mask: capacity - 1,
            slots,
        }))
    }

    #[inline]
    fn slot(&self, index: u64) -> &AtomicPtr<TaskHeader> {
        &self.slots[(index & self.mask) as usize]
    }

    fn capacity(&self) -> u64 {
        self.mask + 1
    }
}

pub(crate) struct TaskDeque {
    /// The next item to steal. Bumped by CAS from any thread.
    front: CachePadded<AtomicU64>,
    /// One past the last item. Written only by the owner.
    back: CachePadded<AtomicU64>,
    /// The live ring. Swapped by the owner during growth; thieves tolerate a
    /// stale pointer.
    ring: AtomicPtr<Ring>,
    /// Serializes growth and owns every retired ring until drop.
    retired: Mutex<Vec<*mut Ring>>,
    /// Owner-side push counter.
    pushes: AtomicU64,
}

// Safety: ring slots are atomics and the ring pointers are only freed at
// drop; push/pop are restricted to the owning worker by protocol.
unsafe impl Send for TaskDeque {}
// Safety: see above.
unsafe impl Sync for TaskDeque {}

// === impl TaskDeque ===

impl TaskDeque {
    pub(crate) fn new() -> Self {
        Self::with_capacity(256)
    }

    pub(crate) fn with_capacity(capacity: u64) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            // Indices start at 1 so the owner's speculative `back - 1` in
            // `try_pop` never wraps below zero.
            front: CachePadded::new(AtomicU64::new(1)),
            back: CachePadded::new(AtomicU64::new(1)),
            ring: AtomicPtr::new(Ring::alloc(capacity)),
            retired: Mutex::new(Vec::new()),
            pushes: AtomicU64::new(0),
        }
    }

    /// Number of queued tasks. Racy; advisory only.
    pub(crate) fn len(&self) -> u64 {
        let front = self.front.load(Ordering::Acquire);
        let back = self.back.load(Ordering::Acquire);
        back.saturating_sub(front)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of successful pushes over the deque's lifetime.
    pub(crate) fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Pushes a task at the back. Owner only.
    ///
    /// Fails only when the ring cannot grow past [`MAX_CAPACITY`].
    pub(crate) fn try_push(&self, task: TaskRef) -> bool {
        let back = self.back.load(Ordering::Relaxed);
        // Sync with front movement from thieves; back is ours alone.
        let front = self.front.load(Ordering::Acquire);
        // Safety: the owner observes its own latest ring pointer.
        let mut ring = unsafe { &*self.ring.load(Ordering::Relaxed) };

        if back.wrapping_sub(front) + 1 > ring.capacity() {
            if !self.grow(front, back) {
                return false;
            }
            // Safety: `grow` just published the replacement ring.
            ring = unsafe { &*self.ring.load(Ordering::Relaxed) };
        }

        ring.slot(back).store(task.as_ptr(), Ordering::Relaxed);
        // Publish the element to thieves.
        self.back.store(back.wrapping_add(1), Ordering::Release);
        self.pushes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pops the most recently pushed task from the back. Owner only.
    pub(crate) fn try_pop(&self) -> Option<TaskRef> {
        let back = self.back.load(Ordering::Relaxed).wrapping_sub(1);
        // Safety: the owner observes its own latest ring pointer.
        let ring = unsafe { &*self.ring.load(Ordering::Relaxed) };

        // Claim the slot before reading front; the total order against the
        // thieves' front CAS decides the last-element race.
        self.back.store(back, Ordering::SeqCst);

        let front = self.front.load(Ordering::Relaxed);

        if (back.wrapping_sub(front) as i64) < 0 {
            // Empty. Restore back.
            self.back.store(back.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let raw = ring.slot(back).load(Ordering::Relaxed);
        // Safety: slots between front and the old back always hold tasks.
        let task = unsafe { TaskRef::from_raw(NonNull::new_unchecked(raw)) };

        if back == front {
            // Last element: race the thieves for it.
            let won = self
                .front
                .compare_exchange(
                    front,
                    front.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok();
            self.back.store(back.wrapping_add(1), Ordering::Relaxed);
            return won.then_some(task);
        }

        Some(task)
    }

    /// Steals the oldest task from the front. Any thread.
    pub(crate) fn try_steal(&self) -> Option<TaskRef> {
        let backoff = Backoff::new();
        loop {
            let front = self.front.load(Ordering::Acquire);

            // Cheap emptiness check before the fenced load.
            let back = self.back.load(Ordering::Acquire);
            if (back.wrapping_sub(front) as i64) <= 0 {
                return None;
            }

            let back = self.back.load(Ordering::SeqCst);
            if (back.wrapping_sub(front) as i64) <= 0 {
                return None;
            }

            // Read the element through the ring snapshot before racing front
            // upward. A stale ring still covers front..back.
            // Safety: retired rings stay alive until the deque drops.
            let ring = unsafe { &*self.ring.load(Ordering::Acquire) };
            let raw = ring.slot(front).load(Ordering::Relaxed);

            if self
                .front
                .compare_exchange(
                    front,
                    front.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Safety: winning the CAS means the slot we read was live.
                return Some(unsafe { TaskRef::from_raw(NonNull::new_unchecked(raw)) });
            }

            // Race lost to the owner or another thief; go again.
            backoff.spin();
        }
    }

    /// Doubles the ring. Owner only; serialized by the retirement lock.
    #[cold]
    fn grow(&self, front: u64, back: u64) -> bool {
        let mut retired = self.retired.lock();

        let old_ptr = self.ring.load(Ordering::Relaxed);
        // Safety: the owner observes its own latest ring pointer.
        let old = unsafe { &*old_ptr };
        let new_capacity = old.capacity() * 2;
        if new_capacity > MAX_CAPACITY {
            return false;
        }

        let new_ptr = Ring::alloc(new_capacity);
        // Safety: freshly allocated; not yet visible to anyone else.
        let new = unsafe { &*new_ptr };
        for index in front..back {
            new.slot(index)
                .store(old.slot(index).load(Ordering::Relaxed), Ordering::Relaxed);
        }

        // Publish the new ring before the next push publishes `back + 1`; a
        // thief that acquires the new back is guaranteed to see it.
        self.ring.store(new_ptr, Ordering::Release);

        // The old ring stays alive until drop: thieves may still read it.
        retired.push(old_ptr);
        true
    }
}

impl Drop for TaskDeque {
    fn drop(&mut self) {
        // Safety: all ring pointers were created by `Box::into_raw` and no
        // reader outlives the deque.
        unsafe {
            drop(Box::from_raw(self.ring.load(Ordering::Relaxed)));
            for ring in self.retired.get_mut().drain(..) {
                drop(Box::from_raw(ring));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use crate::task;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn dummy_tasks(n: usize) -> Vec<TaskRef> {
        (0..n).map(|_| task::allocate_waiter(None)).collect()
    }

    fn destroy_all(tasks: impl IntoIterator<Item = TaskRef>) {
        for task in tasks {
            // Safety: test-local waiters, quiescent.
            unsafe {
                task.drop_payload();
                cache::free_task(task, None);
            }
        }
    }

    #[test]
    fn owner_pop_is_lifo() {
        crate::loom::model(|| {
            let deque = TaskDeque::with_capacity(8);
            let tasks = dummy_tasks(3);
            for &t in &tasks {
                assert!(deque.try_push(t));
            }
            assert_eq!(deque.try_pop(), Some(tasks[2]));
            assert_eq!(deque.try_pop(), Some(tasks[1]));
            assert_eq!(deque.try_pop(), Some(tasks[0]));
            assert_eq!(deque.try_pop(), None);
            destroy_all(tasks);
        });
    }

    #[test]
    fn steal_is_fifo() {
        crate::loom::model(|| {
            let deque = TaskDeque::with_capacity(8);
            let tasks = dummy_tasks(3);
            for &t in &tasks {
                assert!(deque.try_push(t));
            }
            assert_eq!(deque.try_steal(), Some(tasks[0]));
            assert_eq!(deque.try_steal(), Some(tasks[1]));
            assert_eq!(deque.try_steal(), Some(tasks[2]));
            assert_eq!(deque.try_steal(), None);
            destroy_all(tasks);
        });
    }

    #[test]
    fn growth_preserves_contents_across_wraparound() {
        crate::loom::model(|| {
            // Tiny initial capacity so pushes straddle several power-of-two
            // boundaries while the indices wrap the ring repeatedly.
            let deque = TaskDeque::with_capacity(2);
            let mut expected = HashSet::new();

            // Interleave pushes and pops to shift the window off index zero.
            let churn = dummy_tasks(3);
            for &t in &churn {
                assert!(deque.try_push(t));
                assert_eq!(deque.try_pop(), Some(t));
            }

            let tasks = dummy_tasks(100);
            for &t in &tasks {
                assert!(deque.try_push(t));
                expected.insert(t.as_ptr() as usize);
            }
            assert_eq!(deque.len(), 100);

            let mut got = HashSet::new();
            while let Some(t) = deque.try_pop() {
                got.insert(t.as_ptr() as usize);
            }
            assert_eq!(got, expected);
            destroy_all(tasks);
            destroy_all(churn);
        });
    }

    // Far too many interleavings for loom; exercised with real threads only.
    #[cfg(not(loom))]
    #[test]
    fn concurrent_multiset_conservation() {
        const TASKS: usize = 10_000;
        const THIEVES: usize = 3;

        let deque = Arc::new(TaskDeque::with_capacity(4));
        let tasks = dummy_tasks(TASKS);
        let expected: HashSet<usize> = tasks.iter().map(|t| t.as_ptr() as usize).collect();

        let done = Arc::new(AtomicBool::new(false));
        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = deque.clone();
                let done = done.clone();
                crate::loom::thread::spawn(move || {
                    let mut stolen = Vec::new();
                    while !done.load(Ordering::Acquire) || !deque.is_empty() {
                        if let Some(t) = deque.try_steal() {
                            stolen.push(t.as_ptr() as usize);
                        }
                    }
                    stolen
                })
            })
            .collect();

        // The owner interleaves pushes (forcing repeated growth) and pops.
        let mut popped = Vec::new();
        for (i, &t) in tasks.iter().enumerate() {
            assert!(deque.try_push(t));
            if i % 3 == 0
                && let Some(t) = deque.try_pop()
            {
                popped.push(t.as_ptr() as usize);
            }
        }
        while let Some(t) = deque.try_pop() {
            popped.push(t.as_ptr() as usize);
        }
        done.store(true, Ordering::Release);

        let mut all: Vec<usize> = popped;
        for thief in thieves {
            all.extend(thief.join().unwrap());
        }

        assert_eq!(all.len(), TASKS, "every task popped or stolen exactly once");
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique, expected);
        destroy_all(tasks);
    }
}
