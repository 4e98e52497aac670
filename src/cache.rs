// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker task caches.
//!
//! Small tasks are fixed-size slots recycled through the cache of the worker
//! that allocated them. Two lists back this: `free_list` is touched only by
//! the owning worker, and `deferred_free` is an MPSC stack that other threads
//! push onto when they free a task they do not own. The deferred stack is
//! drained lazily into the free list on allocation.

use crate::task::{CACHE_LINE, ExecutionState, TaskFlags, TaskHeader, TaskRef};
use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct TaskCache {
    /// Singly linked list of free slots. Owner worker only.
    free_list: Cell<*mut TaskHeader>,
    /// MPSC stack of slots freed by other threads.
    deferred_free: AtomicPtr<TaskHeader>,
    /// Size of every slot this cache hands out.
    slot_size: usize,
}

// Safety: `free_list` is only accessed by the worker thread owning the cache;
// all cross-thread traffic goes through the `deferred_free` atomic stack.
unsafe impl Send for TaskCache {}
// Safety: see above.
unsafe impl Sync for TaskCache {}

// === impl TaskCache ===

impl TaskCache {
    pub(crate) fn new(slot_size: usize) -> Self {
        // A slot must at least fit a header plus a cache line of payload.
        let slot_size = slot_size.max(size_of::<TaskHeader>() + CACHE_LINE);
        Self {
            free_list: Cell::new(ptr::null_mut()),
            deferred_free: AtomicPtr::new(ptr::null_mut()),
            slot_size,
        }
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn slot_layout(&self) -> Layout {
        // Safety: slot_size is non-zero and CACHE_LINE is a power of two.
        unsafe { Layout::from_size_align_unchecked(self.slot_size, CACHE_LINE) }
    }

    /// Hands out a slot of `slot_size` bytes, reusing freed slots when
    /// possible. Owner worker only.
    pub(crate) fn allocate_slot(&self) -> NonNull<u8> {
        if let Some(slot) = self.pop_free() {
            return slot;
        }

        // Drain everything other threads returned since the last miss.
        let chain = self.deferred_free.swap(ptr::null_mut(), Ordering::AcqRel);
        if !chain.is_null() {
            self.free_list.set(chain);
            if let Some(slot) = self.pop_free() {
                return slot;
            }
        }

        // Safety: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc(self.slot_layout()) };
        let Some(raw) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(self.slot_layout())
        };
        raw
    }

    fn pop_free(&self) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.free_list.get())?;
        // Safety: free-list entries are live slot allocations.
        let next = unsafe { head.as_ref().list_next.load(Ordering::Relaxed) };
        self.free_list.set(next);
        Some(head.cast())
    }

    /// Returns a slot to the free list. Owner worker only.
    fn free_owned(&self, task: TaskRef) {
        task.header()
            .list_next
            .store(self.free_list.get(), Ordering::Relaxed);
        self.free_list.set(task.as_ptr());
    }

    /// Pushes a slot onto the deferred-free stack. Any thread.
    fn free_foreign(&self, task: TaskRef) {
        let mut head = self.deferred_free.load(Ordering::Acquire);
        loop {
            task.header().list_next.store(head, Ordering::Relaxed);
            match self.deferred_free.compare_exchange_weak(
                head,
                task.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }
}

impl Drop for TaskCache {
    fn drop(&mut self) {
        let layout = self.slot_layout();
        let mut free = |mut head: *mut TaskHeader| {
            while let Some(task) = NonNull::new(head) {
                // Safety: chain entries are live slot allocations owned by
                // this cache; payloads were dropped before they were freed.
                unsafe {
                    head = task.as_ref().list_next.load(Ordering::Relaxed);
                    std::alloc::dealloc(task.as_ptr().cast(), layout);
                }
            }
        };
        free(self.free_list.get());
        free(self.deferred_free.swap(ptr::null_mut(), Ordering::AcqRel));
    }
}

/// Releases a task's storage.
///
/// Small tasks return to the cache of the worker that produced them: directly
/// onto the free list when `current` is that cache, through the deferred-free
/// stack otherwise. Everything else is heap-freed in place.
///
/// # Safety
///
/// The task must be quiescent: no other thread may hold a usable reference,
/// and its payload must already have been dropped.
pub(crate) unsafe fn free_task(task: TaskRef, current: Option<&TaskCache>) {
    let header = task.header();
    let owner = header.owner_cache.load(Ordering::Relaxed);

    if task.has_flag(TaskFlags::IS_SMALL) && !owner.is_null() {
        debug_assert_ne!(
            task.execution_state(),
            ExecutionState::Freed,
            "task double free"
        );
        task.set_execution_state(ExecutionState::Freed);

        if current.is_some_and(|cache| ptr::eq(cache, owner)) {
            // Safety: `current` is the owner, so this is the owner thread.
            unsafe { (*owner).free_owned(task) };
        } else {
            // Safety: owner caches outlive every task they produced.
            unsafe { (*owner).free_foreign(task) };
        }
    } else {
        let layout =
            // Safety: recorded at allocation from a valid layout.
            unsafe {
                Layout::from_size_align_unchecked(
                    header.alloc_size as usize,
                    header.alloc_align as usize,
                )
            };
        // Safety: the allocation was produced with exactly this layout.
        unsafe { std::alloc::dealloc(task.as_ptr().cast(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{self, TaskFlags};

    #[test]
    fn slot_reuse_same_thread() {
        let cache = TaskCache::new(256);
        let a = task::allocate_waiter(Some(&cache));
        assert!(a.has_flag(TaskFlags::IS_SMALL));
        let addr = a.as_ptr();
        // Safety: waiter payload is a unit; task is quiescent.
        unsafe {
            a.drop_payload();
            free_task(a, Some(&cache));
        }

        let b = task::allocate_waiter(Some(&cache));
        assert_eq!(b.as_ptr(), addr, "freed slot should be reused");
        // Safety: as above.
        unsafe {
            b.drop_payload();
            free_task(b, Some(&cache));
        }
    }

    #[test]
    fn oversized_payload_takes_heap_path() {
        let cache = TaskCache::new(256);
        let big = task::allocate_closure(Some(&cache), {
            let blob = [0u8; 512];
            move |_ctx| {
                let _keep = &blob;
                None
            }
        });
        assert!(!big.has_flag(TaskFlags::IS_SMALL));
        // Safety: task is quiescent.
        unsafe {
            big.drop_payload();
            free_task(big, Some(&cache));
        }
    }

    #[test]
    fn cross_thread_free_lands_in_deferred_stack() {
        let cache = std::sync::Arc::new(TaskCache::new(256));
        let task = task::allocate_waiter(Some(&cache));
        let addr = task.as_ptr();

        std::thread::spawn(move || {
            // Safety: quiescent; the freeing thread is not the owner, so the
            // free is routed through the deferred stack.
            unsafe {
                task.drop_payload();
                free_task(task, None);
            }
        })
        .join()
        .unwrap();

        // The next owner-side allocation drains the deferred stack.
        let again = task::allocate_waiter(Some(&cache));
        assert_eq!(again.as_ptr(), addr);
        // Safety: as above.
        unsafe {
            again.drop_payload();
            free_task(again, Some(&cache));
        }
    }
}
