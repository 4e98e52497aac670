// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: the unit of work.
//!
//! Every task is a single allocation with a fixed-size [`TaskHeader`] prefix
//! and a variable payload suffix. The header carries the bookkeeping the
//! scheduler needs (parent link, reference count, affinity, execution state,
//! flags); the suffix carries the user's closure or routine argument. Instead
//! of moving tasks around, the scheduler passes [`TaskRef`]s, plain pointers
//! to the header. A `TaskRef` is `Copy`: the reference *count* is managed
//! explicitly through [`TaskRef::add_ref`]/[`TaskRef::remove_ref`] because
//! the count encodes graph structure (live children plus the self reference),
//! not pointer ownership.

use crate::cache::TaskCache;
use crate::id::OwnedId;
use crate::scheduler::SchedulerHandle;
use crate::scheduler::local::LocalScheduler;
use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

/// Affinity value for tasks that may run on any worker.
pub const ANY_WORKER: u32 = u32::MAX;

/// Alignment of every task allocation. Keeps headers off shared cache lines.
pub(crate) const CACHE_LINE: usize = 64;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct TaskFlags: u32 {
        const HAS_DATA_SUFFIX = 1 << 0;
        const IS_CONTINUATION = 1 << 1;
        const IS_STOLEN       = 1 << 2;
        const IS_WAITER       = 1 << 3;
        const IS_SMALL        = 1 << 4;
    }
}

/// Lifecycle of a task allocation.
///
/// Monotonic except for recycling, which moves a still-running task from
/// `Executing` back to `Allocated`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub(crate) enum ExecutionState {
    /// Allocated or recycled.
    Allocated = 0,
    /// In a ready pool (deque, affinity queue or overflow queue).
    Ready = 1,
    /// Currently executing. It will be destroyed on completion.
    Executing = 2,
    /// Sitting on a worker's free list.
    Freed = 3,
}

impl ExecutionState {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Allocated,
            1 => Self::Ready,
            2 => Self::Executing,
            3 => Self::Freed,
            _ => unreachable!("invalid execution state {raw}"),
        }
    }
}

/// Thunk that runs a task's payload. Receives a pointer to the payload suffix.
pub(crate) type CallThunk = unsafe fn(NonNull<u8>, &TaskContext<'_>) -> Option<TaskRef>;
/// Thunk that drops a task's payload in place.
pub(crate) type DropThunk = unsafe fn(NonNull<u8>);

/// How a task executes: a closed sum instead of virtual dispatch.
///
/// `Function` and `Closure` both store their state in the payload suffix and
/// are driven through monomorphized thunks; the distinction is the public
/// construction surface (a plain `fn` plus argument vs. a capturing closure).
/// `Waiter` is the sentinel used to block callers in the dispatch loop; it
/// executes as a no-op.
pub(crate) enum ExecUnit {
    Function {
        call: CallThunk,
        drop: Option<DropThunk>,
    },
    Closure {
        call: CallThunk,
        drop: Option<DropThunk>,
    },
    Waiter,
}

/// The bookkeeping prefix of every task allocation.
#[repr(C)]
pub(crate) struct TaskHeader {
    /// The task whose reference count this task's completion decrements.
    ///
    /// Written by the thread that owns the task pre-publication (or by the
    /// executing thread via continuation transfer); read by the executing
    /// thread at finalization. The deque/queue publication provides the
    /// happens-before edge, so plain relaxed accesses suffice.
    pub(crate) parent: AtomicPtr<TaskHeader>,
    /// Link used by the worker cache free list and deferred-free stack.
    pub(crate) list_next: AtomicPtr<TaskHeader>,
    /// The cache of the worker that produced this allocation; null for
    /// heap-only tasks. Freed small tasks are routed back here.
    pub(crate) owner_cache: AtomicPtr<TaskCache>,
    /// The local scheduler currently associated with this task. Set at
    /// allocation when the allocating thread is a worker of the scheduler's
    /// pool, and unconditionally at dispatch.
    pub(crate) local_scheduler: AtomicPtr<LocalScheduler>,
    /// Signed reference count, initialized to 1 (the self reference).
    pub(crate) ref_count: AtomicI32,
    /// [`ANY_WORKER`] or a mandatory worker index.
    pub(crate) affinity: AtomicU32,
    /// An [`ExecutionState`] discriminant.
    pub(crate) state: AtomicU32,
    /// [`TaskFlags`] bits.
    pub(crate) flags: AtomicU32,
    /// Byte offset from the header to the payload suffix.
    pub(crate) payload_offset: u32,
    /// Total size of the allocation, for the heap free path.
    pub(crate) alloc_size: u32,
    /// Alignment of the allocation, for the heap free path.
    pub(crate) alloc_align: u32,
    /// The execute thunks. Immutable after construction.
    pub(crate) exec: ExecUnit,
}

/// A `Copy` pointer to a task.
///
/// `TaskRef` does not participate in the reference count; the count tracks
/// live children plus the self reference and is manipulated explicitly.
/// Dangling refs past destruction are a caller contract violation, exactly as
/// with the raw pointers this type wraps.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskRef(NonNull<TaskHeader>);

// Safety: all header fields are atomics or immutable after construction; the
// payload suffix is accessed only under the execution-state protocol (the
// single executing thread, or the destroying thread after quiescence).
unsafe impl Send for TaskRef {}
// Safety: see above.
unsafe impl Sync for TaskRef {}

assert_impl_all!(TaskRef: Send, Sync);

/// The context delivered to every task execution.
pub struct TaskContext<'a> {
    /// The scheduler executing the task.
    pub scheduler: &'a SchedulerHandle,
    /// The id of the executing worker.
    pub worker_id: OwnedId,
    /// The task being executed.
    pub task: TaskRef,
    /// The executing worker's user data pointer.
    pub user_data: *mut (),
}

// === impl TaskRef ===

impl TaskRef {
    /// # Safety
    ///
    /// `ptr` must point to a live, initialized [`TaskHeader`].
    pub(crate) unsafe fn from_raw(ptr: NonNull<TaskHeader>) -> Self {
        Self(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut TaskHeader {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn header(&self) -> &TaskHeader {
        // Safety: constructor contract; the header outlives every ref the
        // scheduler hands out.
        unsafe { self.0.as_ref() }
    }

    /// Adds `count` references to the task, returning the new count.
    pub fn add_ref(&self, count: i32, order: Ordering) -> i32 {
        self.header().ref_count.fetch_add(count, order) + count
    }

    /// Removes `count` references from the task, returning the new count.
    pub fn remove_ref(&self, count: i32) -> i32 {
        let new = self.header().ref_count.fetch_sub(count, Ordering::AcqRel) - count;
        debug_assert!(new >= 0, "task reference count underflow");
        new
    }

    /// Overwrites the reference count.
    pub fn set_ref(&self, count: i32, order: Ordering) {
        self.header().ref_count.store(count, order);
    }

    /// The current reference count.
    pub fn ref_count(&self) -> i32 {
        self.header().ref_count.load(Ordering::Acquire)
    }

    /// Forces the task to run on the worker with the given local index.
    pub fn set_affinity(&self, worker_idx: u32) {
        self.header().affinity.store(worker_idx, Ordering::Relaxed);
    }

    /// The current worker affinity, [`ANY_WORKER`] if unset.
    pub fn affinity(&self) -> u32 {
        self.header().affinity.load(Ordering::Relaxed)
    }

    /// `true` if the task was taken from its deque by a thief.
    pub fn is_stolen(&self) -> bool {
        self.has_flag(TaskFlags::IS_STOLEN)
    }

    /// This task's parent, if any.
    pub fn parent(&self) -> Option<TaskRef> {
        NonNull::new(self.header().parent.load(Ordering::Relaxed)).map(TaskRef)
    }

    /// Makes `child` a child of this task *without* touching this task's
    /// reference count: the caller must have reserved a reference up front.
    ///
    /// Reserving references in bulk with [`TaskRef::add_ref`] before forking
    /// avoids one atomic RMW per child. `child` must not already have a
    /// parent.
    pub fn add_child_without_ref(&self, child: TaskRef) {
        debug_assert!(
            child.parent().is_none(),
            "child task already has a parent"
        );
        debug_assert!(
            self.ref_count() > 1,
            "parent must hold a reference for the child"
        );
        child.header().parent.store(self.as_ptr(), Ordering::Relaxed);
    }

    /// Makes `child` a child of this task and bumps this task's reference
    /// count by one. `child` must not already have a parent.
    pub fn add_child_with_ref(&self, child: TaskRef, order: Ordering) {
        debug_assert!(
            child.parent().is_none(),
            "child task already has a parent"
        );
        self.add_ref(1, order);
        child.header().parent.store(self.as_ptr(), Ordering::Relaxed);
    }

    /// Replaces this task with `continuation` in the task graph.
    ///
    /// The continuation inherits this task's parent slot and this task is
    /// detached; when the continuation's own reference count reaches 1 (the
    /// last child completed), the scheduler runs it automatically.
    /// `continuation` must not already have a parent.
    pub fn set_continuation(&self, continuation: TaskRef) {
        debug_assert!(
            continuation.parent().is_none(),
            "continuation task already has a parent"
        );
        continuation.insert_flag(TaskFlags::IS_CONTINUATION);
        let parent = self.header().parent.swap(ptr::null_mut(), Ordering::Relaxed);
        continuation.header().parent.store(parent, Ordering::Relaxed);
    }

    /// Marks the task for reuse after it finishes executing.
    ///
    /// The dispatcher will not destroy the task when execute returns; it looks
    /// freshly allocated instead. If the recycled task is not re-linked into
    /// the graph or returned as the bypass task, it is re-spawned.
    pub fn recycle(&self) {
        debug_assert_eq!(
            self.execution_state(),
            ExecutionState::Executing,
            "only an executing task can recycle itself"
        );
        self.set_execution_state(ExecutionState::Allocated);
    }

    /// Executes other available work until this task's children complete.
    ///
    /// Requires an extra reference reserved for the wait: the wait completes
    /// when the count reaches 2, and the count is reset to 1 on return.
    pub fn wait_for_all(&self) {
        let ls = self.header().local_scheduler.load(Ordering::Acquire);
        assert!(
            !ls.is_null(),
            "waiting task is not bound to a scheduler; wait on a worker thread"
        );
        // Safety: a task's bound local scheduler outlives the task.
        unsafe { (*ls).run_until_done(Some(*self), None) };
    }

    /// Executes `child` immediately, then waits for all of this task's
    /// children as [`TaskRef::wait_for_all`] does.
    pub fn spawn_and_wait_for_all(&self, child: TaskRef) {
        let ls = self.header().local_scheduler.load(Ordering::Acquire);
        assert!(
            !ls.is_null(),
            "waiting task is not bound to a scheduler; wait on a worker thread"
        );
        // Safety: a task's bound local scheduler outlives the task.
        unsafe { (*ls).run_until_done(Some(*self), Some(child)) };
    }

    // --- crate internals ---

    pub(crate) fn execution_state(&self) -> ExecutionState {
        ExecutionState::from_u32(self.header().state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_execution_state(&self, state: ExecutionState) {
        self.header().state.store(state as u32, Ordering::Relaxed);
    }

    pub(crate) fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_retain(self.header().flags.load(Ordering::Relaxed))
    }

    pub(crate) fn has_flag(&self, flag: TaskFlags) -> bool {
        self.flags().contains(flag)
    }

    pub(crate) fn insert_flag(&self, flag: TaskFlags) {
        self.header().flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub(crate) fn is_continuation(&self) -> bool {
        self.has_flag(TaskFlags::IS_CONTINUATION)
    }

    pub(crate) fn bind_local_scheduler(&self, ls: *const LocalScheduler) {
        self.header()
            .local_scheduler
            .store(ls.cast_mut(), Ordering::Release);
    }

    fn payload_ptr(&self) -> NonNull<u8> {
        let offset = self.header().payload_offset as usize;
        // Safety: the allocation extends `payload_offset` bytes past the header.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(offset)) }
    }

    /// Runs the task's payload.
    ///
    /// # Safety
    ///
    /// The caller must be the sole executor of this task (the dispatcher's
    /// execution-state protocol guarantees this).
    pub(crate) unsafe fn execute(&self, ctx: &TaskContext<'_>) -> Option<TaskRef> {
        match &self.header().exec {
            ExecUnit::Function { call, .. } | ExecUnit::Closure { call, .. } => {
                let call = *call;
                // Safety: thunk monomorphized against the payload written at
                // allocation; exclusivity ensured by caller.
                unsafe { call(self.payload_ptr(), ctx) }
            }
            ExecUnit::Waiter => None,
        }
    }

    /// Drops the payload suffix in place.
    ///
    /// # Safety
    ///
    /// The payload must be live and no other thread may access it. Must be
    /// called at most once per allocation cycle.
    pub(crate) unsafe fn drop_payload(&self) {
        let drop = match &self.header().exec {
            ExecUnit::Function { drop, .. } | ExecUnit::Closure { drop, .. } => *drop,
            ExecUnit::Waiter => None,
        };
        if let Some(drop) = drop {
            // Safety: ensured by caller.
            unsafe { drop(self.payload_ptr()) };
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("addr", &self.0)
            .field("refs", &self.ref_count())
            .field("state", &self.execution_state())
            .finish()
    }
}

impl fmt::Pointer for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

// === allocation ===

const fn payload_offset_for(align: usize) -> usize {
    let align = if align == 0 { 1 } else { align };
    (mem::size_of::<TaskHeader>() + align - 1) & !(align - 1)
}

/// Allocates and initializes a task carrying `payload`, driven by `exec`.
///
/// Small payloads go through `cache` when one is available; everything else
/// takes the heap path. Heap allocation failure is fatal.
pub(crate) fn allocate<P>(
    cache: Option<&TaskCache>,
    exec: ExecUnit,
    payload: P,
    extra_flags: TaskFlags,
) -> TaskRef {
    let offset = payload_offset_for(mem::align_of::<P>());
    let needed = offset + mem::size_of::<P>();

    let mut flags = extra_flags;
    if mem::size_of::<P>() > 0 {
        flags |= TaskFlags::HAS_DATA_SUFFIX;
    }

    let (ptr, owner, alloc_size, alloc_align) = match cache {
        Some(cache) if mem::align_of::<P>() <= CACHE_LINE && needed <= cache.slot_size() => {
            flags |= TaskFlags::IS_SMALL;
            (
                cache.allocate_slot(),
                ptr::from_ref(cache).cast_mut(),
                cache.slot_size(),
                CACHE_LINE,
            )
        }
        _ => {
            let align = CACHE_LINE.max(mem::align_of::<P>());
            let size = needed.max(mem::size_of::<TaskHeader>());
            // Safety: size and align are non-zero and valid.
            let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
            // Safety: layout has non-zero size.
            let raw = unsafe { std::alloc::alloc(layout) };
            let Some(raw) = NonNull::new(raw) else {
                std::alloc::handle_alloc_error(layout)
            };
            (raw, ptr::null_mut(), size, align)
        }
    };

    let header = ptr.cast::<TaskHeader>();
    // Safety: `ptr` is a fresh (or recycled, quiescent) allocation large
    // enough for the header plus `offset + size_of::<P>()` bytes.
    unsafe {
        header.write(TaskHeader {
            parent: AtomicPtr::new(ptr::null_mut()),
            list_next: AtomicPtr::new(ptr::null_mut()),
            owner_cache: AtomicPtr::new(owner),
            local_scheduler: AtomicPtr::new(ptr::null_mut()),
            ref_count: AtomicI32::new(1),
            affinity: AtomicU32::new(ANY_WORKER),
            state: AtomicU32::new(ExecutionState::Allocated as u32),
            flags: AtomicU32::new(flags.bits()),
            payload_offset: offset as u32,
            alloc_size: alloc_size as u32,
            alloc_align: alloc_align as u32,
            exec,
        });
        ptr.cast::<u8>().add(offset).cast::<P>().write(payload);
        TaskRef::from_raw(header)
    }
}

/// Allocates a task from a closure.
pub(crate) fn allocate_closure<F>(cache: Option<&TaskCache>, f: F) -> TaskRef
where
    F: FnMut(&TaskContext<'_>) -> Option<TaskRef> + Send + 'static,
{
    let exec = ExecUnit::Closure {
        call: closure_call::<F>,
        drop: mem::needs_drop::<F>().then_some(drop_payload_in_place::<F> as DropThunk),
    };
    allocate(cache, exec, f, TaskFlags::empty())
}

/// Payload of a function-pointer task: the routine plus its argument.
struct RoutinePayload<T> {
    routine: fn(&mut T, &TaskContext<'_>) -> Option<TaskRef>,
    data: T,
}

/// Allocates a task from a plain function pointer plus argument.
pub(crate) fn allocate_routine<T>(
    cache: Option<&TaskCache>,
    routine: fn(&mut T, &TaskContext<'_>) -> Option<TaskRef>,
    data: T,
) -> TaskRef
where
    T: Send + 'static,
{
    let exec = ExecUnit::Function {
        call: routine_call::<T>,
        drop: mem::needs_drop::<T>()
            .then_some(drop_payload_in_place::<RoutinePayload<T>> as DropThunk),
    };
    allocate(cache, exec, RoutinePayload { routine, data }, TaskFlags::empty())
}

/// Allocates a waiter sentinel task.
pub(crate) fn allocate_waiter(cache: Option<&TaskCache>) -> TaskRef {
    allocate(cache, ExecUnit::Waiter, (), TaskFlags::IS_WAITER)
}

unsafe fn closure_call<F>(payload: NonNull<u8>, ctx: &TaskContext<'_>) -> Option<TaskRef>
where
    F: FnMut(&TaskContext<'_>) -> Option<TaskRef>,
{
    // Safety: the dispatcher holds exclusive payload access during execute.
    unsafe { (*payload.cast::<F>().as_ptr())(ctx) }
}

unsafe fn routine_call<T>(payload: NonNull<u8>, ctx: &TaskContext<'_>) -> Option<TaskRef> {
    // Safety: the dispatcher holds exclusive payload access during execute.
    unsafe {
        let payload = payload.cast::<RoutinePayload<T>>().as_ptr();
        ((*payload).routine)(&mut (*payload).data, ctx)
    }
}

unsafe fn drop_payload_in_place<T>(payload: NonNull<u8>) {
    // Safety: ensured by `drop_payload`'s contract.
    unsafe { payload.cast::<T>().drop_in_place() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn destroy(task: TaskRef) {
        // Safety: test-local tasks, quiescent.
        unsafe {
            task.drop_payload();
            cache::free_task(task, None);
        }
    }

    #[test]
    fn fresh_task_invariants() {
        let task = allocate_waiter(None);
        assert_eq!(task.ref_count(), 1);
        assert_eq!(task.affinity(), ANY_WORKER);
        assert_eq!(task.execution_state(), ExecutionState::Allocated);
        assert!(task.parent().is_none());
        assert!(task.has_flag(TaskFlags::IS_WAITER));
        assert!(!task.has_flag(TaskFlags::IS_SMALL));
        destroy(task);
    }

    #[test]
    fn ref_count_arithmetic() {
        let task = allocate_waiter(None);
        assert_eq!(task.add_ref(3, Ordering::Relaxed), 4);
        assert_eq!(task.remove_ref(1), 3);
        task.set_ref(1, Ordering::Relaxed);
        assert_eq!(task.ref_count(), 1);
        destroy(task);
    }

    #[test]
    fn child_linkage() {
        let parent = allocate_waiter(None);
        let a = allocate_waiter(None);
        let b = allocate_waiter(None);

        parent.add_ref(1, Ordering::Relaxed);
        parent.add_child_without_ref(a);
        assert_eq!(a.parent(), Some(parent));
        assert_eq!(parent.ref_count(), 2);

        parent.add_child_with_ref(b, Ordering::Relaxed);
        assert_eq!(b.parent(), Some(parent));
        assert_eq!(parent.ref_count(), 3);

        destroy(b);
        destroy(a);
        destroy(parent);
    }

    #[test]
    fn continuation_inherits_parent_slot() {
        let grandparent = allocate_waiter(None);
        let task = allocate_waiter(None);
        let cont = allocate_waiter(None);

        grandparent.add_ref(1, Ordering::Relaxed);
        grandparent.add_child_without_ref(task);

        task.set_continuation(cont);
        assert_eq!(cont.parent(), Some(grandparent));
        assert!(task.parent().is_none());
        assert!(cont.has_flag(TaskFlags::IS_CONTINUATION));

        destroy(cont);
        destroy(task);
        destroy(grandparent);
    }

    #[test]
    fn recycle_resets_state() {
        let task = allocate_waiter(None);
        task.set_execution_state(ExecutionState::Executing);
        task.recycle();
        assert_eq!(task.execution_state(), ExecutionState::Allocated);
        destroy(task);
    }

    #[test]
    fn closure_payload_dropped_exactly_once() {
        struct DropCount(Arc<AtomicUsize>);
        impl Drop for DropCount {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let tracker = DropCount(drops.clone());
        let task = allocate_closure(None, move |_ctx| {
            let _keep = &tracker;
            None
        });
        assert!(task.has_flag(TaskFlags::HAS_DATA_SUFFIX));
        destroy(task);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn routine_payload_roundtrip() {
        let task = allocate_routine(None, |data: &mut u64, _ctx| {
            *data += 1;
            None
        }, 41u64);
        assert!(task.has_flag(TaskFlags::HAS_DATA_SUFFIX));
        destroy(task);
    }
}
