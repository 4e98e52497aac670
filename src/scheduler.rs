// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The micro-scheduler facade.
//!
//! A [`MicroScheduler`] binds one [`LocalScheduler`] per worker of a
//! [`WorkerPool`][crate::WorkerPool] and fronts the whole task lifecycle:
//! allocation, spawning (deque, affinity queue or overflow queue, plus worker
//! wakes), waiting, destruction, external victim registration and
//! check-for-task callbacks. Independent micro-schedulers compose through
//! external stealing: a thief registers another scheduler as a victim and its
//! idle top-level workers pull work across before quitting.

pub(crate) mod local;

use crate::cache;
use crate::error::SchedulerInitError;
use crate::id::{self, OwnedId};
use crate::pool::{PoolInner, WorkerPool};
use crate::queue::SharedQueue;
use crate::task::{self, ANY_WORKER, ExecutionState, TaskContext, TaskRef};
use crate::worker::{self, WorkerState};
use core::fmt;
use core::ops::Deref;
use crossbeam_utils::Backoff;
use local::LocalScheduler;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Configuration for a [`MicroScheduler`].
#[derive(Debug, Clone)]
pub struct MicroSchedulerDesc {
    /// Number of priority lanes, indexed `0..priority_count` with zero the
    /// highest. Must be at least 1.
    pub priority_count: usize,
    /// Number of task executions between priority-boost rounds.
    pub priority_boost_age: i32,
    /// Debug label.
    pub name: String,
}

impl Default for MicroSchedulerDesc {
    fn default() -> Self {
        Self {
            priority_count: 1,
            priority_boost_age: i32::MAX,
            name: String::new(),
        }
    }
}

/// Check-for-task callback: invoked by an idle worker after local, affinity
/// and steal fetches all came up empty. Returning a task hands it to the
/// worker for immediate execution.
pub type CheckForTaskFn = Box<dyn Fn(OwnedId) -> Option<TaskRef> + Send + Sync>;

/// Handle returned from [`SchedulerHandle::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

pub(crate) struct ExternalLists {
    pub(crate) victims: Vec<Arc<SchedulerCore>>,
    pub(crate) thieves: Vec<Weak<SchedulerCore>>,
}

/// Victim/thief registration state of one scheduler.
pub(crate) struct ExternalSchedulers {
    pub(crate) lists: RwLock<ExternalLists>,
    /// Number of thieves currently walking this scheduler's deques. Removal
    /// waits for this to drain.
    pub(crate) thief_access: AtomicU32,
    /// Racy victim-count mirror; a coarse filter only, the authoritative
    /// check is the list walk under the lock.
    victim_count: AtomicUsize,
}

// === impl ExternalSchedulers ===

impl ExternalSchedulers {
    fn new() -> Self {
        Self {
            lists: RwLock::new(ExternalLists {
                victims: Vec::new(),
                thieves: Vec::new(),
            }),
            thief_access: AtomicU32::new(0),
            victim_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn has_victims(&self) -> bool {
        self.victim_count.load(Ordering::Relaxed) > 0
    }

    fn sync_victim_count(&self, lists: &ExternalLists) {
        self.victim_count.store(lists.victims.len(), Ordering::Relaxed);
    }
}

pub(crate) struct SchedulerCore {
    pub(crate) id: u16,
    pub(crate) name: String,
    pub(crate) priority_count: usize,
    is_attached: AtomicBool,
    pub(crate) pool: Arc<PoolInner>,
    /// One local scheduler per pool worker, index-aligned.
    pub(crate) locals: Box<[LocalScheduler]>,
    /// One MPMC queue per priority for tasks submitted by threads that are
    /// not workers of the pool.
    pub(crate) overflow: Box<[SharedQueue<TaskRef>]>,
    pub(crate) externals: ExternalSchedulers,
    pub(crate) callbacks: RwLock<Vec<(u64, CheckForTaskFn)>>,
    next_callback_id: AtomicU64,
    creation_thread: ThreadId,
}

// === impl SchedulerCore ===

impl SchedulerCore {
    #[inline]
    pub(crate) fn is_attached(&self) -> bool {
        self.is_attached.load(Ordering::Relaxed)
    }

    /// Tells every dispatch loop to exit at its next iteration boundary.
    pub(crate) fn detach(&self) {
        self.is_attached.store(false, Ordering::Release);
    }

    pub(crate) fn local(&self, index: usize) -> &LocalScheduler {
        &self.locals[index]
    }

    pub(crate) fn has_deque_tasks(&self) -> bool {
        self.locals.iter().any(LocalScheduler::has_deque_tasks)
    }

    pub(crate) fn has_affinity_tasks(&self) -> bool {
        self.locals.iter().any(LocalScheduler::has_affinity_tasks)
    }

    pub(crate) fn has_queue_tasks(&self) -> bool {
        self.overflow.iter().any(|queue| !queue.is_empty())
    }

    pub(crate) fn total_deque_pushes(&self) -> u64 {
        self.locals.iter().map(LocalScheduler::deque_push_count).sum()
    }

    /// Wakes workers on the home pool and, optionally, the pools of every
    /// thief registered against this scheduler.
    pub(crate) fn wake_workers(
        &self,
        caller: Option<&WorkerState>,
        count: u32,
        reset: bool,
        wake_thieves: bool,
    ) {
        self.pool.wake_worker(caller, count, reset);

        if wake_thieves
            && let Some(lists) = self.externals.lists.try_read()
        {
            for thief in lists.thieves.iter().filter_map(Weak::upgrade) {
                thief.pool.wake_worker(None, 1, reset);
            }
        }
    }
}

impl fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workers", &self.locals.len())
            .finish_non_exhaustive()
    }
}

/// A cloneable, task-facing handle to a scheduler. This is what
/// [`TaskContext::scheduler`] carries; dropping it never shuts the scheduler
/// down.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) core: Arc<SchedulerCore>,
}

/// The owning handle: shuts the scheduler down on drop. Created on some
/// thread; that same thread must shut it down.
pub struct MicroScheduler {
    handle: SchedulerHandle,
}

// === impl SchedulerHandle ===

impl SchedulerHandle {
    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// The calling thread's worker state, whichever pool it belongs to.
    fn current_worker(&self) -> Option<&WorkerState> {
        // Safety: worker states live as long as their pool, which this
        // handle keeps alive through the core.
        unsafe { worker::current_worker_ref(&self.core.pool.tls) }
    }

    /// The calling thread's worker state, only if it is a worker of this
    /// scheduler's pool.
    fn current_pool_worker(&self) -> Option<&WorkerState> {
        self.current_worker()
            .filter(|w| w.id.owner_id() == self.core.pool.pool_id)
    }

    /// Allocates a task from a closure. The returned task is `Allocated`,
    /// with one reference, no parent and no affinity.
    pub fn allocate_task<F>(&self, f: F) -> TaskRef
    where
        F: FnMut(&TaskContext<'_>) -> Option<TaskRef> + Send + 'static,
    {
        let worker = self.current_worker();
        let task = task::allocate_closure(worker.map(|w| &w.cache), f);
        self.bind_if_local(worker, task);
        task
    }

    /// Allocates a task from a plain function and its argument.
    pub fn allocate_routine_task<T>(
        &self,
        routine: fn(&mut T, &TaskContext<'_>) -> Option<TaskRef>,
        data: T,
    ) -> TaskRef
    where
        T: Send + 'static,
    {
        let worker = self.current_worker();
        let task = task::allocate_routine(worker.map(|w| &w.cache), routine, data);
        self.bind_if_local(worker, task);
        task
    }

    fn bind_if_local(&self, worker: Option<&WorkerState>, task: TaskRef) {
        if let Some(worker) = worker
            && worker.id.owner_id() == self.core.pool.pool_id
        {
            let index = worker.id.local_id() as usize;
            task.bind_local_scheduler(self.core.local(index));
        }
    }

    /// Spawns `task` at `priority`.
    ///
    /// Routing: a mandatory affinity sends the task to that worker's affinity
    /// queue; a caller that is a worker of this scheduler's pool pushes onto
    /// its own deque; everything else goes through the overflow queue. In all
    /// cases sleeping workers (and registered thief schedulers) are woken.
    pub fn spawn_task(&self, task: TaskRef, priority: u32) {
        let core = &self.core;
        debug_assert!(
            !task.is_continuation(),
            "cannot spawn a continuation; it is scheduled by its last child"
        );
        debug_assert!(
            (priority as usize) < core.priority_count,
            "priority out of range"
        );
        let priority = (priority as usize).min(core.priority_count - 1);

        task.set_execution_state(ExecutionState::Ready);

        let affinity = task.affinity();
        if affinity != ANY_WORKER {
            debug_assert!(
                (affinity as usize) < core.locals.len(),
                "affinity worker index out of range"
            );
            let index = (affinity as usize) % core.locals.len();
            tracing::trace!(task = ?task, worker = index, "spawning affinity task");
            core.local(index).queue_affinity(task, priority);
            // Forced wake: even if the worker is not blocked, latch its
            // semaphore so a sleep racing this submission falls through.
            core.pool.workers[index].wake(1, false, true);
            return;
        }

        if let Some(worker) = self.current_pool_worker() {
            tracing::trace!(task = ?task, worker = %worker.id, "spawning local task");
            let index = worker.id.local_id() as usize;
            let pushed = core.local(index).spawn_local(task, priority);
            debug_assert!(pushed, "local deque exhausted its address space");
            core.wake_workers(Some(worker), 1, true, true);
        } else {
            tracing::trace!(task = ?task, "queueing off-pool task");
            core.overflow[priority].push(task);
            core.wake_workers(None, 1, true, true);
        }
    }

    /// Spawns `task` under a freshly allocated waiter and blocks the caller
    /// (executing other work) until it and all of its children complete.
    pub fn spawn_task_and_wait(&self, task: TaskRef, priority: u32) {
        let waiter = task::allocate_waiter(self.current_worker().map(|w| &w.cache));
        // Self + child + wait sentinel; the wait ref distinguishes the
        // waiter from a continuation.
        waiter.set_ref(3, Ordering::Relaxed);
        waiter.add_child_without_ref(task);

        match self.current_pool_worker() {
            Some(worker)
                if task.affinity() == ANY_WORKER
                    || task.affinity() == u32::from(worker.id.local_id()) =>
            {
                // Run the child directly, without a scheduler round-trip.
                let index = worker.id.local_id() as usize;
                self.core
                    .local(index)
                    .run_until_done(Some(waiter), Some(task));
                debug_assert_eq!(waiter.ref_count(), 1);
            }
            _ => {
                self.spawn_task(task, priority);
                self.wait_until(waiter);
            }
        }

        // Safety: the wait completed, nothing references the waiter anymore.
        unsafe { self.destroy_task(waiter) };
    }

    /// Drives the dispatch loop until `task`'s reference count falls to 2
    /// (then resets it to 1). Requires the extra wait reference, exactly like
    /// [`TaskRef::wait_for_all`].
    pub fn wait_for(&self, task: TaskRef) {
        self.wait_until(task);
    }

    /// Executes available work on the calling worker until none is left.
    /// A no-op on threads that are not workers of this scheduler's pool.
    pub fn wait_for_all(&self) {
        if let Some(worker) = self.current_pool_worker() {
            let index = worker.id.local_id() as usize;
            self.core.local(index).run_until_done(None, None);
        }
    }

    fn wait_until(&self, waiting: TaskRef) {
        if let Some(worker) = self.current_pool_worker() {
            let index = worker.id.local_id() as usize;
            self.core.local(index).run_until_done(Some(waiting), None);
        } else {
            // Not a worker of any pool we know: spin with backoff, waking
            // workers until the count condition is met.
            self.core.wake_workers(None, 1, true, true);
            let backoff = Backoff::new();
            while waiting.ref_count() > 2 {
                backoff.snooze();
                self.core.wake_workers(None, 1, true, true);
            }
            waiting.set_ref(1, Ordering::Relaxed);
        }
    }

    /// Destroys a task that was never spawned (or whose ownership was handed
    /// back to the caller): drops the payload, frees the storage, and, if
    /// the task had a parent, performs the same parent finalization as the
    /// dispatcher does after execution.
    ///
    /// # Safety
    ///
    /// The task must be quiescent: not queued anywhere, not executing, and no
    /// other thread may use its `TaskRef` afterwards.
    pub unsafe fn destroy_task(&self, task: TaskRef) {
        tracing::trace!(task = ?task, "destroying task");
        let parent = task.parent();

        // Safety: quiescence is the caller's contract.
        unsafe {
            task.drop_payload();
            cache::free_task(task, self.current_worker().map(|w| &w.cache));
        }

        if let Some(parent) = parent {
            if parent.ref_count() == 2 {
                parent.set_ref(1, Ordering::Relaxed);
            } else if parent.remove_ref(1) > 1 {
                return;
            }
            self.spawn_task(parent, 0);
        }
    }

    /// Registers `victim` so this scheduler's idle workers may steal from it.
    /// Self-victimization is forbidden.
    pub fn add_external_victim(&self, victim: &SchedulerHandle) {
        assert!(
            !Arc::ptr_eq(&self.core, &victim.core),
            "self victimization is not allowed"
        );
        tracing::debug!(thief = self.core.id, victim = victim.core.id, "registering victim");

        {
            let mut lists = self.core.externals.lists.write();
            debug_assert!(
                !lists
                    .victims
                    .iter()
                    .any(|v| Arc::ptr_eq(v, &victim.core)),
                "scheduler is already a victim"
            );
            lists.victims.push(victim.core.clone());
            self.core.externals.sync_victim_count(&lists);
        }

        // Let the victim know we are a thief, so its spawns wake us.
        let mut victim_lists = victim.core.externals.lists.write();
        victim_lists.thieves.push(Arc::downgrade(&self.core));
    }

    /// Removes a previously registered victim. Blocks until every thief
    /// currently inside the victim has backed out.
    pub fn remove_external_victim(&self, victim: &SchedulerHandle) {
        tracing::debug!(thief = self.core.id, victim = victim.core.id, "removing victim");

        {
            let mut victim_lists = victim.core.externals.lists.write();
            let me = Arc::downgrade(&self.core);
            victim_lists.thieves.retain(|thief| !Weak::ptr_eq(thief, &me));
        }

        let mut lists = self.core.externals.lists.write();
        let Some(position) = lists
            .victims
            .iter()
            .position(|v| Arc::ptr_eq(v, &victim.core))
        else {
            debug_assert!(false, "scheduler is not a victim");
            return;
        };

        // Holding our write lock keeps our own workers out of the victim
        // walk while the victim's access count drains.
        let backoff = Backoff::new();
        while victim.core.externals.thief_access.load(Ordering::Acquire) > 0 {
            backoff.snooze();
        }

        lists.victims.swap_remove(position);
        self.core.externals.sync_victim_count(&lists);
    }

    /// Registers a check-for-task callback, invoked by workers that found no
    /// local, affinity or stolen work.
    pub fn register_callback(&self, callback: CheckForTaskFn) -> CallbackId {
        let id = self.core.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.core.callbacks.write().push((id, callback));
        CallbackId(id)
    }

    pub fn unregister_callback(&self, id: CallbackId) {
        let mut callbacks = self.core.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cb, _)| *cb != id.0);
        debug_assert_ne!(before, callbacks.len(), "callback was not registered");
    }

    /// Wakes one worker of the home pool.
    pub fn wake_worker(&self) {
        let caller = self.current_pool_worker();
        self.core.wake_workers(caller, 1, true, false);
    }

    /// `true` while the scheduler is attached to its pool.
    pub fn is_running(&self) -> bool {
        self.core.is_attached()
    }

    /// `true` if any deque, affinity queue or overflow queue holds a task.
    pub fn has_tasks(&self) -> bool {
        self.core.has_deque_tasks()
            || self.core.has_affinity_tasks()
            || self.core.has_queue_tasks()
    }

    pub fn worker_count(&self) -> usize {
        self.core.locals.len()
    }

    pub fn scheduler_id(&self) -> u16 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The calling thread's worker id within this scheduler's pool, or the
    /// unknown id for foreign threads.
    pub fn this_worker_id(&self) -> OwnedId {
        self.current_worker().map_or_else(OwnedId::unknown, |w| w.id)
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

// === impl MicroScheduler ===

impl MicroScheduler {
    /// Creates a scheduler with default settings on `pool`.
    pub fn initialize(pool: &WorkerPool) -> Result<Self, SchedulerInitError> {
        Self::initialize_with(pool, MicroSchedulerDesc::default())
    }

    pub fn initialize_with(
        pool: &WorkerPool,
        desc: MicroSchedulerDesc,
    ) -> Result<Self, SchedulerInitError> {
        if desc.priority_count == 0 {
            return Err(SchedulerInitError::NoPriorities);
        }
        let pool_inner = pool.inner().clone();
        if !pool_inner.is_running() {
            return Err(SchedulerInitError::PoolNotRunning);
        }

        let scheduler_id = id::next_scheduler_id();
        let worker_count = pool_inner.workers.len();

        let core = Arc::new_cyclic(|weak: &Weak<SchedulerCore>| SchedulerCore {
            id: scheduler_id,
            name: desc.name.clone(),
            priority_count: desc.priority_count,
            is_attached: AtomicBool::new(true),
            pool: pool_inner,
            locals: (0..worker_count)
                .map(|index| {
                    LocalScheduler::new(
                        weak.clone(),
                        OwnedId::new(scheduler_id, index as u16),
                        desc.priority_count,
                        i64::from(desc.priority_boost_age),
                    )
                })
                .collect(),
            overflow: (0..desc.priority_count).map(|_| SharedQueue::new()).collect(),
            externals: ExternalSchedulers::new(),
            callbacks: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
            creation_thread: std::thread::current().id(),
        });

        core.pool.register_scheduler(&core)?;

        tracing::debug!(id = scheduler_id, name = %desc.name, workers = worker_count, "scheduler initialized");

        Ok(Self {
            handle: SchedulerHandle::from_core(core),
        })
    }

    /// A cloneable task-facing handle.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Detaches the scheduler from its pool. Idempotent; must be called on
    /// the creation thread.
    pub fn shutdown(&self) {
        let core = &self.handle.core;
        if !core.is_attached.swap(false, Ordering::AcqRel) {
            return;
        }
        debug_assert_eq!(
            core.creation_thread,
            std::thread::current().id(),
            "a MicroScheduler must be shut down on the thread that created it"
        );
        tracing::debug!(id = core.id, "scheduler shutting down");

        core.pool.unregister_scheduler(core);
        Self::shutdown_externals(core);
    }

    /// Unregisters every victim and thief relation of `core`.
    fn shutdown_externals(core: &Arc<SchedulerCore>) {
        // Drop our victim registrations.
        loop {
            let victim = {
                let mut lists = core.externals.lists.write();
                let victim = lists.victims.pop();
                core.externals.sync_victim_count(&lists);
                victim
            };
            let Some(victim) = victim else { break };

            let me = Arc::downgrade(core);
            victim
                .externals
                .lists
                .write()
                .thieves
                .retain(|thief| !Weak::ptr_eq(thief, &me));

            let backoff = Backoff::new();
            while victim.externals.thief_access.load(Ordering::Acquire) > 0 {
                backoff.snooze();
            }
        }

        // Drop every thief registered against us, waiting out any thief
        // that is mid-walk through our deques.
        loop {
            let thief = {
                let mut lists = core.externals.lists.write();
                lists.thieves.pop()
            };
            let Some(thief) = thief else { break };
            let Some(thief) = thief.upgrade() else { continue };

            let mut thief_lists = thief.externals.lists.write();
            if let Some(position) = thief_lists
                .victims
                .iter()
                .position(|v| Arc::ptr_eq(v, core))
            {
                let backoff = Backoff::new();
                while core.externals.thief_access.load(Ordering::Acquire) > 0 {
                    backoff.snooze();
                }
                thief_lists.victims.swap_remove(position);
                thief.externals.sync_victim_count(&thief_lists);
            }
        }
    }
}

impl Deref for MicroScheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for MicroScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MicroScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU64};
    use std::time::{Duration, Instant};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    fn spin_until(what: &str, mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(
                start.elapsed() < Duration::from_secs(20),
                "timed out waiting for {what}"
            );
            std::thread::yield_now();
        }
    }

    // --- parallel Fibonacci, four join strategies ---

    struct FibData {
        n: u32,
        out: Arc<AtomicU64>,
    }

    fn fib_blocking(data: &mut FibData, ctx: &TaskContext<'_>) -> Option<TaskRef> {
        if data.n <= 2 {
            data.out.store(1, Ordering::Relaxed);
            return None;
        }

        let left = Arc::new(AtomicU64::new(0));
        let right = Arc::new(AtomicU64::new(0));

        // Two children plus the wait, reserved in bulk.
        ctx.task.add_ref(3, Ordering::Relaxed);

        let left_child = ctx.scheduler.allocate_routine_task(
            fib_blocking,
            FibData {
                n: data.n - 1,
                out: left.clone(),
            },
        );
        ctx.task.add_child_without_ref(left_child);
        ctx.scheduler.spawn_task(left_child, 0);

        let right_child = ctx.scheduler.allocate_routine_task(
            fib_blocking,
            FibData {
                n: data.n - 2,
                out: right.clone(),
            },
        );
        ctx.task.add_child_without_ref(right_child);
        ctx.scheduler.spawn_task(right_child, 0);

        ctx.task.wait_for_all();
        assert_eq!(ctx.task.ref_count(), 1, "wait must reset the count to 1");

        data.out.store(
            left.load(Ordering::Relaxed) + right.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        None
    }

    struct FibJoin {
        left: Arc<AtomicU64>,
        right: Arc<AtomicU64>,
        out: Arc<AtomicU64>,
    }

    fn fib_join(data: &mut FibJoin, _ctx: &TaskContext<'_>) -> Option<TaskRef> {
        data.out.store(
            data.left.load(Ordering::Relaxed) + data.right.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        None
    }

    /// Forks through a continuation join; `bypass` additionally returns the
    /// right child instead of spawning it.
    fn fib_continuation_impl(
        data: &mut FibData,
        ctx: &TaskContext<'_>,
        routine: fn(&mut FibData, &TaskContext<'_>) -> Option<TaskRef>,
        bypass: bool,
    ) -> Option<TaskRef> {
        if data.n <= 2 {
            data.out.store(1, Ordering::Relaxed);
            return None;
        }

        let left = Arc::new(AtomicU64::new(0));
        let right = Arc::new(AtomicU64::new(0));

        let continuation = ctx.scheduler.allocate_routine_task(
            fib_join,
            FibJoin {
                left: left.clone(),
                right: right.clone(),
                out: data.out.clone(),
            },
        );
        ctx.task.set_continuation(continuation);
        continuation.add_ref(2, Ordering::Relaxed);

        let left_child = ctx
            .scheduler
            .allocate_routine_task(routine, FibData { n: data.n - 1, out: left });
        continuation.add_child_without_ref(left_child);
        ctx.scheduler.spawn_task(left_child, 0);

        let right_child = ctx
            .scheduler
            .allocate_routine_task(routine, FibData { n: data.n - 2, out: right });
        continuation.add_child_without_ref(right_child);

        if bypass {
            // The last child executes immediately, skipping the deque.
            Some(right_child)
        } else {
            ctx.scheduler.spawn_task(right_child, 0);
            None
        }
    }

    fn fib_continuation(data: &mut FibData, ctx: &TaskContext<'_>) -> Option<TaskRef> {
        fib_continuation_impl(data, ctx, fib_continuation, false)
    }

    fn fib_bypass(data: &mut FibData, ctx: &TaskContext<'_>) -> Option<TaskRef> {
        fib_continuation_impl(data, ctx, fib_bypass, true)
    }

    fn fib_recycling(data: &mut FibData, ctx: &TaskContext<'_>) -> Option<TaskRef> {
        if data.n <= 2 {
            data.out.store(1, Ordering::Relaxed);
            return None;
        }

        let left = Arc::new(AtomicU64::new(0));
        let right = Arc::new(AtomicU64::new(0));

        let continuation = ctx.scheduler.allocate_routine_task(
            fib_join,
            FibJoin {
                left: left.clone(),
                right: right.clone(),
                out: data.out.clone(),
            },
        );
        continuation.add_ref(2, Ordering::Relaxed);
        ctx.task.set_continuation(continuation);

        let left_child = ctx
            .scheduler
            .allocate_routine_task(fib_recycling, FibData { n: data.n - 1, out: left });
        continuation.add_child_without_ref(left_child);
        ctx.scheduler.spawn_task(left_child, 0);

        // The right child has exactly this task's shape: reuse the
        // allocation and bypass with it.
        ctx.task.recycle();
        continuation.add_child_without_ref(ctx.task);
        data.n -= 2;
        data.out = right;
        Some(ctx.task)
    }

    fn run_fib(
        routine: fn(&mut FibData, &TaskContext<'_>) -> Option<TaskRef>,
        n: u32,
    ) -> (u64, u64) {
        let pool = WorkerPool::initialize(4).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let out = Arc::new(AtomicU64::new(0));
        let root = scheduler.allocate_routine_task(routine, FibData { n, out: out.clone() });
        scheduler.spawn_task_and_wait(root, 0);

        let pushes = scheduler.core.total_deque_pushes();
        scheduler.shutdown();
        pool.shutdown();
        (out.load(Ordering::Relaxed), pushes)
    }

    #[test]
    fn fib_with_blocking_join() {
        let _trace = trace();
        let (value, _) = run_fib(fib_blocking, 20);
        assert_eq!(value, 6765);
    }

    #[test]
    fn fib_with_continuation_join() {
        let _trace = trace();
        let (value, _) = run_fib(fib_continuation, 20);
        assert_eq!(value, 6765);
    }

    #[test]
    fn fib_with_scheduler_bypass() {
        let _trace = trace();
        let (value, bypass_pushes) = run_fib(fib_bypass, 20);
        assert_eq!(value, 6765);

        let (_, blocking_pushes) = run_fib(fib_blocking, 20);
        assert!(
            bypass_pushes < blocking_pushes,
            "bypass must skip deque traffic: {bypass_pushes} >= {blocking_pushes}"
        );
    }

    #[test]
    fn fib_with_task_recycling() {
        let _trace = trace();
        let (value, _) = run_fib(fib_recycling, 20);
        assert_eq!(value, 6765);
    }

    // --- 2-D wavefront prefix sum ---

    #[test]
    fn wavefront_prefix_sum() {
        let _trace = trace();
        const WIDTH: usize = 8;
        const HEIGHT: usize = 8;
        let at = |i: usize, j: usize| i * HEIGHT + j;

        let pool = WorkerPool::initialize(4).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        // Values: a single 1 at the origin. The inclusive prefix sum of that
        // grid is 1 everywhere.
        let values: Arc<Vec<AtomicI64>> =
            Arc::new((0..WIDTH * HEIGHT).map(|_| AtomicI64::new(0)).collect());
        values[at(0, 0)].store(1, Ordering::Relaxed);
        let sums: Arc<Vec<AtomicI64>> =
            Arc::new((0..WIDTH * HEIGHT).map(|_| AtomicI64::new(0)).collect());

        let waiter = scheduler.allocate_task(|_ctx| None);
        waiter.add_ref(WIDTH as i32 * HEIGHT as i32 + 1, Ordering::Relaxed);

        // Build the grid back to front so successors exist first. Each cell
        // carries one reference per incoming edge; the predecessor that
        // drops the count to 1 spawns it.
        let mut tasks: Vec<Option<TaskRef>> = vec![None; WIDTH * HEIGHT];
        for i in (0..WIDTH).rev() {
            for j in (0..HEIGHT).rev() {
                let successors = [
                    (i + 1 < WIDTH).then(|| tasks[at(i + 1, j)].unwrap()),
                    (j + 1 < HEIGHT).then(|| tasks[at(i, j + 1)].unwrap()),
                ];
                let values = values.clone();
                let sums = sums.clone();
                let task = scheduler.allocate_task(move |ctx| {
                    let up = if i > 0 {
                        sums[at(i - 1, j)].load(Ordering::Relaxed)
                    } else {
                        0
                    };
                    let left = if j > 0 {
                        sums[at(i, j - 1)].load(Ordering::Relaxed)
                    } else {
                        0
                    };
                    let diagonal = if i > 0 && j > 0 {
                        sums[at(i - 1, j - 1)].load(Ordering::Relaxed)
                    } else {
                        0
                    };
                    let sum = values[at(i, j)].load(Ordering::Relaxed) + up + left - diagonal;
                    sums[at(i, j)].store(sum, Ordering::Relaxed);

                    for successor in successors.iter().flatten() {
                        if successor.remove_ref(1) == 1 {
                            ctx.scheduler.spawn_task(*successor, 0);
                        }
                    }
                    None
                });

                let incoming = i32::from(i > 0) + i32::from(j > 0);
                if incoming > 0 {
                    task.add_ref(incoming, Ordering::Relaxed);
                }
                waiter.add_child_without_ref(task);
                tasks[at(i, j)] = Some(task);
            }
        }

        let root = tasks[at(0, 0)].unwrap();
        waiter.spawn_and_wait_for_all(root);
        assert_eq!(waiter.ref_count(), 1);

        // Sequential model.
        let mut expected = vec![0i64; WIDTH * HEIGHT];
        for i in 0..WIDTH {
            for j in 0..HEIGHT {
                let up = if i > 0 { expected[at(i - 1, j)] } else { 0 };
                let left = if j > 0 { expected[at(i, j - 1)] } else { 0 };
                let diag = if i > 0 && j > 0 { expected[at(i - 1, j - 1)] } else { 0 };
                expected[at(i, j)] = values[at(i, j)].load(Ordering::Relaxed) + up + left - diag;
            }
        }
        for idx in 0..WIDTH * HEIGHT {
            assert_eq!(sums[idx].load(Ordering::Relaxed), expected[idx]);
        }
        assert_eq!(sums[at(WIDTH - 1, HEIGHT - 1)].load(Ordering::Relaxed), 1);

        // Safety: the wait completed; the waiter is quiescent.
        unsafe { scheduler.destroy_task(waiter) };
        scheduler.shutdown();
        pool.shutdown();
    }

    // --- affinity ---

    #[test]
    fn affinity_pins_tasks_to_workers() {
        let _trace = trace();
        const TASKS: usize = 64;

        let pool = WorkerPool::initialize(4).unwrap();
        let workers = pool.worker_count();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let observed: Arc<Vec<AtomicU32>> =
            Arc::new((0..TASKS).map(|_| AtomicU32::new(u32::MAX)).collect());

        let waiter = scheduler.allocate_task(|_ctx| None);
        waiter.add_ref(TASKS as i32 + 1, Ordering::Relaxed);

        for k in 0..TASKS {
            let observed = observed.clone();
            let task = scheduler.allocate_task(move |ctx| {
                observed[k].store(u32::from(ctx.worker_id.local_id()), Ordering::Relaxed);
                None
            });
            task.set_affinity((k % workers) as u32);
            waiter.add_child_without_ref(task);
            scheduler.spawn_task(task, 0);
        }

        scheduler.wait_for(waiter);

        for k in 0..TASKS {
            assert_eq!(
                observed[k].load(Ordering::Relaxed),
                (k % workers) as u32,
                "task {k} ran on the wrong worker"
            );
        }

        // Safety: the wait completed; the waiter is quiescent.
        unsafe { scheduler.destroy_task(waiter) };
        scheduler.shutdown();
        pool.shutdown();
    }

    // --- cross-scheduler stealing ---

    #[test]
    fn external_steal_moves_work_across_schedulers() {
        let _trace = trace();
        const TASKS: usize = 32;

        // Pool A: just the master, which never dispatches here. Pool B: four
        // workers that will pull A's tasks across.
        let pool_a = WorkerPool::initialize(1).unwrap();
        let scheduler_a = MicroScheduler::initialize(&pool_a).unwrap();
        let pool_b = WorkerPool::initialize(4).unwrap();
        let scheduler_b = MicroScheduler::initialize(&pool_b).unwrap();

        scheduler_b.add_external_victim(&scheduler_a);

        let done = Arc::new(AtomicUsize::new(0));
        let foreign = Arc::new(AtomicUsize::new(0));
        let home_id = scheduler_a.scheduler_id();

        for _ in 0..TASKS {
            let done = done.clone();
            let foreign = foreign.clone();
            let task = scheduler_a.allocate_task(move |ctx| {
                if ctx.worker_id.owner_id() != home_id {
                    foreign.fetch_add(1, Ordering::Relaxed);
                }
                done.fetch_add(1, Ordering::AcqRel);
                None
            });
            scheduler_a.spawn_task(task, 0);
        }

        spin_until("thieves to drain the victim", || {
            // Keep prodding the thief pool; its workers may still have been
            // starting up when the submissions tried to wake them.
            scheduler_b.wake_worker();
            done.load(Ordering::Acquire) == TASKS
        });
        assert!(
            foreign.load(Ordering::Relaxed) > 0,
            "no task was executed by the thief scheduler's workers"
        );

        scheduler_b.remove_external_victim(&scheduler_a);
        scheduler_b.shutdown();
        scheduler_a.shutdown();
        pool_b.shutdown();
        pool_a.shutdown();
    }

    #[test]
    #[should_panic(expected = "self victimization")]
    fn self_victimization_is_rejected() {
        let pool = WorkerPool::initialize(1).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();
        let handle = scheduler.handle();
        scheduler.add_external_victim(&handle);
    }

    // --- external thread submission ---

    #[test]
    fn external_threads_route_through_overflow_queue() {
        let _trace = trace();
        const TASKS: usize = 16;

        let pool = WorkerPool::initialize(2).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.handle();

        std::thread::spawn({
            let done = done.clone();
            move || {
                for _ in 0..TASKS {
                    let done = done.clone();
                    let task = handle.allocate_task(move |_ctx| {
                        done.fetch_add(1, Ordering::AcqRel);
                        None
                    });
                    handle.spawn_task(task, 0);
                }
            }
        })
        .join()
        .unwrap();

        spin_until("workers to drain the overflow queue", || {
            scheduler.wake_worker();
            done.load(Ordering::Acquire) == TASKS
        });

        scheduler.shutdown();
        pool.shutdown();
    }

    // --- check-for-task callbacks ---

    #[test]
    fn check_for_task_callback_feeds_idle_workers() {
        let _trace = trace();

        let pool = WorkerPool::initialize(2).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let handed_out = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicBool::new(false));

        let callback_id = scheduler.register_callback(Box::new({
            let handle = scheduler.handle();
            let handed_out = handed_out.clone();
            let executed = executed.clone();
            move |_worker| {
                if handed_out.swap(true, Ordering::AcqRel) {
                    return None;
                }
                let executed = executed.clone();
                Some(handle.allocate_task(move |_ctx| {
                    executed.store(true, Ordering::Release);
                    None
                }))
            }
        }));

        spin_until("an idle worker to run the synthesized task", || {
            scheduler.wake_worker();
            executed.load(Ordering::Acquire)
        });

        scheduler.unregister_callback(callback_id);
        scheduler.shutdown();
        pool.shutdown();
    }

    // --- destruction and waiting ---

    #[test]
    fn destroy_task_finalizes_parent() {
        let _trace = trace();
        let pool = WorkerPool::initialize(1).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let parent = scheduler.allocate_task(|_ctx| None);
        parent.add_ref(2, Ordering::Relaxed); // child + wait

        let child = scheduler.allocate_task(|_ctx| None);
        parent.add_child_without_ref(child);

        // Safety: the child was never spawned.
        unsafe { scheduler.destroy_task(child) };
        assert_eq!(parent.ref_count(), 2);

        // The wait condition is already met.
        scheduler.wait_for(parent);
        assert_eq!(parent.ref_count(), 1);

        // Safety: quiescent, never spawned.
        unsafe { scheduler.destroy_task(parent) };
        scheduler.shutdown();
        pool.shutdown();
    }

    #[test]
    fn spawn_and_wait_with_affinity_from_master() {
        let _trace = trace();
        let pool = WorkerPool::initialize(3).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();

        let ran_on = Arc::new(AtomicU32::new(u32::MAX));
        let task = scheduler.allocate_task({
            let ran_on = ran_on.clone();
            move |ctx| {
                ran_on.store(u32::from(ctx.worker_id.local_id()), Ordering::Release);
                None
            }
        });
        task.set_affinity(2);

        // The caller is worker 0, the task is pinned to worker 2: the wait
        // must not run it inline.
        scheduler.spawn_task_and_wait(task, 0);
        assert_eq!(ran_on.load(Ordering::Acquire), 2);

        scheduler.shutdown();
        pool.shutdown();
    }

    // --- priorities ---

    #[test]
    fn priority_boost_prevents_starvation() {
        let _trace = trace();
        const LOW_PRIORITY_FLOOD: usize = 40;

        let pool = WorkerPool::initialize(1).unwrap();
        let scheduler = MicroScheduler::initialize_with(
            &pool,
            MicroSchedulerDesc {
                priority_count: 2,
                priority_boost_age: 4,
                name: "boosted".into(),
            },
        )
        .unwrap();

        let high_done = Arc::new(AtomicUsize::new(0));
        let seen_at_boost = Arc::new(AtomicUsize::new(usize::MAX));

        for _ in 0..LOW_PRIORITY_FLOOD {
            let high_done = high_done.clone();
            let task = scheduler.allocate_task(move |_ctx| {
                high_done.fetch_add(1, Ordering::Relaxed);
                None
            });
            scheduler.spawn_task(task, 0);
        }

        let starved = scheduler.allocate_task({
            let high_done = high_done.clone();
            let seen_at_boost = seen_at_boost.clone();
            move |_ctx| {
                seen_at_boost.store(high_done.load(Ordering::Relaxed), Ordering::Relaxed);
                None
            }
        });
        scheduler.spawn_task(starved, 1);

        scheduler.wait_for_all();

        assert_eq!(high_done.load(Ordering::Relaxed), LOW_PRIORITY_FLOOD);
        let seen = seen_at_boost.load(Ordering::Relaxed);
        assert!(
            seen < LOW_PRIORITY_FLOOD,
            "the low-priority task only ran after the flood ({seen})"
        );

        scheduler.shutdown();
        pool.shutdown();
    }

    // --- lifecycle ---

    #[test]
    fn scheduler_shutdown_is_idempotent() {
        let pool = WorkerPool::initialize(2).unwrap();
        let scheduler = MicroScheduler::initialize(&pool).unwrap();
        assert!(scheduler.is_running());
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        scheduler.shutdown();
        pool.shutdown();
    }

    #[test]
    fn initialization_validates_configuration() {
        let pool = WorkerPool::initialize(1).unwrap();
        assert!(matches!(
            MicroScheduler::initialize_with(
                &pool,
                MicroSchedulerDesc {
                    priority_count: 0,
                    ..MicroSchedulerDesc::default()
                }
            ),
            Err(SchedulerInitError::NoPriorities)
        ));

        pool.shutdown();
        assert!(matches!(
            MicroScheduler::initialize(&pool),
            Err(SchedulerInitError::PoolNotRunning)
        ));
    }
}
