// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker dispatcher.
//!
//! A `LocalScheduler` owns one work-stealing deque and one affinity queue per
//! priority, and drives the nested dispatch loops: execute the current task
//! (following bypass chains and folding continuations), fetch locally in
//! priority order (with aging-based priority boosts), then fetch non-locally
//! (overflow queue, affinity queue, random-start stealing, check-for-task
//! callbacks). Only a top-level worker may quit; before doing so it attempts
//! one external steal across the scheduler's victims and re-verifies that no
//! work exists.

use crate::cache;
use crate::deque::TaskDeque;
use crate::id::OwnedId;
use crate::loom::cell::UnsafeCell;
use crate::queue::SharedQueue;
use crate::scheduler::{SchedulerCore, SchedulerHandle};
use crate::task::{ExecutionState, TaskContext, TaskFlags, TaskRef};
use crate::worker::WorkerState;
use core::ptr;
use parking_lot::Mutex;
use std::sync::Weak;
use std::sync::atomic;

/// Owner-side dispatch state: touched only by the worker this scheduler is
/// bound to.
struct OwnerState {
    rng: fastrand::Rng,
    boost_age_start: i64,
    boost_age: i64,
    next_boost_priority: u32,
}

pub(crate) struct LocalScheduler {
    core: Weak<SchedulerCore>,
    id: OwnedId,
    /// One deque per priority; this worker owns the bottom end.
    deques: Box<[TaskDeque]>,
    /// One MPSC queue per priority for tasks pinned to this worker.
    affinity: Box<[SharedQueue<TaskRef>]>,
    /// Sentinel task used by top-level runs; its reference count never
    /// reaches the wait condition, so top-level workers are quittable.
    waiter: TaskRef,
    /// Held by the worker for the whole time it runs this scheduler;
    /// unregistration locks it to wait the worker out.
    pub(crate) worker_access: Mutex<()>,
    owner: UnsafeCell<OwnerState>,
}

// Safety: `owner` is only touched by the bound worker (see `with_owner`);
// everything else is thread-safe by construction.
unsafe impl Send for LocalScheduler {}
// Safety: see above.
unsafe impl Sync for LocalScheduler {}

// === impl LocalScheduler ===

impl LocalScheduler {
    pub(crate) fn new(
        core: Weak<SchedulerCore>,
        id: OwnedId,
        priority_count: usize,
        priority_boost_age: i64,
    ) -> Self {
        let waiter = crate::task::allocate_waiter(None);
        Self {
            core,
            id,
            deques: (0..priority_count).map(|_| TaskDeque::new()).collect(),
            affinity: (0..priority_count).map(|_| SharedQueue::new()).collect(),
            waiter,
            worker_access: Mutex::new(()),
            owner: UnsafeCell::new(OwnerState {
                rng: fastrand::Rng::with_seed(u64::from(id.uid()) + 1),
                boost_age_start: priority_boost_age,
                boost_age: priority_boost_age - 1,
                next_boost_priority: 1,
            }),
        }
    }

    pub(crate) fn id(&self) -> OwnedId {
        self.id
    }

    /// Runs the owner-state closure.
    fn with_owner<R>(&self, f: impl FnOnce(&mut OwnerState) -> R) -> R {
        // Safety: only the bound worker dispatches through this scheduler, so
        // there is exactly one thread in here at a time.
        self.owner.with_mut(|owner| f(unsafe { &mut *owner }))
    }

    pub(crate) fn has_deque_tasks(&self) -> bool {
        self.deques.iter().any(|deque| !deque.is_empty())
    }

    pub(crate) fn has_affinity_tasks(&self) -> bool {
        self.affinity.iter().any(|queue| !queue.is_empty())
    }

    pub(crate) fn deque_push_count(&self) -> u64 {
        self.deques.iter().map(TaskDeque::push_count).sum()
    }

    /// Pushes a ready task onto this worker's deque. Bound worker only.
    pub(crate) fn spawn_local(&self, task: TaskRef, priority: usize) -> bool {
        self.deques[priority].try_push(task)
    }

    /// Queues a task pinned to this worker. Any thread.
    pub(crate) fn queue_affinity(&self, task: TaskRef, priority: usize) {
        self.affinity[priority].push(task);
    }

    /// Marks `task` ready and pushes it locally at the given priority.
    fn spawn_ready(&self, task: TaskRef, priority: usize) {
        task.set_execution_state(ExecutionState::Ready);
        let pushed = self.spawn_local(task, priority);
        debug_assert!(pushed, "local deque exhausted its address space");
    }

    /// Top-level entry used by the worker loop: runs until the scheduler has
    /// no more work for this worker. Returns whether any task was executed.
    pub(crate) fn run(&self, initial: Option<TaskRef>) -> bool {
        // A count of 3 can never reach the wait condition: top-level runs
        // only end through the quit path.
        self.waiter.set_ref(3, atomic::Ordering::Relaxed);
        self.run_until_done(Some(self.waiter), initial)
    }

    /// The scheduler loop. Executes `child` first (if any), then dispatches
    /// until `waiting`'s reference count drops to 2 (resetting it to 1), or,
    /// for top-level runs, until no work can be found anywhere.
    pub(crate) fn run_until_done(
        &self,
        waiting: Option<TaskRef>,
        child: Option<TaskRef>,
    ) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let scheduler = SchedulerHandle::from_core(core.clone());

        // Safety: an attached scheduler keeps its pool (and so every worker
        // state) alive for the duration of the run.
        let worker = unsafe { crate::worker::current_worker_ref(&core.pool.tls) };
        let user_data = worker.map_or(ptr::null_mut(), |w| {
            w.user_data.load(atomic::Ordering::Relaxed)
        });

        if let Some(waiting) = waiting {
            debug_assert!(
                waiting.ref_count()
                    >= if child.is_some_and(|c| c.parent() == Some(waiting)) {
                        3
                    } else {
                        2
                    },
                "waiting task reference count is too small"
            );
        }

        let mut executed = false;
        let mut task = child;

        // WORKER LOOP
        while core.is_attached() {
            // LOCAL LOOP
            while core.is_attached() {
                // TASK EXECUTION LOOP
                loop {
                    let Some(current) = task else { break };

                    let mut bypass = {
                        current.bind_local_scheduler(self);
                        current.set_execution_state(ExecutionState::Executing);
                        tracing::trace!(task = ?current, id = %self.id, "executing");
                        let ctx = TaskContext {
                            scheduler: &scheduler,
                            worker_id: self.id,
                            task: current,
                            user_data,
                        };
                        executed = true;
                        // Safety: the execution-state protocol makes this
                        // thread the sole executor.
                        unsafe { current.execute(&ctx) }
                    };

                    debug_assert!(
                        bypass.is_none_or(|b| !b.is_continuation()),
                        "a bypass task cannot be a continuation"
                    );

                    match current.execution_state() {
                        ExecutionState::Executing => {
                            // Normal completion: tear the task down.
                            // Safety: completed and owned by this thread.
                            unsafe { current.drop_payload() };

                            if let Some(parent) = current.parent() {
                                self.finalize_parent(parent, &mut bypass);
                            }

                            debug_assert!(
                                current.ref_count() <= 1,
                                "task still has children after executing"
                            );
                            debug_assert!(
                                Some(current) != waiting,
                                "cannot execute the waiting task"
                            );

                            // Safety: fully quiesced above.
                            unsafe {
                                cache::free_task(current, worker.map(|w| &w.cache));
                            }
                        }
                        ExecutionState::Allocated => {
                            // Recycled. Re-spawn unless the user re-linked it
                            // or returned it as the bypass task.
                            if bypass.is_none() && !current.is_continuation() {
                                self.spawn_ready(current, 0);
                            }
                        }
                        state => {
                            debug_assert!(false, "unexpected post-execute state {state:?}");
                        }
                    }

                    task = bypass;
                    self.with_owner(|owner| owner.boost_age -= 1);
                } // END TASK EXECUTION LOOP

                // Is the wait over?
                if let Some(waiting) = waiting
                    && waiting.ref_count() <= 2
                {
                    debug_assert_eq!(waiting.ref_count(), 2);
                    waiting.set_ref(1, atomic::Ordering::Relaxed);
                    return executed;
                }

                task = self.get_local_task();
                if task.is_none() {
                    break;
                }
            } // END LOCAL LOOP

            task = self.get_non_local_task_loop(&core, waiting, worker);
            let Some(found) = task else { break };

            // Anything fetched with a parent must still be referenced by it,
            // otherwise it was orphaned from the graph.
            debug_assert!(
                found
                    .parent()
                    .is_none_or(|parent| parent.ref_count() > 1),
                "task was orphaned from its parent"
            );
        } // END WORKER LOOP

        executed
    }

    /// Parent finalization after a child completes: the `ref_count == 2` fast
    /// path encodes "exactly one outstanding child plus the self reference".
    /// When the count reaches 1 the parent becomes runnable: it becomes the
    /// bypass task when that slot is free, else it is pushed to the local
    /// deque at priority 0.
    fn finalize_parent(&self, parent: TaskRef, bypass: &mut Option<TaskRef>) {
        if parent.ref_count() == 2 {
            parent.set_ref(1, atomic::Ordering::Relaxed);
        } else if parent.remove_ref(1) > 1 {
            return;
        }

        tracing::trace!(parent = ?parent, id = %self.id, "last child done, parent runnable");

        if bypass.is_none() {
            *bypass = Some(parent);
        } else {
            self.spawn_ready(parent, 0);
        }
    }

    fn boost_due(&self) -> bool {
        // Safety: owner-only field, read by the bound worker.
        self.owner.with(|owner| unsafe { (*owner).boost_age <= 0 })
    }

    /// Pops from the local deques, highest priority first. When the boost age
    /// expired, the lower priorities get a turn first.
    fn get_local_task(&self) -> Option<TaskRef> {
        if self.deques.len() > 1
            && self.boost_due()
            && let Some(task) = self.get_local_boosted_task()
        {
            return Some(task);
        }

        self.deques.iter().find_map(TaskDeque::try_pop)
    }

    /// Round-robins through priorities `1..count` so low priorities cannot
    /// starve, and resets the age counter.
    #[cold]
    fn get_local_boosted_task(&self) -> Option<TaskRef> {
        let count = self.deques.len() as u32;

        let mut priority = self.with_owner(|owner| {
            let start = owner.next_boost_priority;
            owner.next_boost_priority = (owner.next_boost_priority % (count - 1)) + 1;
            owner.boost_age = owner.boost_age_start;
            start
        });

        for _ in 0..count - 1 {
            priority = (priority % (count - 1)) + 1;
            if let Some(task) = self.deques[priority as usize].try_pop() {
                return Some(task);
            }
        }
        None
    }

    /// Non-local fetch: overflow queue, own affinity queue, stealing, then
    /// the registered check-for-task callbacks.
    pub(crate) fn get_non_local_task(
        &self,
        core: &SchedulerCore,
        worker: Option<&WorkerState>,
        get_affinity: bool,
        caller_is_external: bool,
    ) -> Option<TaskRef> {
        let mut task = self.get_queued_task(core);

        if task.is_none() && get_affinity {
            task = self.get_affinity_task();
            if task.is_some()
                && let Some(worker) = worker
            {
                // The submission of an affinitized task latches the
                // semaphore without a reset; consume the latch.
                worker.blocker.reset_sleep_state();
            }
        }

        if task.is_none() {
            task = self.steal_task(core, caller_is_external);
        }

        if task.is_none() {
            let callbacks = core.callbacks.read();
            for (_, callback) in callbacks.iter() {
                task = callback(self.id);
                if task.is_some() {
                    break;
                }
            }
        }

        task
    }

    fn get_queued_task(&self, core: &SchedulerCore) -> Option<TaskRef> {
        core.overflow.iter().find_map(SharedQueue::try_pop)
    }

    fn get_affinity_task(&self) -> Option<TaskRef> {
        self.affinity
            .iter()
            .filter(|queue| !queue.is_empty())
            .find_map(|queue| queue.try_pop())
    }

    /// Steals from a uniformly random victim within the same scheduler,
    /// wrapping over all workers from the random start.
    fn steal_task(&self, core: &SchedulerCore, caller_is_external: bool) -> Option<TaskRef> {
        let victims = &core.locals;
        if !caller_is_external && victims.len() == 1 {
            return None;
        }

        let skip = (!caller_is_external).then_some(self.id.local_id() as usize);
        let start = self.with_owner(|owner| owner.rng.usize(..victims.len()));

        Self::steal_range(victims, start, victims.len(), skip)
            .or_else(|| Self::steal_range(victims, 0, start, skip))
    }

    fn steal_range(
        victims: &[LocalScheduler],
        begin: usize,
        end: usize,
        skip: Option<usize>,
    ) -> Option<TaskRef> {
        for index in begin..end {
            if Some(index) == skip {
                continue;
            }
            for deque in &victims[index].deques {
                if let Some(task) = deque.try_steal() {
                    task.insert_flag(TaskFlags::IS_STOLEN);
                    tracing::trace!(task = ?task, victim = index, "stole task");
                    return Some(task);
                }
            }
        }
        None
    }

    /// Steals across the scheduler's external victim list. Walks the list
    /// under the shared lock, pinning each victim with its thief-access
    /// counter while stealing outside the lock.
    pub(crate) fn steal_external(&self, core: &SchedulerCore) -> Option<TaskRef> {
        // Racy coarse filter; the authoritative check is the walk below.
        if !core.externals.has_victims() {
            return None;
        }

        let mut index = 0;
        loop {
            let victim = {
                let lists = core.externals.lists.read();
                let Some(victim) = lists.victims.get(index) else {
                    return None;
                };
                victim
                    .externals
                    .thief_access
                    .fetch_add(1, atomic::Ordering::Acquire);
                victim.clone()
            };

            let count = victim.locals.len();
            let start = self.with_owner(|owner| owner.rng.usize(..count));
            let task = Self::steal_range(&victim.locals, start, count, None)
                .or_else(|| Self::steal_range(&victim.locals, 0, start, None));

            victim
                .externals
                .thief_access
                .fetch_sub(1, atomic::Ordering::Release);

            if task.is_some() {
                tracing::trace!(victim = victim.id, id = %self.id, "external steal hit");
                return task;
            }
            index += 1;
        }
    }

    /// The non-local fetch loop with the exit decision. Returns `None` when
    /// the caller should leave the scheduler loop: the wait completed, or a
    /// top-level worker verified there is no work left anywhere.
    fn get_non_local_task_loop(
        &self,
        core: &SchedulerCore,
        waiting: Option<TaskRef>,
        worker: Option<&WorkerState>,
    ) -> Option<TaskRef> {
        // Only a top-level worker may quit without the wait completing, and
        // only a top-level worker steals externally.
        let is_top_level = waiting == Some(self.waiter);

        while core.is_attached() {
            if let Some(task) = self.get_non_local_task(core, worker, true, false) {
                return Some(task);
            }

            if is_top_level {
                if let Some(task) = self.steal_external(core) {
                    return Some(task);
                }

                // Productivity recheck before quitting.
                if !(core.has_deque_tasks() || self.has_affinity_tasks()) {
                    tracing::trace!(id = %self.id, "no work anywhere, leaving scheduler");
                    return None;
                }
            }

            // A caller without a waiting task stops blocking as soon as one
            // fetch round comes up empty.
            let waiting = waiting?;
            if waiting.ref_count() <= 2 {
                debug_assert_eq!(waiting.ref_count(), 2);
                waiting.set_ref(1, atomic::Ordering::Relaxed);
                return None;
            }
        }

        None
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        // Safety: by the time a scheduler core drops, its dispatch loops have
        // all exited; the waiter is quiescent and was heap-allocated.
        unsafe {
            self.waiter.drop_payload();
            cache::free_task(self.waiter, None);
        }
    }
}
