// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker threads.
//!
//! Each worker owns a task cache and a sleep blocker, and runs the outer
//! scheduling loop: scan the registered local schedulers round-robin, enter
//! the first one with work, and when all are dry, back off adaptively before
//! committing to sleep. Worker 0 is the *master*: the thread that initialized
//! the pool. It has no OS thread of its own and participates only through
//! explicit waits.

use crate::cache::{self, TaskCache};
use crate::id::OwnedId;
use crate::park::{BinarySemaphore, ThreadBlocker};
use crate::pool::PoolInner;
use crate::scheduler::SchedulerCore;
use crate::task;
use crate::tls::TlsHooks;
use core::ptr::NonNull;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sleeps shorter than this are treated as noise when estimating the
/// commit-to-sleep threshold.
const LOWER_BOUND_SLEEP: Duration = Duration::from_micros(20);

pub(crate) struct WorkerState {
    pub(crate) id: OwnedId,
    pub(crate) blocker: ThreadBlocker,
    pub(crate) halt_sem: BinarySemaphore,
    pub(crate) cache: TaskCache,
    /// Local schedulers attached to this worker, one per registered
    /// micro-scheduler. Readers hold the shared lock while indexing.
    pub(crate) registered: RwLock<Vec<Arc<SchedulerCore>>>,
    pub(crate) user_data: AtomicPtr<()>,
    /// Shortest observed real sleep, in nanoseconds.
    min_sleep_nanos: AtomicU64,
    /// How many threads currently reference this state through TLS.
    tls_refs: AtomicU32,
}

// === impl WorkerState ===

impl WorkerState {
    pub(crate) fn new(id: OwnedId, cachable_task_size: usize, user_data: *mut ()) -> Self {
        Self {
            id,
            blocker: ThreadBlocker::new(),
            halt_sem: BinarySemaphore::new(),
            cache: TaskCache::new(cachable_task_size),
            registered: RwLock::new(Vec::new()),
            user_data: AtomicPtr::new(user_data),
            min_sleep_nanos: AtomicU64::new(u64::MAX),
            tls_refs: AtomicU32::new(0),
        }
    }

    /// Parks this worker until woken. Tracks the shortest real sleep so the
    /// termination backoff can calibrate itself.
    pub(crate) fn sleep(&self, pool: &PoolInner, force_reset: bool) {
        tracing::trace!(worker = %self.id, force_reset, "worker sleeping");

        let start = Instant::now();
        pool.sleeping.fetch_add(1, Ordering::AcqRel);

        let outcome = self.blocker.block(force_reset);

        // Distribute the wake: the waker left behind how many more workers
        // should come up.
        if outcome.resume_count > 0 {
            pool.wake_worker(Some(self), outcome.resume_count, true);
        }

        pool.sleeping.fetch_sub(1, Ordering::AcqRel);
        self.blocker.wait_for_wakers();

        if outcome.did_sleep {
            let slept = start.elapsed();
            if slept > LOWER_BOUND_SLEEP {
                let nanos = u64::try_from(slept.as_nanos()).unwrap_or(u64::MAX);
                self.min_sleep_nanos
                    .fetch_min(nanos, Ordering::Relaxed);
            }
        }

        tracing::trace!(worker = %self.id, "worker woke");
    }

    /// Wakes this worker if it is blocked. See [`ThreadBlocker::wake`].
    pub(crate) fn wake(&self, count: u32, reset: bool, force: bool) -> bool {
        self.blocker.wake(count, reset, force)
    }

    /// Parks this worker in the halt gate until resumed.
    pub(crate) fn halt(&self, pool: &PoolInner) {
        tracing::trace!(worker = %self.id, "worker halting");
        pool.halted.fetch_add(1, Ordering::AcqRel);
        self.halt_sem.reset();
        self.halt_sem.wait();
        pool.halted.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(worker = %self.id, "worker resumed");
    }

    pub(crate) fn resume(&self) {
        self.halt_sem.signal();
    }

    fn quit_threshold(&self) -> u32 {
        // Scale the shortest observed sleep into backoff iterations; each
        // iteration costs roughly a yield.
        let nanos = self.min_sleep_nanos.load(Ordering::Relaxed);
        u32::try_from((nanos / 100_000).clamp(1, 128)).unwrap_or(128)
    }
}

/// Adaptive termination backoff: pause, yield, and eventually report that the
/// worker should commit to sleeping. The quit threshold follows an
/// exponentially weighted moving average of how long productive streaks last.
pub(crate) struct TerminationBackoff {
    min_quit_threshold: u32,
    quit_threshold: u32,
    quit_count: u32,
}

// === impl TerminationBackoff ===

impl TerminationBackoff {
    const EWMA_WEIGHT_DENOM: u32 = 2;

    pub(crate) fn new(min_quit_threshold: u32) -> Self {
        Self {
            min_quit_threshold,
            quit_threshold: min_quit_threshold,
            quit_count: 0,
        }
    }

    /// Work was found: fold the streak length into the threshold.
    pub(crate) fn reset(&mut self) {
        if self.quit_count > 0 {
            self.quit_threshold = ((self.quit_count + self.quit_threshold)
                / Self::EWMA_WEIGHT_DENOM)
                .max(self.min_quit_threshold);
        }
        self.quit_count = 0;
    }

    pub(crate) fn reset_quit_threshold(&mut self, min_quit_threshold: u32) {
        self.min_quit_threshold = min_quit_threshold;
        self.quit_threshold = self.quit_threshold.max(min_quit_threshold);
    }

    /// Backs off once. Returns `true` when the worker should try to quit.
    pub(crate) fn try_to_quit(&mut self) -> bool {
        for _ in 0..16 {
            core::hint::spin_loop();
        }
        std::thread::yield_now();

        let quit = self.quit_count >= self.quit_threshold.saturating_mul(2);
        self.quit_count += 1;
        quit
    }
}

// === thread-local identity ===

pub(crate) fn current_worker(hooks: &TlsHooks) -> Option<NonNull<WorkerState>> {
    NonNull::new((hooks.get)() as *mut WorkerState)
}

/// Resolves the calling thread's worker state.
///
/// # Safety
///
/// The caller must guarantee the pool that owns the state is still alive for
/// the returned lifetime.
pub(crate) unsafe fn current_worker_ref<'a>(hooks: &TlsHooks) -> Option<&'a WorkerState> {
    // Safety: ensured by caller.
    current_worker(hooks).map(|ptr| unsafe { &*ptr.as_ptr() })
}

/// Makes `state` the calling thread's worker identity, unless the thread
/// already has one; then the existing identity just gains a reference.
/// Returns the state that is actually referenced.
pub(crate) fn install_thread_state(
    hooks: &TlsHooks,
    state: &WorkerState,
) -> NonNull<WorkerState> {
    if let Some(existing) = current_worker(hooks) {
        // Safety: a TLS-installed state is kept alive by its installer.
        unsafe { existing.as_ref() }
            .tls_refs
            .fetch_add(1, Ordering::AcqRel);
        existing
    } else {
        state.tls_refs.fetch_add(1, Ordering::AcqRel);
        (hooks.set)(core::ptr::from_ref(state) as usize);
        NonNull::from(state)
    }
}

/// Releases one reference on the calling thread's worker identity, clearing
/// the TLS word when the last reference goes away.
pub(crate) fn release_thread_state(hooks: &TlsHooks) {
    let Some(state) = current_worker(hooks) else {
        debug_assert!(false, "releasing a thread without worker state");
        return;
    };
    // Safety: a TLS-installed state is kept alive by its installer.
    if unsafe { state.as_ref() }.tls_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        (hooks.set)(0);
    }
}

// === worker thread routine ===

pub(crate) fn worker_main(pool: Arc<PoolInner>, index: usize) {
    let me = &pool.workers[index];
    let _span = tracing::debug_span!("worker", id = %me.id).entered();

    debug_assert_eq!((pool.tls.get)(), 0, "worker thread already has an identity");
    install_thread_state(&pool.tls, me);

    #[cfg(target_os = "linux")]
    pool.apply_thread_options(index);

    if let Some(visitor) = &pool.visitor {
        visitor.on_thread_start(me.id);
    }

    // Prime the task cache.
    if pool.initial_task_count > 0 {
        let primed: Vec<_> = (0..pool.initial_task_count)
            .map(|_| task::allocate_waiter(Some(&me.cache)))
            .collect();
        for task in primed.into_iter().rev() {
            // Safety: freshly allocated, never shared.
            unsafe {
                task.drop_payload();
                cache::free_task(task, Some(&me.cache));
            }
        }
    }

    execution_loop(me, &pool, index);

    if let Some(visitor) = &pool.visitor {
        visitor.on_thread_exit(me.id);
    }

    release_thread_state(&pool.tls);
}

fn execution_loop(me: &WorkerState, pool: &PoolInner, index: usize) {
    // Park until the first submission; a wake that raced thread startup has
    // latched the semaphore and falls straight through.
    me.sleep(pool, false);

    let mut sticky_idx = 0usize;
    let mut reset_search = true;
    let mut backoff = TerminationBackoff::new(1);

    while pool.is_running() {
        while !pool.is_halting() && pool.is_running() {
            if scan_and_run(me, index, &mut sticky_idx, reset_search, &mut backoff) {
                reset_search = false;
                continue;
            }

            if backoff.try_to_quit() {
                // Quit threshold reached: one last look before sleeping.
                if scan_and_run(me, index, &mut sticky_idx, true, &mut backoff) {
                    reset_search = false;
                    continue;
                }

                me.sleep(pool, false);
                backoff.reset_quit_threshold(me.quit_threshold().saturating_mul(2));
                reset_search = true;
            }
        }

        if !pool.is_running() {
            break;
        }
        me.halt(pool);
    }
}

/// One round-robin pass over the registered schedulers. Enters (and runs) the
/// first scheduler with work; returns whether any scheduler was entered.
fn scan_and_run(
    me: &WorkerState,
    index: usize,
    sticky_idx: &mut usize,
    reset_search: bool,
    backoff: &mut TerminationBackoff,
) -> bool {
    let registered = me.registered.read().clone();
    let count = registered.len();
    if count == 0 {
        return false;
    }

    let begin = (*sticky_idx + 1) % count;
    for step in 0..count {
        let slot = (begin + step) % count;
        if !reset_search && slot == *sticky_idx {
            // Wrapped all the way around without finding work.
            return false;
        }

        let core = &registered[slot];
        let local = core.local(index);
        let _access = local.worker_access.lock();
        if !core.is_attached() {
            continue;
        }

        let found = local
            .get_non_local_task(core, Some(me), true, false)
            .or_else(|| local.steal_external(core));

        if let Some(task) = found {
            *sticky_idx = slot;
            tracing::trace!(worker = %me.id, scheduler = core.id, "entering scheduler");
            if local.run(Some(task)) {
                backoff.reset();
            }
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_quits_after_threshold() {
        let mut backoff = TerminationBackoff::new(2);
        let mut rounds = 0;
        while !backoff.try_to_quit() {
            rounds += 1;
            assert!(rounds < 100, "backoff never reached the quit threshold");
        }
        assert!(rounds >= 2);
    }

    #[test]
    fn backoff_threshold_follows_streak_length() {
        let mut backoff = TerminationBackoff::new(1);
        // A long unproductive streak...
        for _ in 0..40 {
            backoff.try_to_quit();
        }
        // ...folded in on reset raises the threshold above the minimum.
        backoff.reset();
        assert!(backoff.quit_threshold > 1);
        assert_eq!(backoff.quit_count, 0);
    }
}
