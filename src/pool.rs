// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker pool: OS thread owner and sleep/wake coordinator.
//!
//! A pool owns `N` workers. Worker 0 is the *master*: the thread that called
//! [`WorkerPool::initialize`]; it keeps its own task cache and identity but
//! never runs the worker loop, participating only through explicit waits.
//! Workers 1..N each run an OS thread. Shutdown first halts every non-master
//! worker in a dedicated gate (so reconfiguration never races the dispatch
//! loops), detaches the registered schedulers, then resumes the workers into
//! their exit path and joins them.

use crate::error::{PoolInitError, SchedulerInitError};
use crate::id::{self, OwnedId};
use crate::scheduler::SchedulerCore;
use crate::tls::TlsHooks;
use crate::worker::{self, WorkerState, worker_main};
use core::fmt;
use core::ptr::{self, NonNull};
use parking_lot::{FairMutex, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::thread::JoinHandle;

/// Default upper bound for task allocations served by the per-worker slab.
pub const DEFAULT_CACHABLE_TASK_SIZE: usize = 256;

/// Requested OS scheduling priority for a worker thread. Applied best-effort;
/// platforms without support ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

/// Per-worker thread configuration.
#[derive(Debug, Clone)]
pub struct WorkerThreadDesc {
    /// Thread name; a default is derived from the pool name.
    pub name: Option<String>,
    /// Thread stack size in bytes.
    pub stack_size: Option<usize>,
    /// Arbitrary pointer surfaced to tasks via
    /// [`TaskContext::user_data`][crate::TaskContext::user_data].
    pub user_data: *mut (),
    /// Hardware threads this worker may run on; empty means unpinned.
    pub affinity: Vec<usize>,
    /// OS-level scheduling priority.
    pub priority: ThreadPriority,
}

impl Default for WorkerThreadDesc {
    fn default() -> Self {
        Self {
            name: None,
            stack_size: None,
            user_data: ptr::null_mut(),
            affinity: Vec::new(),
            priority: ThreadPriority::Normal,
        }
    }
}

/// Callbacks invoked on worker thread start and exit.
pub trait WorkerPoolVisitor: Send + Sync {
    fn on_thread_start(&self, worker_id: OwnedId) {
        let _ = worker_id;
    }
    fn on_thread_exit(&self, worker_id: OwnedId) {
        let _ = worker_id;
    }
}

/// Configuration for a [`WorkerPool`].
///
/// `workers[0]` describes the master. The master thread is the caller's own;
/// its affinity and priority are left untouched.
pub struct WorkerPoolDesc {
    pub workers: Vec<WorkerThreadDesc>,
    /// External TLS accessors for cross-library worker identity; the crate's
    /// own thread-local cell is used when absent.
    pub tls: Option<TlsHooks>,
    pub visitor: Option<Arc<dyn WorkerPoolVisitor>>,
    /// Task allocations up to this size go through the per-worker slab.
    pub cachable_task_size: usize,
    /// Number of task slots to pre-allocate per worker.
    pub initial_task_count_per_worker: usize,
    /// Debug label.
    pub name: String,
}

impl Default for WorkerPoolDesc {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            tls: None,
            visitor: None,
            cachable_task_size: DEFAULT_CACHABLE_TASK_SIZE,
            initial_task_count_per_worker: 0,
            name: String::new(),
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) struct ThreadOptions {
    affinity: Vec<usize>,
    priority: ThreadPriority,
}

pub(crate) struct PoolInner {
    pub(crate) pool_id: u16,
    pub(crate) name: String,
    pub(crate) tls: TlsHooks,
    pub(crate) workers: Box<[WorkerState]>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Schedulers attached to this pool. The fair lock keeps attach/detach
    /// from starving behind the wake path during reconfiguration.
    registered: FairMutex<Vec<Arc<SchedulerCore>>>,
    pub(crate) sleeping: AtomicU32,
    pub(crate) halted: AtomicU32,
    is_running: AtomicBool,
    is_halting: AtomicBool,
    pub(crate) visitor: Option<Arc<dyn WorkerPoolVisitor>>,
    pub(crate) initial_task_count: usize,
    /// The worker state holding this pool's master TLS reference.
    master_tls: AtomicPtr<WorkerState>,
    thread_options: Box<[ThreadOptions]>,
}

// === impl PoolInner ===

impl PoolInner {
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_halting(&self) -> bool {
        self.is_halting.load(Ordering::Acquire)
    }

    /// Wakes up to one blocked worker, preferring a random victim. Returns
    /// whether a worker was actually transitioned out of sleep.
    pub(crate) fn wake_worker(
        &self,
        caller: Option<&WorkerState>,
        count: u32,
        reset: bool,
    ) -> bool {
        // Cheap gate: no one is sleeping, nothing to do.
        if self.sleeping.load(Ordering::Acquire) == 0 {
            return false;
        }
        let count_workers = self.workers.len();
        if count_workers <= 1 {
            return false;
        }

        // Start at a random non-master index; the master never sleeps.
        let start = if caller.is_some() {
            fastrand::usize(1..count_workers)
        } else {
            1
        };
        let caller_idx = caller
            .filter(|w| w.id.owner_id() == self.pool_id)
            .map(|w| w.id.local_id() as usize);

        for index in (start..count_workers).chain(1..start) {
            if Some(index) == caller_idx {
                continue;
            }
            if self.workers[index].wake(count, reset, false) {
                return true;
            }
        }
        false
    }

    /// Drives every non-master worker into the halt gate.
    pub(crate) fn halt_all(&self) {
        tracing::debug!(pool = self.pool_id, "halting workers");
        self.is_halting.store(true, Ordering::SeqCst);

        let target = self.workers.len() as u32 - 1;
        // Safety: callers hold the pool alive.
        let caller = unsafe { worker::current_worker_ref(&self.tls) };

        while self.halted.load(Ordering::Acquire) < target {
            // Break sleepers out so they can observe the halt.
            self.wake_worker(caller, self.workers.len() as u32, true);
            std::thread::yield_now();
        }
    }

    /// Releases every worker from the halt gate.
    pub(crate) fn resume_all(&self) {
        tracing::debug!(pool = self.pool_id, "resuming workers");
        self.is_halting.store(false, Ordering::SeqCst);

        while self.halted.load(Ordering::Acquire) > 0 {
            for worker in &self.workers[1..] {
                worker.resume();
            }
            std::thread::yield_now();
        }
    }

    /// Attaches a scheduler: pool registry plus each non-master worker's
    /// round-robin list.
    pub(crate) fn register_scheduler(
        &self,
        core: &Arc<SchedulerCore>,
    ) -> Result<(), SchedulerInitError> {
        let mut registered = self.registered.lock();
        if !self.is_running() {
            return Err(SchedulerInitError::PoolNotRunning);
        }
        registered.push(core.clone());
        for worker in &self.workers[1..] {
            worker.registered.write().push(core.clone());
        }
        Ok(())
    }

    /// Detaches a scheduler, waiting out any worker currently inside one of
    /// its local schedulers.
    pub(crate) fn unregister_scheduler(&self, core: &Arc<SchedulerCore>) {
        let mut registered = self.registered.lock();
        let Some(position) = registered.iter().position(|c| Arc::ptr_eq(c, core)) else {
            return;
        };

        for (index, worker) in self.workers.iter().enumerate().skip(1) {
            let _access = core.local(index).worker_access.lock();
            worker.registered.write().retain(|c| !Arc::ptr_eq(c, core));
        }
        registered.swap_remove(position);
    }

    fn unregister_all_schedulers(&self) {
        let mut registered = self.registered.lock();
        for core in registered.drain(..) {
            core.detach();
        }
        for worker in &self.workers[1..] {
            worker.registered.write().clear();
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn apply_thread_options(&self, index: usize) {
        let options = &self.thread_options[index];

        if !options.affinity.is_empty() {
            // Safety: a zeroed cpu_set_t is a valid empty set; the set
            // pointer is live for the call.
            unsafe {
                let mut set: libc::cpu_set_t = core::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for &cpu in &options.affinity {
                    libc::CPU_SET(cpu, &mut set);
                }
                if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
                    tracing::warn!(worker = index, "failed to set worker thread affinity");
                }
            }
        }

        let nice = match options.priority {
            ThreadPriority::Lowest => 19,
            ThreadPriority::BelowNormal => 5,
            ThreadPriority::Normal => return,
            ThreadPriority::AboveNormal => -5,
            ThreadPriority::Highest => -10,
        };
        // Safety: plain syscalls on the calling thread; failure (e.g. raising
        // priority unprivileged) is tolerated.
        unsafe {
            let tid = libc::gettid();
            if libc::setpriority(libc::PRIO_PROCESS as _, tid as libc::id_t, nice) != 0 {
                tracing::debug!(worker = index, "failed to set worker thread priority");
            }
        }
    }
}

/// A fixed fleet of worker threads with process-level sleep/wake and halt
/// support. See the [module docs][self].
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

// === impl WorkerPool ===

impl WorkerPool {
    /// Creates a pool with `worker_count` workers (including the calling
    /// thread as master). Zero means one worker per hardware thread.
    pub fn initialize(worker_count: usize) -> Result<Self, PoolInitError> {
        let count = if worker_count == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            worker_count
        };
        Self::initialize_with(WorkerPoolDesc {
            workers: vec![WorkerThreadDesc::default(); count],
            ..WorkerPoolDesc::default()
        })
    }

    pub fn initialize_with(desc: WorkerPoolDesc) -> Result<Self, PoolInitError> {
        if desc.workers.is_empty() {
            return Err(PoolInitError::NoWorkers);
        }

        let pool_id = id::next_pool_id();
        let tls = desc.tls.unwrap_or_default();
        let worker_count = desc.workers.len();

        let inner = Arc::new(PoolInner {
            pool_id,
            name: desc.name.clone(),
            tls,
            workers: desc
                .workers
                .iter()
                .enumerate()
                .map(|(index, w)| {
                    WorkerState::new(
                        OwnedId::new(pool_id, index as u16),
                        desc.cachable_task_size,
                        w.user_data,
                    )
                })
                .collect(),
            threads: Mutex::new(Vec::with_capacity(worker_count - 1)),
            registered: FairMutex::new(Vec::new()),
            sleeping: AtomicU32::new(0),
            halted: AtomicU32::new(0),
            is_running: AtomicBool::new(true),
            is_halting: AtomicBool::new(false),
            visitor: desc.visitor,
            initial_task_count: desc.initial_task_count_per_worker,
            master_tls: AtomicPtr::new(ptr::null_mut()),
            thread_options: desc
                .workers
                .iter()
                .map(|w| ThreadOptions {
                    affinity: w.affinity.clone(),
                    priority: w.priority,
                })
                .collect(),
        });

        tracing::debug!(pool = pool_id, workers = worker_count, name = %desc.name, "pool initializing");

        // The calling thread becomes (or joins) the master identity.
        let master = worker::install_thread_state(&inner.tls, &inner.workers[0]);
        inner.master_tls.store(master.as_ptr(), Ordering::Release);

        for (index, worker_desc) in desc.workers.iter().enumerate().skip(1) {
            let default_name = || {
                if desc.name.is_empty() {
                    format!("microsched-worker-{index}")
                } else {
                    format!("{}-worker-{index}", desc.name)
                }
            };
            let mut builder = std::thread::Builder::new()
                .name(worker_desc.name.clone().unwrap_or_else(default_name));
            if let Some(stack_size) = worker_desc.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let thread = builder.spawn({
                let inner = inner.clone();
                move || worker_main(inner, index)
            });
            match thread {
                Ok(handle) => inner.threads.lock().push(handle),
                Err(err) => {
                    Self::teardown_partial(&inner);
                    return Err(PoolInitError::ThreadSpawn(err));
                }
            }
        }

        Ok(Self { inner })
    }

    /// Tears down a half-initialized pool after a thread spawn failure.
    fn teardown_partial(inner: &Arc<PoolInner>) {
        inner.is_running.store(false, Ordering::Release);
        for worker in &inner.workers[1..] {
            // Forced wake: latches the semaphore even for workers that have
            // not parked yet, so they fall through and observe the stop.
            worker.wake(1, false, true);
        }
        for handle in inner.threads.lock().drain(..) {
            let _ = handle.join();
        }
        let master = inner.master_tls.swap(ptr::null_mut(), Ordering::AcqRel);
        if !master.is_null() {
            worker::release_thread_state(&inner.tls);
        }
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// Number of workers, including the master.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn pool_id(&self) -> u16 {
        self.inner.pool_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// The calling thread's worker id, or the unknown id for threads that
    /// are not workers.
    pub fn this_worker_id(&self) -> OwnedId {
        // Safety: `self` holds the pool alive.
        unsafe { worker::current_worker_ref(&self.inner.tls) }
            .map_or_else(OwnedId::unknown, |w| w.id)
    }

    /// Stops and joins every worker thread. Idempotent; registered
    /// schedulers are detached first.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.is_running() {
            return;
        }
        tracing::debug!(pool = inner.pool_id, "pool shutting down");

        inner.halt_all();
        inner.unregister_all_schedulers();

        let master = inner.master_tls.swap(ptr::null_mut(), Ordering::AcqRel);
        if !master.is_null() {
            debug_assert_eq!(
                worker::current_worker(&inner.tls).map(NonNull::as_ptr),
                Some(master),
                "a WorkerPool must be shut down on the thread that initialized it"
            );
            worker::release_thread_state(&inner.tls);
        }

        inner.is_running.store(false, Ordering::Release);
        inner.resume_all();

        let handles: Vec<_> = inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        inner.sleeping.store(0, Ordering::Release);
        tracing::debug!(pool = inner.pool_id, "pool destroyed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.inner.pool_id)
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}
