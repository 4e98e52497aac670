// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A low-latency, task-parallel execution substrate: a two-level fork/join
//! scheduler in which a fixed pool of worker threads cooperatively executes a
//! dynamically growing graph of small tasks.
//!
//! The building blocks:
//!
//! * [`WorkerPool`] owns the worker threads, their sleep/wake coordination
//!   and the halt gate used for safe reconfiguration and shutdown.
//! * [`MicroScheduler`] binds one dispatcher per worker; it allocates, spawns
//!   and waits on tasks, and composes with other schedulers through external
//!   stealing.
//! * [`TaskRef`] is a `Copy` handle to a task. The reference count encodes
//!   graph structure (live children plus the self reference) and is managed
//!   explicitly; continuation passing, scheduler bypass and task recycling
//!   are all expressed through it.
//!
//! ```
//! use microsched::{MicroScheduler, WorkerPool};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let pool = WorkerPool::initialize(4).unwrap();
//! let scheduler = MicroScheduler::initialize(&pool).unwrap();
//!
//! let sum = Arc::new(AtomicU64::new(0));
//! let task = scheduler.allocate_task({
//!     let sum = sum.clone();
//!     move |_ctx| {
//!         sum.fetch_add(42, Ordering::Relaxed);
//!         None
//!     }
//! });
//! scheduler.spawn_task_and_wait(task, 0);
//! assert_eq!(sum.load(Ordering::Relaxed), 42);
//!
//! scheduler.shutdown();
//! pool.shutdown();
//! ```
//!
//! # Contracts
//!
//! [`TaskRef`] is an unchecked handle, as raw as the task graph it describes:
//! using one after its task was destroyed, double-destroying, parenting a
//! task twice or spawning with an out-of-range affinity are contract
//! violations. They are asserted in debug builds; in release builds they are
//! undefined behavior, exactly like dangling pointers.

mod cache;
mod deque;
mod error;
mod id;
pub(crate) mod loom;
mod park;
mod pool;
mod queue;
mod scheduler;
mod task;
mod tls;
mod worker;

pub use error::{PoolInitError, SchedulerInitError};
pub use id::{OwnedId, UNKNOWN_ID, reset_id_generators};
pub use pool::{
    DEFAULT_CACHABLE_TASK_SIZE, ThreadPriority, WorkerPool, WorkerPoolDesc, WorkerPoolVisitor,
    WorkerThreadDesc,
};
pub use scheduler::{
    CallbackId, CheckForTaskFn, MicroScheduler, MicroSchedulerDesc, SchedulerHandle,
};
pub use task::{ANY_WORKER, TaskContext, TaskRef};
