// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker sleep/wake coordination.
//!
//! A [`ThreadBlocker`] puts one worker to sleep on a manual-reset
//! [`BinarySemaphore`] and hands wakers a strict handshake:
//!
//! ```text
//! sleeper: AWAKE ─▶ BLOCKED ─(semaphore)─▶ UNBLOCKED ─▶ ...... ─▶ AWAKE
//! waker:              └─ signal until ¬BLOCKED ─▶ OUT_OF_SIGNAL_LOOP ─┘
//! ```
//!
//! Only one waker may operate on a sleeper at a time (`num_wakers` is a
//! single-slot claim); the transitions are totally ordered and pairwise
//! synchronizing, so a woken worker observes all work submitted before its
//! wake. A waker leaves `resume_count` behind so the woken worker can fan the
//! wake out to more sleepers.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::{Condvar, Mutex};

/// A manual-reset binary semaphore.
///
/// `signal` latches the semaphore; `wait` returns immediately (without
/// sleeping) while the latch is set; `reset` clears the latch.
pub(crate) struct BinarySemaphore {
    signaled: Mutex<bool>,
    cond: Condvar,
}

// === impl BinarySemaphore ===

impl BinarySemaphore {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks until signaled. Returns `false` when the latch was already set
    /// and no sleep happened.
    pub(crate) fn wait(&self) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return false;
        }
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        true
    }

    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }
}

/// Sleeper states. See the module docs for the handshake.
pub(crate) mod state {
    pub(crate) const AWAKE: u32 = 0;
    pub(crate) const BLOCKED: u32 = 1;
    pub(crate) const UNBLOCKED: u32 = 2;
    pub(crate) const OUT_OF_SIGNAL_LOOP: u32 = 3;
}

pub(crate) struct ThreadBlocker {
    state: AtomicU32,
    /// Single-slot waker claim.
    num_wakers: AtomicU32,
    /// Set by the waker; the sleeper resets the semaphore on its way out.
    reset_on_wake: AtomicBool,
    /// Left behind by the waker: how many more workers the woken worker
    /// should wake (the wake cascade).
    resume_count: AtomicU32,
    semaphore: BinarySemaphore,
}

/// What a completed [`ThreadBlocker::block`] observed.
pub(crate) struct BlockOutcome {
    /// `false` when the semaphore was already signaled and no sleep happened.
    pub(crate) did_sleep: bool,
    /// Number of additional workers this worker should wake.
    pub(crate) resume_count: u32,
}

// === impl ThreadBlocker ===

impl ThreadBlocker {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(state::AWAKE),
            num_wakers: AtomicU32::new(0),
            reset_on_wake: AtomicBool::new(false),
            resume_count: AtomicU32::new(0),
            semaphore: BinarySemaphore::new(),
        }
    }

    /// Clears the semaphore latch. Used when an affinitized task is consumed,
    /// since its submission latches the semaphore without a reset.
    pub(crate) fn reset_sleep_state(&self) {
        self.semaphore.reset();
    }

    /// Blocks the calling worker until woken. Sleeper side.
    ///
    /// With `force_reset` the semaphore latch is cleared first, guaranteeing
    /// an actual sleep; otherwise a latched semaphore turns this into a brief
    /// pass-through so submissions raced against the sleep are not lost.
    pub(crate) fn block(&self, force_reset: bool) -> BlockOutcome {
        if force_reset {
            self.semaphore.reset();
        }

        self.state.store(state::BLOCKED, Ordering::SeqCst);

        let did_sleep = self.semaphore.wait();

        self.state.swap(state::UNBLOCKED, Ordering::SeqCst);

        // Wait for an engaged waker to leave its signal loop. The semaphore
        // latch can also wake us with *no* waker engaged (a forced wake that
        // missed, or a leftover latch), in which case `num_wakers` drains to
        // zero without the state ever reaching OUT_OF_SIGNAL_LOOP. The SeqCst
        // ordering against the waker's claim guarantees that at least one
        // side observes the other.
        loop {
            if self.state.load(Ordering::SeqCst) == state::OUT_OF_SIGNAL_LOOP {
                break;
            }
            if self.num_wakers.load(Ordering::SeqCst) == 0 {
                break;
            }
            core::hint::spin_loop();
        }

        if self.reset_on_wake.swap(false, Ordering::AcqRel) {
            self.semaphore.reset();
        }

        self.state.swap(state::AWAKE, Ordering::SeqCst);

        BlockOutcome {
            did_sleep,
            resume_count: self.resume_count.swap(0, Ordering::Relaxed),
        }
    }

    /// Spin until the waker (if any) has fully left the handshake. Sleeper
    /// side, after [`ThreadBlocker::block`] returns and the sleep accounting
    /// is unwound.
    pub(crate) fn wait_for_wakers(&self) {
        while self.num_wakers.load(Ordering::Acquire) > 0 {
            core::hint::spin_loop();
        }
    }

    /// Wakes the sleeper. Waker side.
    ///
    /// Returns `true` only if a `BLOCKED` sleeper was transitioned through
    /// the handshake; `count - 1` is left behind as the resume cascade. With
    /// `force` the semaphore is latched even when no sleeper was caught, so
    /// a worker racing into sleep finds the latch and comes straight back.
    pub(crate) fn wake(&self, count: u32, reset: bool, force: bool) -> bool {
        debug_assert!(count > 0);

        if !force && self.state.load(Ordering::SeqCst) != state::BLOCKED {
            return false;
        }

        // Only one waker may run the handshake.
        if self.num_wakers.fetch_add(1, Ordering::SeqCst) != 0 {
            self.num_wakers.fetch_sub(1, Ordering::SeqCst);
            if force {
                self.semaphore.signal();
            }
            return false;
        }

        if self.state.load(Ordering::SeqCst) != state::BLOCKED {
            self.num_wakers.fetch_sub(1, Ordering::SeqCst);
            if force {
                self.semaphore.signal();
            }
            return false;
        }

        // Leave the cascade before the sleeper can observe
        // OUT_OF_SIGNAL_LOOP.
        self.resume_count.store(count - 1, Ordering::Relaxed);

        loop {
            self.reset_on_wake.store(reset, Ordering::Relaxed);
            self.semaphore.signal();
            if self.state.load(Ordering::SeqCst) != state::BLOCKED {
                break;
            }
            core::hint::spin_loop();
        }

        self.state.swap(state::OUT_OF_SIGNAL_LOOP, Ordering::SeqCst);

        // Hold the claim until the sleeper is fully awake so a second waker
        // cannot start mid-handshake.
        while self.state.load(Ordering::SeqCst) != state::AWAKE {
            core::hint::spin_loop();
        }

        self.num_wakers.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn semaphore_latches() {
        let sem = BinarySemaphore::new();
        sem.signal();
        assert!(!sem.wait(), "latched semaphore must not sleep");
        assert!(!sem.wait(), "latch survives wait");
        sem.reset();
        sem.signal();
        assert!(!sem.wait());
    }

    #[test]
    fn wake_on_awake_worker_returns_false() {
        let blocker = ThreadBlocker::new();
        assert!(!blocker.wake(1, false, false));
    }

    #[test]
    fn sleep_then_wake() {
        let blocker = Arc::new(ThreadBlocker::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let sleeper = {
            let blocker = blocker.clone();
            let woken = woken.clone();
            std::thread::spawn(move || {
                let outcome = blocker.block(true);
                assert!(outcome.did_sleep);
                woken.fetch_add(1, Ordering::Release);
                blocker.wait_for_wakers();
            })
        };

        // Retry until the sleeper has actually published BLOCKED.
        while !blocker.wake(1, false, false) {
            std::thread::yield_now();
        }

        sleeper.join().unwrap();
        assert_eq!(woken.load(Ordering::Acquire), 1);
    }

    #[test]
    fn forced_wake_latches_for_worker_racing_into_sleep() {
        let blocker = ThreadBlocker::new();
        // No sleeper yet; the forced wake must latch the semaphore.
        assert!(!blocker.wake(1, false, true));
        // The subsequent non-forced sleep comes straight back.
        let outcome = blocker.block(false);
        assert!(!outcome.did_sleep);
    }

    #[test]
    fn resume_count_is_left_behind() {
        let blocker = Arc::new(ThreadBlocker::new());

        let sleeper = {
            let blocker = blocker.clone();
            std::thread::spawn(move || {
                let outcome = blocker.block(true);
                blocker.wait_for_wakers();
                outcome.resume_count
            })
        };

        while !blocker.wake(4, true, false) {
            std::thread::yield_now();
        }

        assert_eq!(sleeper.join().unwrap(), 3);
    }

    #[test]
    fn concurrent_wakers_only_one_wins() {
        let blocker = Arc::new(ThreadBlocker::new());

        let sleeper = {
            let blocker = blocker.clone();
            std::thread::spawn(move || {
                let outcome = blocker.block(true);
                blocker.wait_for_wakers();
                assert!(outcome.did_sleep);
            })
        };
        // Give the sleeper a moment to publish BLOCKED.
        std::thread::sleep(Duration::from_millis(10));

        let winners: usize = (0..4)
            .map(|_| {
                let blocker = blocker.clone();
                std::thread::spawn(move || usize::from(blocker.wake(1, false, false)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert!(winners <= 1, "at most one waker may win the handshake");
        // The sleeper may not have been BLOCKED yet when the wakers ran; wake
        // it for real if every waker lost.
        if winners == 0 {
            while !blocker.wake(1, false, false) {
                std::thread::yield_now();
            }
        }
        sleeper.join().unwrap();
    }
}
