// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local worker identity.
//!
//! The current worker is stored as an opaque word behind a pair of function
//! pointers rather than a language-builtin `thread_local!` access, because a
//! pool and its clients may live in different shared libraries with distinct
//! TLS segments. The default hooks use this crate's own thread-local cell.

use core::cell::Cell;

/// Getter/setter pair for the thread-local worker state word.
///
/// Both functions must behave like thread-local storage: a value stored via
/// `set` on some thread must be returned by `get` on that same thread, and
/// `get` must return 0 on threads that never stored a value.
#[derive(Clone, Copy, Debug)]
pub struct TlsHooks {
    pub get: fn() -> usize,
    pub set: fn(usize),
}

impl Default for TlsHooks {
    fn default() -> Self {
        Self {
            get: default_get,
            set: default_set,
        }
    }
}

thread_local! {
    static WORKER_STATE: Cell<usize> = const { Cell::new(0) };
}

fn default_get() -> usize {
    WORKER_STATE.with(Cell::get)
}

fn default_set(state: usize) {
    WORKER_STATE.with(|cell| cell.set(state));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hooks_roundtrip() {
        let hooks = TlsHooks::default();
        assert_eq!((hooks.get)(), 0);
        (hooks.set)(0xfeed);
        assert_eq!((hooks.get)(), 0xfeed);
        (hooks.set)(0);
        assert_eq!((hooks.get)(), 0);
    }

    #[test]
    fn default_hooks_are_thread_local() {
        let hooks = TlsHooks::default();
        (hooks.set)(17);
        std::thread::spawn(move || {
            assert_eq!((hooks.get)(), 0);
            (hooks.set)(99);
            assert_eq!((hooks.get)(), 99);
        })
        .join()
        .unwrap();
        assert_eq!((hooks.get)(), 17);
        (hooks.set)(0);
    }
}
