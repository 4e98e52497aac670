// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU16, Ordering};
use core::fmt;

/// Sentinel for an id slot that has not been assigned.
pub const UNKNOWN_ID: u16 = u16::MAX;

/// A compound identifier: a `local` index owned by an `owner` entity.
///
/// Worker ids combine the pool id with the worker index; local scheduler ids
/// combine the micro-scheduler id with the worker index they are bound to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnedId {
    owner: u16,
    local: u16,
}

// === impl OwnedId ===

impl OwnedId {
    pub const fn new(owner: u16, local: u16) -> Self {
        Self { owner, local }
    }

    pub const fn unknown() -> Self {
        Self {
            owner: UNKNOWN_ID,
            local: UNKNOWN_ID,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.owner == UNKNOWN_ID
    }

    /// The id of the owning entity (pool or scheduler).
    pub fn owner_id(&self) -> u16 {
        self.owner
    }

    /// The index local to the owning entity.
    pub fn local_id(&self) -> u16 {
        self.local
    }

    /// The combined unique id.
    pub fn uid(&self) -> u32 {
        (u32::from(self.owner) << 16) | u32::from(self.local)
    }
}

impl Default for OwnedId {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Debug for OwnedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.local)
    }
}

impl fmt::Display for OwnedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// Process-wide id generators. These are owned by the runtime rather than
// hidden singletons so tests can reset them.

#[cfg(not(loom))]
static NEXT_POOL_ID: AtomicU16 = AtomicU16::new(0);
#[cfg(not(loom))]
static NEXT_SCHEDULER_ID: AtomicU16 = AtomicU16::new(0);

#[cfg(loom)]
loom::lazy_static! {
    static ref NEXT_POOL_ID: AtomicU16 = AtomicU16::new(0);
    static ref NEXT_SCHEDULER_ID: AtomicU16 = AtomicU16::new(0);
}

pub(crate) fn next_pool_id() -> u16 {
    let id = NEXT_POOL_ID.fetch_add(1, Ordering::AcqRel);
    debug_assert_ne!(id, UNKNOWN_ID, "pool id overflow");
    id
}

pub(crate) fn next_scheduler_id() -> u16 {
    let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::AcqRel);
    debug_assert_ne!(id, UNKNOWN_ID, "scheduler id overflow");
    id
}

/// Resets the process-wide pool and scheduler id generators.
///
/// Intended for tests that assert on concrete id values.
pub fn reset_id_generators() {
    NEXT_POOL_ID.store(0, Ordering::SeqCst);
    NEXT_SCHEDULER_ID.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_packs_owner_and_local() {
        let id = OwnedId::new(3, 7);
        assert_eq!(id.owner_id(), 3);
        assert_eq!(id.local_id(), 7);
        assert_eq!(id.uid(), (3 << 16) | 7);
    }

    #[test]
    fn unknown_is_unknown() {
        assert!(OwnedId::unknown().is_unknown());
        assert!(!OwnedId::new(0, 0).is_unknown());
    }
}
