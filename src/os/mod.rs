// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.
//!
//! The rest of the crate is written against the names re-exported here
//! rather than against `std::sync` directly, the same way `aster-mlsdisk`
//! isolates its `ostd` dependency behind its own `os` module. Swapping this
//! module for one backed by a kernel's native primitives (as the teacher
//! does for `ostd`) should not require touching any other module.

use std::fmt;

pub use std::collections::BTreeMap;
pub use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// A spin lock for the reservoir lock of spec.md §5, which must never be
/// held across a suspension point.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub fn new(t: T) -> Self {
        Self {
            inner: spin::Mutex::new(t),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock").field("inner", &self.inner).finish()
    }
}
