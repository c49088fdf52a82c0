// SPDX-License-Identifier: MPL-2.0

//! Transaction identity and the reader/writer barrier that separates the
//! stable view of a volume from its in-flight dirty view.
//!
//! `aster-mlsdisk`'s `tx` module (`TxProvider`/`Tx`/`TxStatus`) tracks a
//! transaction's lifecycle through commit/abort handlers so L4's LSM-tree
//! can flush its write buffer exactly once, atomically, on commit. The
//! allocators in this crate need a narrower slice of that: a monotonic
//! transaction id so `BlockRef.seq` can tell "dirtied in the current
//! transaction" from "stable as of some earlier one" (spec.md's `was_free`
//! reuse rule), and a barrier so a reader never observes a transaction
//! mid-commit. `TransactionGuard` is that trait; `SimpleTxBarrier` is the
//! in-memory implementation this crate's own tests run against.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::os::{Condvar, Mutex};
use crate::prelude::*;

/// What a transaction is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Ongoing,
    Committed,
    Aborted,
}

/// Transaction identity and the reader/writer barrier around commit.
///
/// # Thread safety
///
/// Any number of readers may hold a read guard concurrently with each
/// other; `commit`/`abort` take the barrier exclusively, so a reader started
/// before a commit either sees the fully-old state or the fully-new one,
/// never a partial write.
pub trait TransactionGuard: Send + Sync {
    /// The id of the transaction currently in flight.
    fn current_id(&self) -> u64;

    /// True if `seq` was stamped by the transaction currently in flight
    /// (i.e. the block it tags was already dirtied this transaction and can
    /// be reused in place rather than reallocated).
    fn is_current(&self, seq: u64) -> bool {
        seq != 0 && seq == self.current_id()
    }

    /// Blocks until no commit is in progress, then lets the caller proceed
    /// as a reader. Must be released with [`TransactionGuard::reader_release`].
    fn reader_hold(&self);

    fn reader_release(&self);

    /// Commits the current transaction: blocks until all readers have
    /// released, advances to a new transaction id, and returns it.
    fn commit(&self) -> u64;

    /// Aborts the current transaction without advancing its id; any block
    /// stamped with the current id must be treated as still-dirty garbage
    /// by the caller's own rollback logic.
    fn abort(&self);
}

/// Reader/writer counts behind [`SimpleTxBarrier`], the same
/// `Mutex` + `Condvar` pairing `AllocTable` uses for its `num_free` wait.
#[derive(Default)]
struct BarrierState {
    readers: u32,
    committing: bool,
}

/// A `Mutex`+`Condvar`-based `TransactionGuard`: any number of readers may
/// hold the barrier concurrently; `commit`/`abort` wait for all of them to
/// release before advancing the transaction id.
pub struct SimpleTxBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    current: AtomicU64,
}

impl SimpleTxBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
            current: AtomicU64::new(1),
        }
    }
}

impl Default for SimpleTxBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionGuard for SimpleTxBarrier {
    fn current_id(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn reader_hold(&self) {
        let mut state = self.state.lock().unwrap();
        while state.committing {
            state = self.cvar.wait(state).unwrap();
        }
        state.readers += 1;
    }

    fn reader_release(&self) {
        let mut state = self.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.cvar.notify_all();
        }
    }

    fn commit(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        while state.committing || state.readers > 0 {
            state = self.cvar.wait(state).unwrap();
        }
        state.committing = true;
        drop(state);

        let id = self.current.fetch_add(1, Ordering::AcqRel) + 1;

        let mut state = self.state.lock().unwrap();
        state.committing = false;
        self.cvar.notify_all();
        debug!("[SimpleTxBarrier] advanced to transaction {id}");
        id
    }

    fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        while state.committing || state.readers > 0 {
            state = self.cvar.wait(state).unwrap();
        }
        info!("[SimpleTxBarrier] aborted transaction {}", self.current_id());
    }
}
