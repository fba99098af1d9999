//-
// Copyright (c) 2026, the Mailcell authors.
//
// This file is part of Mailcell.
//
// Mailcell is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcell is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailcell. If not, see <http://www.gnu.org/licenses/>.

//! The per-mailbox lock.
//!
//! Exactly one `MailboxLock` exists per mailbox; it is the sole gate for
//! structural mutation of the mailbox's counters and caches. The lock is
//! mailbox-scoped only and the core never acquires two mailboxes' locks
//! together, so there are no lock-ordering concerns; cross-mailbox
//! operations are explicitly non-atomic.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::support::error::Error;
use crate::support::system_config::StoreConfig;

/// The tier of lock a transaction requests or holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Decides the lock tier actually acquired for a request.
///
/// A request declared as `Read` is silently upgraded to `Write` if the
/// folder/tag cache is cold (repopulation mutates shared state), if the
/// deployment disallows split read/write locking, or if the global
/// force-write flag is set. The caller observes the escalation through the
/// return value of [`MailboxLock::acquire`], so code which assumes
/// read-only cannot accidentally skip write-only invariant checks.
pub fn decide_lock_kind(
    requested: LockKind,
    cache_warm: bool,
    config: &StoreConfig,
) -> LockKind {
    match requested {
        LockKind::Write => LockKind::Write,
        LockKind::Read
            if !cache_warm
                || !config.split_rw_locking
                || config.force_write_lock =>
        {
            LockKind::Write
        },
        LockKind::Read => LockKind::Read,
    }
}

/// A reentrant read/write lock scoped to one mailbox.
///
/// Both tiers are reentrant per thread; a thread holding the write lock may
/// recursively acquire either tier (a nested read acquisition is counted and
/// reported as write, since the thread's effective access is exclusive).
/// Acquisition blocks with a bounded wait and expiry surfaces as the
/// retryable [`Error::LockTimeout`], never as a deadlock.
pub struct MailboxLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_depth: u32,
    readers: HashMap<ThreadId, u32>,
}

impl MailboxLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquires the lock at the given tier, waiting at most `timeout`.
    ///
    /// Returns the tier actually held, which is `Write` when the calling
    /// thread already owns the write lock regardless of `kind`.
    ///
    /// ## Panics
    ///
    /// Panics if the calling thread holds only the read lock and requests
    /// `Write`. Upgrades cannot be granted safely (another reader may be
    /// waiting to do the same); the escalation rule exists precisely so
    /// that intent is settled before acquisition.
    pub fn acquire(
        &self,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<LockKind, Error> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        // Reentry into an already-held write lock short-circuits the wait.
        if state.writer == Some(me) {
            state.write_depth += 1;
            return Ok(LockKind::Write);
        }

        match kind {
            LockKind::Write => {
                assert!(
                    !state.readers.contains_key(&me),
                    "cannot upgrade a read lock to a write lock",
                );

                loop {
                    if state.writer.is_none() && state.readers.is_empty() {
                        state.writer = Some(me);
                        state.write_depth = 1;
                        return Ok(LockKind::Write);
                    }

                    state = self.wait(state, deadline)?;
                }
            },
            LockKind::Read => {
                loop {
                    if state.writer.is_none() {
                        *state.readers.entry(me).or_insert(0) += 1;
                        return Ok(LockKind::Read);
                    }

                    state = self.wait(state, deadline)?;
                }
            },
        }
    }

    /// Releases one level of the lock previously returned by `acquire`.
    pub fn release(&self, kind: LockKind) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        match kind {
            LockKind::Write => {
                assert_eq!(Some(me), state.writer, "releasing foreign lock");
                state.write_depth -= 1;
                if 0 == state.write_depth {
                    state.writer = None;
                    self.cond.notify_all();
                }
            },
            LockKind::Read => {
                let depth = state
                    .readers
                    .get_mut(&me)
                    .expect("releasing a read lock not held by this thread");
                *depth -= 1;
                if 0 == *depth {
                    state.readers.remove(&me);
                    if state.readers.is_empty() {
                        self.cond.notify_all();
                    }
                }
            },
        }
    }

    /// Returns the tier the calling thread currently holds, if any.
    pub fn held_by_current_thread(&self) -> Option<LockKind> {
        let me = thread::current().id();
        let state = self.state.lock().unwrap();
        if state.writer == Some(me) {
            Some(LockKind::Write)
        } else if state.readers.contains_key(&me) {
            Some(LockKind::Read)
        } else {
            None
        }
    }

    fn wait<'a>(
        &'a self,
        state: std::sync::MutexGuard<'a, LockState>,
        deadline: Instant,
    ) -> Result<std::sync::MutexGuard<'a, LockState>, Error> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::LockTimeout);
        }

        let (state, _) = self
            .cond
            .wait_timeout(state, deadline - now)
            .unwrap();
        Ok(state)
    }
}

impl Default for MailboxLock {
    fn default() -> Self {
        Self::new()
    }
}
