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

//! Maintenance mode for a mailbox.
//!
//! While a mailbox is under maintenance (reindexing, restore, deletion),
//! only the thread that entered maintenance may open transactions on it;
//! everyone else is turned away with a retryable error. Maintenance nests on
//! the owning thread, and a maintenance episode that ends in failure leaves
//! the mailbox unavailable until it is reloaded from scratch.

use std::sync::Mutex;
use std::thread::{self, ThreadId};

use super::model::{AccountId, MailboxId};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Capability proving the holder began the current maintenance episode.
///
/// Ending maintenance requires presenting the token back, so unrelated code
/// cannot accidentally lift maintenance it never entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceToken {
    pub mailbox_id: MailboxId,
    pub account_id: AccountId,
    episode: u64,
}

pub struct MaintenanceState {
    log_prefix: LogPrefix,
    state: Mutex<State>,
}

enum State {
    Active,
    Maintenance {
        episode: u64,
        depth: u32,
        holder: ThreadId,
    },
    Unavailable,
}

impl MaintenanceState {
    pub fn new(log_prefix: LogPrefix) -> Self {
        Self {
            log_prefix,
            state: Mutex::new(State::Active),
        }
    }

    /// Enters maintenance, or nests if the calling thread already holds it.
    pub fn begin(
        &self,
        mailbox_id: MailboxId,
        account_id: &AccountId,
        episode: u64,
    ) -> Result<MaintenanceToken, Error> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Active => {
                log::info!(
                    "{} Entering maintenance (episode {})",
                    self.log_prefix,
                    episode,
                );
                *state = State::Maintenance {
                    episode,
                    depth: 1,
                    holder: thread::current().id(),
                };
                Ok(MaintenanceToken {
                    mailbox_id,
                    account_id: account_id.clone(),
                    episode,
                })
            },
            State::Maintenance {
                episode,
                ref mut depth,
                holder,
            } if holder == thread::current().id() => {
                *depth += 1;
                Ok(MaintenanceToken {
                    mailbox_id,
                    account_id: account_id.clone(),
                    episode,
                })
            },
            State::Maintenance { .. } => Err(Error::MailboxInMaintenance),
            State::Unavailable => Err(Error::MailboxUnavailable),
        }
    }

    /// Leaves one level of maintenance.
    ///
    /// An unsuccessful end marks the mailbox unavailable immediately,
    /// regardless of remaining nesting depth.
    pub fn end(
        &self,
        token: &MaintenanceToken,
        success: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Maintenance {
                episode,
                ref mut depth,
                holder,
            } if episode == token.episode => {
                debug_assert_eq!(holder, thread::current().id());

                if !success {
                    log::warn!(
                        "{} Maintenance failed; mailbox is now unavailable",
                        self.log_prefix,
                    );
                    *state = State::Unavailable;
                    return Ok(());
                }

                *depth -= 1;
                if 0 == *depth {
                    log::info!("{} Maintenance complete", self.log_prefix);
                    *state = State::Active;
                }
                Ok(())
            },
            _ => Err(Error::BadMaintenanceToken),
        }
    }

    /// Whether surrendering `token` once more would end the episode
    /// entirely. Only meaningful on the holder thread.
    pub fn ending_final_level(
        &self,
        token: &MaintenanceToken,
    ) -> Result<bool, Error> {
        match *self.state.lock().unwrap() {
            State::Maintenance { episode, depth, .. }
                if episode == token.episode =>
            {
                Ok(1 == depth)
            },
            _ => Err(Error::BadMaintenanceToken),
        }
    }

    /// Gates transaction entry: succeeds when the mailbox is active or the
    /// calling thread is the maintenance holder.
    pub fn check_open(&self) -> Result<(), Error> {
        match *self.state.lock().unwrap() {
            State::Active => Ok(()),
            State::Maintenance { holder, .. }
                if holder == thread::current().id() =>
            {
                Ok(())
            },
            State::Maintenance { .. } => Err(Error::MailboxInMaintenance),
            State::Unavailable => Err(Error::MailboxUnavailable),
        }
    }

    pub fn in_maintenance(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Maintenance { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Unavailable)
    }
}
