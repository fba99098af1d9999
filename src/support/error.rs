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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The bounded wait for the mailbox lock expired.
    ///
    /// This is a transient condition; the caller may retry the whole
    /// operation.
    #[error("Timed out waiting for the mailbox lock")]
    LockTimeout,
    /// The mailbox is locked for maintenance by another caller.
    ///
    /// Never retried automatically; maintenance is meant to be bounded and
    /// visible, not silently serialised.
    #[error("Mailbox is locked for maintenance")]
    MailboxInMaintenance,
    /// A maintenance episode ended in failure, so the in-memory state of the
    /// mailbox can no longer be trusted. No further transactions may open.
    #[error("Mailbox is permanently unavailable")]
    MailboxUnavailable,
    /// The caller's expected change id is stale.
    ///
    /// Surfaced to the caller, who decides whether to refetch and retry.
    #[error("Item was modified after the change the client knows about")]
    ModifyConflict,
    /// The database reported a serialisation/rollback conflict.
    ///
    /// Retried internally a bounded number of times (see
    /// [`retry_on_conflict`](crate::mailbox::retry_on_conflict)) before
    /// being surfaced.
    #[error("Transient database conflict")]
    DbConflict,
    /// The supplied maintenance token does not match the current maintenance
    /// episode.
    #[error("Stale or foreign maintenance token")]
    BadMaintenanceToken,
    #[error("Database failure: {0}")]
    Db(String),
    #[error("Write-ahead log failure: {0}")]
    Wal(String),
    #[error("Blob store failure: {0}")]
    Blob(String),
    #[error("Index failure: {0}")]
    Index(String),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the condition is expected to clear on its own, making a
    /// retry of the enclosing operation reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout | Self::DbConflict)
    }
}
