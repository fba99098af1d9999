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

//! The narrow interfaces through which the core consumes its external
//! collaborators: the relational database, the write-ahead log, the blob
//! store, the full-text index, and change listeners.
//!
//! Implementations live outside this crate. All traits are object safe; the
//! core holds them as trait objects so deployments can mix backends freely.

use std::collections::HashMap;

use uuid::Uuid;

use super::model::*;
use super::notify::NotificationSnapshot;
use crate::support::error::Error;

/// A handle to blob content staged in the blob store but not yet linked to
/// an item. Staging is idempotent and cheap to retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedBlob {
    pub path: String,
    pub size: u64,
}

/// A handle to blob content linked to an item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobHandle {
    pub path: String,
}

/// Source of database connections and of the persistent mailbox state.
pub trait DbPool: Send + Sync {
    /// Acquires a low-level connection. The transaction scope binds at most
    /// one per outermost scope, lazily on first use.
    fn connection(&self) -> Result<Box<dyn DbConnection>, Error>;

    /// Loads the scalar counter block for a mailbox.
    fn load_counters(&self, mailbox: MailboxId) -> Result<MailboxData, Error>;

    /// Fetches a single item, or `None` if it does not exist.
    fn fetch_item(
        &self,
        mailbox: MailboxId,
        id: ItemId,
    ) -> Result<Option<MailItem>, Error>;

    /// Fetches a single item by UUID.
    fn fetch_item_by_uuid(
        &self,
        mailbox: MailboxId,
        uuid: Uuid,
    ) -> Result<Option<MailItem>, Error>;

    /// Fetches every folder and tag in the mailbox, used to (re)populate the
    /// always-resident caches.
    fn fetch_folders_and_tags(
        &self,
        mailbox: MailboxId,
    ) -> Result<(Vec<Folder>, Vec<Tag>), Error>;

    /// Returns the account → mailbox id mapping for every mailbox known to
    /// the deployment.
    fn load_mailbox_ids(&self)
        -> Result<HashMap<AccountId, MailboxId>, Error>;

    /// Creates the persistent record for a new mailbox and returns its id.
    fn create_mailbox(&self, account: &AccountId) -> Result<MailboxId, Error>;
}

/// One bound database connection, owned exclusively by the outermost
/// transaction scope on one thread.
pub trait DbConnection {
    /// Writes the scalar counter block within the open transaction.
    fn persist_counters(
        &mut self,
        mailbox: MailboxId,
        data: &MailboxData,
    ) -> Result<(), Error>;

    /// Commits the transaction. A serialisation conflict is reported as
    /// [`Error::DbConflict`] and may be retried by the caller.
    fn commit(self: Box<Self>) -> Result<(), Error>;

    fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// Recorder for one operation in the write-ahead log.
///
/// The durable format is owned by the log implementation; the core only
/// drives the record lifecycle. Owned exclusively by the outermost scope.
pub trait WalRecorder {
    /// Called once when the recorder is bound, with the transaction's frozen
    /// start timestamp.
    fn start(&mut self, timestamp: UnixTimestamp);

    /// Records the change id assigned to the operation.
    fn set_change_id(&mut self, change_id: ChangeId);

    /// Writes the change record. Invoked before the database commit so crash
    /// recovery can replay an operation whose commit never completed.
    fn log(&mut self) -> Result<(), Error>;

    /// Writes the commit record, after the database commit succeeds.
    fn commit(&mut self) -> Result<(), Error>;

    /// Writes an abort record so crash recovery does not replay a
    /// half-applied operation. Must not fail; best effort.
    fn abort(&mut self);
}

/// Content-addressed blob storage.
pub trait BlobStore: Send + Sync {
    /// Stages raw content, returning a handle that can later be linked to an
    /// item or deleted.
    fn stage(&self, data: &[u8]) -> Result<StagedBlob, Error>;

    /// Links staged content to an item, producing the durable handle.
    fn link(
        &self,
        staged: &StagedBlob,
        item: ItemId,
    ) -> Result<BlobHandle, Error>;

    /// Deletes stored content. Best effort: failures are logged by the
    /// caller, never propagated into commit paths.
    fn delete(&self, handle: &BlobHandle) -> Result<(), Error>;
}

/// The full-text index for one mailbox.
pub trait IndexStore: Send + Sync {
    fn add_entry(&self, item: &MailItem) -> Result<(), Error>;

    /// Deletes index entries, returning the subset actually deleted so the
    /// caller can log partial failures.
    fn delete_entries(&self, ids: &[IndexId]) -> Result<Vec<IndexId>, Error>;
}

/// Receiver for committed-change notifications.
///
/// Invoked outside the mailbox lock, from the post-commit queue.
pub trait ChangeListener: Send + Sync {
    fn notify(&self, snapshot: &NotificationSnapshot);
}
