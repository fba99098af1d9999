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

//! The transactional storage core.
//!
//! Layout, leaf-first:
//!
//! - [`model`] — ids, items, counters and change masks shared by every layer.
//! - [`interfaces`] — traits for the database, write-ahead log, blob store,
//!   full-text index and change listeners.
//! - [`lock`] — the per-mailbox reentrant read/write lock and the escalation
//!   rule.
//! - [`item_cache`] / [`folder_cache`] — the bounded two-tier item cache and
//!   the always-resident folder/tag cache.
//! - [`maintenance`] — the offline-for-structural-work state machine.
//! - [`notify`] — post-commit change notification queue.
//! - [`txn`] — the transaction scope tying all of the above together.
//! - [`defs`] — the per-tenant mailbox aggregate.
//! - [`registry`] — the process-wide account/mailbox map.

pub mod model;

pub mod interfaces;
pub mod lock;

pub mod folder_cache;
pub mod item_cache;

pub mod maintenance;
pub mod notify;

pub mod txn;

pub mod defs;
pub mod registry;

pub use self::defs::Mailbox;
pub use self::folder_cache::FolderTagCache;
pub use self::item_cache::ItemCache;
pub use self::interfaces::{
    BlobHandle, BlobStore, ChangeListener, DbConnection, DbPool, IndexStore,
    StagedBlob, WalRecorder,
};
pub use self::lock::{decide_lock_kind, LockKind, MailboxLock};
pub use self::maintenance::{MaintenanceState, MaintenanceToken};
pub use self::model::{
    AccountId, ChangeConstraint, ChangeId, ChangeMask, DirtyItem, Folder,
    IndexId, ItemFlags, ItemId, ItemKind, MailItem, MailboxData, MailboxId,
    SearchId, Tag, UnixTimestamp,
};
pub use self::notify::{NotificationQueue, NotificationSnapshot};
pub use self::registry::MailboxRegistry;
pub use self::txn::{retry_on_conflict, PendingModifications, TxnScope};
