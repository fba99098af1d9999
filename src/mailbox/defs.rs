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

//! The mailbox aggregate.
//!
//! One `Mailbox` exists in memory per tenant, owning the lock, the caches,
//! the scalar counters and the collaborator handles. Exactly one process
//! holds a given mailbox's in-memory state at a time; within the process the
//! [registry](super::registry::MailboxRegistry) hands out shared references.

use std::sync::{Arc, Mutex};

use super::folder_cache::FolderTagCache;
use super::interfaces::{BlobStore, DbPool, IndexStore, WalRecorder};
use super::item_cache::ItemCache;
use super::lock::{LockKind, MailboxLock};
use super::maintenance::{MaintenanceState, MaintenanceToken};
use super::model::*;
use super::notify::NotificationQueue;
use super::txn::{
    round_up_to_checkpoint, TxnScope, CHANGE_CHECKPOINT_INCREMENT,
    ITEM_CHECKPOINT_INCREMENT,
};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::StoreConfig;

pub struct Mailbox {
    pub(super) id: MailboxId,
    pub(super) account_id: AccountId,
    pub(super) config: StoreConfig,
    pub(super) log_prefix: LogPrefix,
    pub(super) lock: MailboxLock,
    /// In-memory authoritative copy of the persistent counters. The
    /// database copy may lag by up to one checkpoint increment.
    pub(super) counters: Mutex<MailboxData>,
    pub(super) items: Mutex<ItemCache>,
    pub(super) folders_tags: FolderTagCache,
    pub(super) maintenance: MaintenanceState,
    pub(super) db: Arc<dyn DbPool>,
    pub(super) blobs: Arc<dyn BlobStore>,
    /// Dropped while the mailbox is under maintenance so a reindex can
    /// rebuild it from scratch.
    pub(super) index: Mutex<Option<Arc<dyn IndexStore>>>,
    pub(super) notifications: NotificationQueue,
}

impl Mailbox {
    /// Loads a mailbox from its persistent state.
    ///
    /// The item, search and change id counters are rounded up to their next
    /// checkpoint boundary, covering ids handed out but not yet flushed when
    /// the process last went down.
    pub fn load(
        log_prefix: LogPrefix,
        config: StoreConfig,
        id: MailboxId,
        account_id: AccountId,
        db: Arc<dyn DbPool>,
        blobs: Arc<dyn BlobStore>,
        index: Option<Arc<dyn IndexStore>>,
    ) -> Result<Self, Error> {
        log_prefix.set_account(account_id.as_str().to_owned());
        log_prefix.set_mailbox_id(id.0);

        let mut counters = db.load_counters(id)?;
        counters.last_item_id = ItemId(round_up_to_checkpoint(
            counters.last_item_id.0,
            ITEM_CHECKPOINT_INCREMENT,
        ));
        counters.last_search_id = SearchId(round_up_to_checkpoint(
            counters.last_search_id.0,
            ITEM_CHECKPOINT_INCREMENT,
        ));
        counters.last_change_id = ChangeId(round_up_to_checkpoint(
            counters.last_change_id.0,
            CHANGE_CHECKPOINT_INCREMENT,
        ));
        log::info!(
            "{} Loaded; last_item_id={}, last_change_id={}, size={}",
            log_prefix,
            counters.last_item_id.0,
            counters.last_change_id.0,
            counters.size_bytes,
        );

        let item_cache =
            ItemCache::new(log_prefix.clone(), config.item_cache_capacity);
        Ok(Self {
            id,
            account_id,
            lock: MailboxLock::new(),
            counters: Mutex::new(counters),
            items: Mutex::new(item_cache),
            folders_tags: FolderTagCache::new(),
            maintenance: MaintenanceState::new(log_prefix.clone()),
            notifications: NotificationQueue::new(log_prefix.clone()),
            db,
            blobs,
            index: Mutex::new(index),
            config,
            log_prefix,
        })
    }

    /// Opens a transaction scope on this mailbox.
    ///
    /// `intent` is the declared lock tier; the scope may hold a stronger
    /// tier after escalation, observable via
    /// [`TxnScope::held_kind`]. Operations that must be replayable after a
    /// crash pass a write-ahead-log `recorder`.
    pub fn begin(
        &self,
        caller: &'static str,
        intent: LockKind,
        recorder: Option<Box<dyn WalRecorder>>,
    ) -> Result<TxnScope<'_>, Error> {
        TxnScope::open(self, caller, intent, recorder)
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    // In-memory counter reads; authoritative between checkpoints.

    pub fn last_item_id(&self) -> ItemId {
        self.counters.lock().unwrap().last_item_id
    }

    pub fn last_change_id(&self) -> ChangeId {
        self.counters.lock().unwrap().last_change_id
    }

    pub fn last_search_id(&self) -> SearchId {
        self.counters.lock().unwrap().last_search_id
    }

    pub fn size_bytes(&self) -> u64 {
        self.counters.lock().unwrap().size_bytes
    }

    pub fn contact_count(&self) -> u32 {
        self.counters.lock().unwrap().contacts
    }

    pub fn recent_messages(&self) -> u32 {
        self.counters.lock().unwrap().recent_messages
    }

    pub fn sync_cutoff(&self) -> Option<ChangeId> {
        self.counters.lock().unwrap().sync_cutoff
    }

    pub fn tracks_imap(&self) -> bool {
        self.counters.lock().unwrap().track_imap
    }

    pub fn has_config_key(&self, key: &str) -> bool {
        self.counters.lock().unwrap().config_keys.contains(key)
    }

    pub fn version(&self) -> u32 {
        self.counters.lock().unwrap().version
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.in_maintenance()
    }

    pub fn is_unavailable(&self) -> bool {
        self.maintenance.is_unavailable()
    }

    /// Drops every cached item and invalidates the folder/tag cache, forcing
    /// all later lookups back to the database. Used when returning from
    /// maintenance, since the maintenance operation may have rewritten
    /// anything.
    pub fn purge_caches(&self) {
        self.items.lock().unwrap().clear();
        self.folders_tags.invalidate();
        log::debug!("{} Caches purged", self.log_prefix);
    }

    /// Takes the mailbox offline for a structural operation.
    ///
    /// Acquires the write lock for the transition so no transaction is in
    /// flight, drops the live index handle (the operation may rebuild the
    /// index), and turns away other threads until
    /// [`end_maintenance`](Self::end_maintenance).
    pub fn begin_maintenance(
        &self,
        episode: u64,
    ) -> Result<MaintenanceToken, Error> {
        let held = self
            .lock
            .acquire(LockKind::Write, self.config.lock_timeout())?;
        let result = self.maintenance.begin(self.id, &self.account_id, episode);
        if result.is_ok() {
            *self.index.lock().unwrap() = None;
        }
        self.lock.release(held);
        result
    }

    /// Ends one level of maintenance. `success: false` marks the mailbox
    /// permanently unavailable; the registry must reload it from scratch.
    ///
    /// The final successful surrender purges the caches, since the
    /// maintenance operation may have rewritten anything.
    pub fn end_maintenance(
        &self,
        token: &MaintenanceToken,
        success: bool,
    ) -> Result<(), Error> {
        // Purged while non-holders are still turned away; once the state
        // flips back a new transaction could already have warmed the caches.
        if success && self.maintenance.ending_final_level(token)? {
            self.purge_caches();
        }
        self.maintenance.end(token, success)
    }

    /// Rebinds the full-text index handle, typically after maintenance
    /// rebuilt it.
    pub fn attach_index(&self, index: Arc<dyn IndexStore>) {
        *self.index.lock().unwrap() = Some(index);
    }
}
