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

//! The transaction scope.
//!
//! Every read or mutation of a mailbox happens inside a `TxnScope`, an
//! explicit handle returned by [`Mailbox::begin`](super::defs::Mailbox::begin)
//! and threaded through the call stack. The scope accumulates pending scalar
//! deltas and a dirty item set while it is open; nothing is visible to other
//! threads until `close()` flushes the whole batch atomically across the
//! database, the write-ahead log and the in-memory caches.
//!
//! Scopes nest on one thread. Only the outermost level owns the database
//! connection, the write-ahead-log recorder and the frozen start timestamp;
//! inner levels merely bump the depth and share the accumulator. The real
//! commit or rollback runs when the outermost level closes.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use super::defs::Mailbox;
use super::interfaces::{BlobHandle, DbConnection, StagedBlob, WalRecorder};
use super::lock::{decide_lock_kind, LockKind};
use super::model::*;
use super::notify::NotificationSnapshot;
use crate::support::error::Error;

/// Granularity at which the item id and search id counters are flushed to
/// the database. Recovery after a crash rounds the counters up by one full
/// increment, so a larger increment trades bigger id gaps for fewer writes.
pub const ITEM_CHECKPOINT_INCREMENT: i32 = 20;
/// Granularity at which the change id counter is flushed to the database.
pub const CHANGE_CHECKPOINT_INCREMENT: i32 = 100;

/// How many times a conflicted commit is retried before surfacing.
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

fn checkpoint_bucket(value: i32, increment: i32) -> i32 {
    value / increment
}

/// Rounds a counter loaded from the database up to the next checkpoint
/// boundary, covering ids that were handed out but never flushed before a
/// crash.
pub(super) fn round_up_to_checkpoint(value: i32, increment: i32) -> i32 {
    (value + increment - 1) / increment * increment
}

/// The dirty set of one transaction: which items were created, modified
/// (and why), or deleted.
#[derive(Default)]
pub struct PendingModifications {
    created: BTreeMap<ItemId, DirtyItem>,
    modified: BTreeMap<ItemId, (DirtyItem, ChangeMask)>,
    deleted: BTreeMap<ItemId, ItemKind>,
}

impl PendingModifications {
    pub fn record_created(&mut self, item: DirtyItem) {
        self.created.insert(item.id(), item);
    }

    /// Records a modification, merging the reason mask with any already
    /// recorded. An item created earlier in the same transaction stays in
    /// the created set; outside observers never saw the intermediate state.
    pub fn record_modified(&mut self, item: DirtyItem, reason: ChangeMask) {
        let id = item.id();
        if self.created.contains_key(&id) {
            self.created.insert(id, item);
            return;
        }

        match self.modified.get_mut(&id) {
            Some(&mut (ref mut entry, ref mut mask)) => {
                *entry = item;
                *mask |= reason;
            },
            None => {
                self.modified.insert(id, (item, reason));
            },
        }
    }

    /// Records a deletion. Deleting an item created in the same transaction
    /// cancels it outright rather than notifying a create-then-delete pair.
    pub fn record_deleted(&mut self, id: ItemId, kind: ItemKind) {
        if self.created.remove(&id).is_some() {
            return;
        }
        self.modified.remove(&id);
        self.deleted.insert(id, kind);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
    }

    fn any_folder_or_tag(&self) -> bool {
        self.created
            .values()
            .map(DirtyItem::kind)
            .chain(self.modified.values().map(|&(ref item, _)| item.kind()))
            .chain(self.deleted.values().copied())
            .any(ItemKind::is_always_cached)
    }
}

/// The accumulator for one outermost transaction.
struct PendingChange {
    timestamp: UnixTimestamp,
    change_id: Option<ChangeId>,
    last_item_id: Option<ItemId>,
    last_search_id: Option<SearchId>,
    size_delta: i64,
    contacts_delta: i64,
    recent: Option<u32>,
    sync_cutoff: Option<Option<ChangeId>>,
    track_imap: Option<bool>,
    config_write: Option<(String, bool)>,
    mods: PendingModifications,
    index_adds: Vec<Arc<MailItem>>,
    staged_blobs: Vec<StagedBlob>,
    pending_blob_deletes: Vec<BlobHandle>,
    pending_index_deletes: Vec<IndexId>,
}

impl PendingChange {
    fn new(timestamp: UnixTimestamp) -> Self {
        Self {
            timestamp,
            change_id: None,
            last_item_id: None,
            last_search_id: None,
            size_delta: 0,
            contacts_delta: 0,
            recent: None,
            sync_cutoff: None,
            track_imap: None,
            config_write: None,
            mods: PendingModifications::default(),
            index_adds: Vec::new(),
            staged_blobs: Vec::new(),
            pending_blob_deletes: Vec::new(),
            pending_index_deletes: Vec::new(),
        }
    }

    /// Reconciles the accumulated deltas into a fresh counter block and
    /// decides whether that block must be written to the database now.
    ///
    /// The id counters are only flushed when they cross a checkpoint bucket;
    /// every other field is flushed whenever it changed.
    fn snapshot_counters(&self, old: &MailboxData) -> (MailboxData, bool) {
        let mut new = old.clone();
        new.size_bytes = (old.size_bytes as i64 + self.size_delta).max(0) as u64;
        new.contacts = (i64::from(old.contacts) + self.contacts_delta).max(0) as u32;
        if let Some(id) = self.last_item_id {
            new.last_item_id = id;
        }
        if let Some(id) = self.last_search_id {
            new.last_search_id = id;
        }
        if let Some(id) = self.change_id {
            new.last_change_id = id;
            new.last_change_at = self.timestamp;
        }
        if let Some(recent) = self.recent {
            new.recent_messages = recent;
        }
        if let Some(cutoff) = self.sync_cutoff {
            new.sync_cutoff = cutoff;
        }
        if let Some(track) = self.track_imap {
            new.track_imap = track;
        }
        if let Some((ref key, present)) = self.config_write {
            if present {
                new.config_keys.insert(key.clone());
            } else {
                new.config_keys.remove(key);
            }
        }

        let persist = checkpoint_bucket(new.last_item_id.0, ITEM_CHECKPOINT_INCREMENT)
            != checkpoint_bucket(old.last_item_id.0, ITEM_CHECKPOINT_INCREMENT)
            || checkpoint_bucket(new.last_search_id.0, ITEM_CHECKPOINT_INCREMENT)
                != checkpoint_bucket(old.last_search_id.0, ITEM_CHECKPOINT_INCREMENT)
            || checkpoint_bucket(new.last_change_id.0, CHANGE_CHECKPOINT_INCREMENT)
                != checkpoint_bucket(old.last_change_id.0, CHANGE_CHECKPOINT_INCREMENT)
            || new.size_bytes != old.size_bytes
            || new.contacts != old.contacts
            || new.recent_messages != old.recent_messages
            || new.sync_cutoff != old.sync_cutoff
            || new.track_imap != old.track_imap
            || new.config_keys != old.config_keys;
        (new, persist)
    }
}

/// One open transaction on one mailbox, held by one thread.
pub struct TxnScope<'mb> {
    mailbox: &'mb Mailbox,
    caller: &'static str,
    depth: u32,
    /// Lock tiers actually held, outermost first. Length equals `depth`.
    holds: Vec<LockKind>,
    change: PendingChange,
    conn: Option<Box<dyn DbConnection>>,
    recorder: Option<Box<dyn WalRecorder>>,
    success: bool,
    failed: bool,
    closed: bool,
}

impl<'mb> TxnScope<'mb> {
    pub(super) fn open(
        mailbox: &'mb Mailbox,
        caller: &'static str,
        intent: LockKind,
        recorder: Option<Box<dyn WalRecorder>>,
    ) -> Result<Self, Error> {
        mailbox.maintenance.check_open()?;

        let kind = decide_lock_kind(
            intent,
            mailbox.folders_tags.is_warm(),
            &mailbox.config,
        );
        let held = mailbox.lock.acquire(kind, mailbox.config.lock_timeout())?;
        // Re-checked with the lock held: maintenance may have begun while
        // this thread was waiting for it.
        if let Err(e) = mailbox.maintenance.check_open() {
            mailbox.lock.release(held);
            return Err(e);
        }
        log::trace!(
            "{} Opened transaction for {} ({:?})",
            mailbox.log_prefix,
            caller,
            held,
        );

        let mut scope = Self {
            mailbox,
            caller,
            depth: 1,
            holds: vec![held],
            change: PendingChange::new(UnixTimestamp::now()),
            conn: None,
            recorder,
            success: false,
            failed: false,
            closed: false,
        };
        if let Some(ref mut recorder) = scope.recorder {
            recorder.start(scope.change.timestamp);
        }

        if let Err(e) = scope.ensure_warm() {
            scope.abandon();
            return Err(e);
        }
        Ok(scope)
    }

    /// Enters a nested level on the same thread.
    ///
    /// ## Panics
    ///
    /// Panics if the nested call declares write intent inside a read-held
    /// scope, or requires a recorder inside a recorderless scope. Both are
    /// programming errors in the calling operation, not runtime conditions.
    pub fn begin_nested(
        &mut self,
        caller: &'static str,
        intent: LockKind,
        needs_recorder: bool,
    ) -> Result<(), Error> {
        assert!(
            !needs_recorder || self.recorder.is_some(),
            "nested operation {} requires a recorder, \
             but the enclosing scope ({}) has none",
            caller,
            self.caller,
        );
        assert!(
            LockKind::Read != self.held_kind() || LockKind::Write != intent,
            "nested operation {} declares write intent \
             inside a read transaction ({})",
            caller,
            self.caller,
        );

        let kind = decide_lock_kind(
            intent,
            self.mailbox.folders_tags.is_warm(),
            &self.mailbox.config,
        );
        // Reentrant; cannot block since this thread already holds a tier at
        // least as strong.
        let held = self
            .mailbox
            .lock
            .acquire(kind, self.mailbox.config.lock_timeout())?;
        self.holds.push(held);
        self.depth += 1;
        Ok(())
    }

    /// The lock tier this scope holds, after any escalation.
    pub fn held_kind(&self) -> LockKind {
        self.holds[0]
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The timestamp frozen when the outermost level opened.
    pub fn timestamp(&self) -> UnixTimestamp {
        self.change.timestamp
    }

    /// Marks the current nesting level successful. The flush itself happens
    /// in `close()`.
    pub fn commit(&mut self) {
        self.success = true;
    }

    /// Closes the current nesting level; must be called exactly once per
    /// open, on every exit path.
    ///
    /// A level closed without a preceding [`commit`](Self::commit) poisons
    /// the whole transaction: when the outermost level closes, everything
    /// rolls back. At the outermost close this performs the full flush or
    /// rollback and, on a committed flush with a non-empty dirty set,
    /// returns the published notification snapshot.
    pub fn close(&mut self) -> Result<Option<NotificationSnapshot>, Error> {
        assert!(!self.closed, "transaction scope closed twice");

        if !mem::replace(&mut self.success, false) {
            self.failed = true;
        }

        self.depth -= 1;
        let hold = self
            .holds
            .pop()
            .expect("lock hold count diverged from nesting depth");
        if self.depth > 0 {
            self.mailbox.lock.release(hold);
            return Ok(None);
        }

        self.closed = true;
        if self.failed {
            self.rollback_outermost(hold);
            return Ok(None);
        }

        let new = match self.flush() {
            Ok(new) => new,
            Err(e) => {
                log::warn!(
                    "{} Commit failed for {}, rolling back: {}",
                    self.mailbox.log_prefix,
                    self.caller,
                    e,
                );
                self.rollback_outermost(hold);
                return Err(e);
            },
        };

        // The operation is now durable. A failure to write the commit
        // record is logged and tolerated; recovery treats the change record
        // plus committed database state as authoritative.
        if let Some(ref mut recorder) = self.recorder {
            if let Err(e) = recorder.commit() {
                log::error!(
                    "{} Failed to write commit record: {}",
                    self.mailbox.log_prefix,
                    e,
                );
            }
        }

        let snapshot = self.commit_cache(new);
        self.mailbox.lock.release(hold);

        // Physical cleanup happens strictly outside the lock so a slow blob
        // store cannot stall other threads on this mailbox.
        self.deferred_cleanup();

        let out = if snapshot.is_empty() {
            None
        } else {
            Some(snapshot.clone())
        };
        self.mailbox.notifications.publish(snapshot);
        Ok(out)
    }

    // ==================== mutation API ====================

    /// Assigns the next item id. The database copy of the counter is only
    /// updated when a checkpoint boundary is crossed at commit.
    pub fn next_item_id(&mut self) -> ItemId {
        self.require_write();
        let current = self
            .change
            .last_item_id
            .unwrap_or_else(|| self.mailbox.counters.lock().unwrap().last_item_id);
        let next = ItemId(current.0 + 1);
        self.change.last_item_id = Some(next);
        next
    }

    pub fn next_search_id(&mut self) -> SearchId {
        self.require_write();
        let current = self
            .change
            .last_search_id
            .unwrap_or_else(|| self.mailbox.counters.lock().unwrap().last_search_id);
        let next = SearchId(current.0 + 1);
        self.change.last_search_id = Some(next);
        next
    }

    /// The change id of this transaction, assigned lazily on first use so
    /// pure reads never consume one. All writes in one transaction share it.
    pub fn change_id(&mut self) -> ChangeId {
        self.require_write();
        if let Some(id) = self.change.change_id {
            return id;
        }

        let next =
            ChangeId(self.mailbox.counters.lock().unwrap().last_change_id.0 + 1);
        self.change.change_id = Some(next);
        if let Some(ref mut recorder) = self.recorder {
            recorder.set_change_id(next);
        }
        next
    }

    pub fn add_size_delta(&mut self, delta: i64) {
        self.require_write();
        self.change.size_delta += delta;
    }

    pub fn add_contacts_delta(&mut self, delta: i64) {
        self.require_write();
        self.change.contacts_delta += delta;
    }

    pub fn set_recent(&mut self, recent: u32) {
        self.require_write();
        self.change.recent = Some(recent);
    }

    pub fn set_sync_cutoff(&mut self, cutoff: Option<ChangeId>) {
        self.require_write();
        self.change.sync_cutoff = Some(cutoff);
    }

    pub fn set_track_imap(&mut self, track: bool) {
        self.require_write();
        self.change.track_imap = Some(track);
    }

    /// Records addition (`present`) or removal of a per-application config
    /// section. At most one config write per transaction.
    pub fn set_config(&mut self, key: String, present: bool) {
        self.require_write();
        self.change.config_write = Some((key, present));
    }

    pub fn mark_created(&mut self, item: DirtyItem) {
        self.require_write();
        self.change.mods.record_created(item);
    }

    pub fn mark_modified(&mut self, item: DirtyItem, reason: ChangeMask) {
        self.require_write();
        self.change.mods.record_modified(item, reason);
    }

    pub fn mark_deleted(&mut self, id: ItemId, kind: ItemKind) {
        self.require_write();
        self.change.mods.record_deleted(id, kind);
    }

    /// Stages blob content. The staged copy is reclaimed automatically if
    /// the transaction fails; staging is idempotent, so a conflicted commit
    /// can simply re-stage on retry.
    pub fn stage_blob(&mut self, data: &[u8]) -> Result<StagedBlob, Error> {
        self.require_write();
        let staged = self.mailbox.blobs.stage(data)?;
        self.change.staged_blobs.push(staged.clone());
        Ok(staged)
    }

    pub fn link_blob(
        &mut self,
        staged: &StagedBlob,
        item: ItemId,
    ) -> Result<BlobHandle, Error> {
        self.require_write();
        self.mailbox.blobs.link(staged, item)
    }

    /// Queues a blob for physical deletion after a successful commit,
    /// outside the lock.
    pub fn queue_blob_delete(&mut self, handle: BlobHandle) {
        self.require_write();
        self.change.pending_blob_deletes.push(handle);
    }

    pub fn queue_index_delete(&mut self, id: IndexId) {
        self.require_write();
        self.change.pending_index_deletes.push(id);
    }

    /// Queues an item for full-text indexing as part of the commit.
    pub fn queue_index_add(&mut self, item: Arc<MailItem>) {
        self.require_write();
        self.change.index_adds.push(item);
    }

    // ==================== lookups ====================

    /// Fetches an item through the cache, falling back to the database on a
    /// miss and repopulating the cache with the result.
    pub fn get_item(&self, id: ItemId) -> Result<Option<Arc<MailItem>>, Error> {
        if let Some(item) = self.mailbox.items.lock().unwrap().get(id) {
            return Ok(Some(item));
        }

        match self.mailbox.db.fetch_item(self.mailbox.id, id)? {
            None => Ok(None),
            Some(item) => {
                let item = Arc::new(item);
                self.mailbox.items.lock().unwrap().put(Arc::clone(&item));
                Ok(Some(item))
            },
        }
    }

    pub fn get_item_by_uuid(
        &self,
        uuid: uuid::Uuid,
    ) -> Result<Option<Arc<MailItem>>, Error> {
        if let Some(item) = self.mailbox.items.lock().unwrap().get_by_uuid(uuid)
        {
            return Ok(Some(item));
        }

        match self.mailbox.db.fetch_item_by_uuid(self.mailbox.id, uuid)? {
            None => Ok(None),
            Some(item) => {
                let item = Arc::new(item);
                self.mailbox.items.lock().unwrap().put(Arc::clone(&item));
                Ok(Some(item))
            },
        }
    }

    /// Fetches an item and applies the caller's optimistic-concurrency
    /// constraint. A `CheckCreated` violation reads as absent; a
    /// `CheckModified` violation is a hard [`Error::ModifyConflict`].
    pub fn get_item_checked(
        &self,
        id: ItemId,
        constraint: Option<ChangeConstraint>,
    ) -> Result<Option<Arc<MailItem>>, Error> {
        match self.get_item(id)? {
            None => Ok(None),
            Some(item) => {
                if check_item_change_id(constraint, &item)? {
                    Ok(Some(item))
                } else {
                    Ok(None)
                }
            },
        }
    }

    /// Folder lookups are served entirely from the always-resident cache,
    /// which is guaranteed warm while any scope is open.
    pub fn get_folder(&self, id: ItemId) -> Option<Arc<Folder>> {
        self.mailbox.folders_tags.folder(id)
    }

    pub fn get_folder_by_name(&self, name: &str) -> Option<Arc<Folder>> {
        self.mailbox.folders_tags.folder_by_name(name)
    }

    pub fn get_tag(&self, id: ItemId) -> Option<Arc<Tag>> {
        self.mailbox.folders_tags.tag(id)
    }

    pub fn get_tag_by_name(&self, name: &str) -> Option<Arc<Tag>> {
        self.mailbox.folders_tags.tag_by_name(name)
    }

    // ==================== internals ====================

    fn require_write(&self) {
        assert_eq!(
            LockKind::Write,
            self.held_kind(),
            "mutation attempted in a read transaction ({})",
            self.caller,
        );
    }

    fn ensure_warm(&mut self) -> Result<(), Error> {
        if self.mailbox.folders_tags.is_warm() {
            return Ok(());
        }

        // Escalation guarantees the write lock whenever the cache is cold.
        debug_assert_eq!(LockKind::Write, self.held_kind());
        let (folders, tags) =
            self.mailbox.db.fetch_folders_and_tags(self.mailbox.id)?;
        log::debug!(
            "{} Loaded {} folders and {} tags",
            self.mailbox.log_prefix,
            folders.len(),
            tags.len(),
        );
        self.mailbox.folders_tags.install(folders, tags);
        Ok(())
    }

    fn conn(&mut self) -> Result<&mut Box<dyn DbConnection>, Error> {
        Ok(match self.conn {
            Some(ref mut conn) => conn,
            ref mut conn @ None => {
                conn.insert(self.mailbox.db.connection()?)
            },
        })
    }

    /// Fallible front half of the commit: counter flush, change record,
    /// index additions, database commit.
    fn flush(&mut self) -> Result<MailboxData, Error> {
        let old = self.mailbox.counters.lock().unwrap().clone();
        let (new, persist) = self.change.snapshot_counters(&old);
        if persist {
            let mailbox_id = self.mailbox.id;
            self.conn()?.persist_counters(mailbox_id, &new)?;
        }

        // The change record goes to the log before the database commits, so
        // recovery can replay an operation whose commit never completed.
        if let Some(ref mut recorder) = self.recorder {
            recorder.log()?;
        }

        if !self.change.index_adds.is_empty() {
            let index = self.mailbox.index.lock().unwrap().clone();
            if let Some(index) = index {
                for item in &self.change.index_adds {
                    if let Err(e) = index.add_entry(item) {
                        log::error!(
                            "{} Failed to index item {}: {}",
                            self.mailbox.log_prefix,
                            item.id.0,
                            e,
                        );
                    }
                }
            }
        }

        if let Some(conn) = self.conn.take() {
            conn.commit()?;
        }
        Ok(new)
    }

    /// Applies the committed transaction to the in-memory state and builds
    /// the notification snapshot. Runs under the lock; infallible.
    fn commit_cache(&mut self, new: MailboxData) -> NotificationSnapshot {
        let change_id = self.change.change_id.unwrap_or(new.last_change_id);
        *self.mailbox.counters.lock().unwrap() = new;

        let mods = mem::take(&mut self.change.mods);
        {
            let mut items = self.mailbox.items.lock().unwrap();
            for dirty in mods
                .created
                .values()
                .chain(mods.modified.values().map(|&(ref item, _)| item))
            {
                match *dirty {
                    DirtyItem::Item(ref item) => items.put(Arc::clone(item)),
                    DirtyItem::Folder(ref folder) => self
                        .mailbox
                        .folders_tags
                        .put_folder(Arc::clone(folder)),
                    DirtyItem::Tag(ref tag) => {
                        self.mailbox.folders_tags.put_tag(Arc::clone(tag))
                    },
                }
            }
            for (&id, &kind) in &mods.deleted {
                match kind {
                    ItemKind::Folder => {
                        self.mailbox.folders_tags.remove_folder(id)
                    },
                    ItemKind::Tag => self.mailbox.folders_tags.remove_tag(id),
                    _ => drop(items.remove(id)),
                }
            }
        }

        NotificationSnapshot {
            change_id,
            timestamp: self.change.timestamp,
            created: mods.created.into_values().collect(),
            modified: mods.modified.into_values().collect(),
            deleted: mods.deleted.into_iter().collect(),
        }
    }

    /// Blob and index reclamation deferred to after lock release. All best
    /// effort; failures are logged and the space is recovered by scrubbing.
    fn deferred_cleanup(&mut self) {
        let index_deletes = mem::take(&mut self.change.pending_index_deletes);
        if !index_deletes.is_empty() {
            let index = self.mailbox.index.lock().unwrap().clone();
            if let Some(index) = index {
                match index.delete_entries(&index_deletes) {
                    Ok(ref deleted) if deleted.len() == index_deletes.len() => {
                    },
                    Ok(deleted) => log::warn!(
                        "{} Deleted only {}/{} index entries",
                        self.mailbox.log_prefix,
                        deleted.len(),
                        index_deletes.len(),
                    ),
                    Err(e) => log::warn!(
                        "{} Failed to delete index entries: {}",
                        self.mailbox.log_prefix,
                        e,
                    ),
                }
            }
        }

        for handle in mem::take(&mut self.change.pending_blob_deletes) {
            if let Err(e) = self.mailbox.blobs.delete(&handle) {
                log::warn!(
                    "{} Failed to delete blob {}: {}",
                    self.mailbox.log_prefix,
                    handle.path,
                    e,
                );
            }
        }
    }

    /// The failure sequence: database rollback, abort record, cache undo,
    /// lock release, staged blob cleanup outside the lock.
    fn rollback_outermost(&mut self, hold: LockKind) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.rollback() {
                log::warn!(
                    "{} Failed to roll back database transaction: {}",
                    self.mailbox.log_prefix,
                    e,
                );
            }
        }
        if let Some(ref mut recorder) = self.recorder {
            recorder.abort();
        }

        // Anything speculatively placed in a cache during the failed scope
        // is evicted so later lookups re-read authoritative state.
        let mods = mem::take(&mut self.change.mods);
        {
            let mut items = self.mailbox.items.lock().unwrap();
            for &id in mods.created.keys().chain(mods.modified.keys()) {
                items.remove(id);
            }
        }
        if mods.any_folder_or_tag() {
            self.mailbox.folders_tags.invalidate();
        }

        self.mailbox.lock.release(hold);

        for staged in self.change.staged_blobs.drain(..) {
            let handle = BlobHandle { path: staged.path };
            if let Err(e) = self.mailbox.blobs.delete(&handle) {
                log::warn!(
                    "{} Failed to delete staged blob {}: {}",
                    self.mailbox.log_prefix,
                    handle.path,
                    e,
                );
            }
        }
    }

    /// Abandons a scope that failed during open, before the caller ever saw
    /// it.
    fn abandon(&mut self) {
        if let Some(hold) = self.holds.pop() {
            self.rollback_outermost(hold);
        }
        self.depth = 0;
        self.closed = true;
    }
}

impl Drop for TxnScope<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        log::warn!(
            "{} Transaction scope for {} dropped without close; rolling back",
            self.mailbox.log_prefix,
            self.caller,
        );
        while self.depth > 1 {
            if let Some(hold) = self.holds.pop() {
                self.mailbox.lock.release(hold);
            }
            self.depth -= 1;
        }
        if let Some(hold) = self.holds.pop() {
            self.rollback_outermost(hold);
        }
        self.closed = true;
    }
}

/// Runs `f` repeatedly while it fails with the transient
/// [`Error::DbConflict`], up to three attempts in total. Used by operations
/// whose side effects (blob staging) are idempotent and cheap to redo.
pub fn retry_on_conflict<T>(
    mut f: impl FnMut(u32) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f(attempt) {
            Err(e @ Error::DbConflict) => {
                if attempt >= MAX_CONFLICT_ATTEMPTS {
                    return Err(e);
                }
                log::debug!(
                    "Commit conflict on attempt {}/{}, retrying",
                    attempt,
                    MAX_CONFLICT_ATTEMPTS,
                );
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::super::defs::test_fixture::TestFixture;
    use super::super::interfaces::testutil::RecordingListener;
    use super::super::interfaces::ChangeListener;
    use super::*;

    fn message(id: ItemId, change: ChangeId) -> Arc<MailItem> {
        Arc::new(MailItem {
            id,
            uuid: Uuid::new_v4(),
            kind: ItemKind::Message,
            folder_id: ItemId(2),
            flags: ItemFlags::UNREAD,
            size: 100,
            mod_metadata: change,
            mod_content: change,
        })
    }

    #[test]
    fn read_scope_escalates_while_cold() {
        let fx = TestFixture::new();
        // First-ever transaction: the folder/tag cache is cold.
        assert!(!fx.mailbox.folders_tags.is_warm());
        let mut scope = fx.read_scope();
        assert_eq!(LockKind::Write, scope.held_kind());
        assert!(fx.mailbox.folders_tags.is_warm());
        scope.commit();
        scope.close().unwrap();

        // Now warm, a read scope stays a read scope.
        let mut scope = fx.read_scope();
        assert_eq!(LockKind::Read, scope.held_kind());
        scope.commit();
        scope.close().unwrap();
    }

    #[test]
    fn nesting_releases_lock_only_at_outermost_close() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        scope.begin_nested("inner", LockKind::Write, false).unwrap();
        assert_eq!(2, scope.depth());

        scope.commit();
        scope.close().unwrap();
        assert!(fx.mailbox.lock.held_by_current_thread().is_some());

        scope.commit();
        scope.close().unwrap();
        assert!(fx.mailbox.lock.held_by_current_thread().is_none());
    }

    #[test]
    #[should_panic(expected = "write intent")]
    fn nested_write_in_read_scope_panics() {
        let fx = TestFixture::new();
        fx.warm_up();
        let mut scope = fx.read_scope();
        let _ = scope.begin_nested("inner", LockKind::Write, false);
    }

    #[test]
    #[should_panic(expected = "requires a recorder")]
    fn nested_recorder_in_recorderless_scope_panics() {
        let fx = TestFixture::new();
        let mut scope = fx
            .mailbox
            .begin("outer", LockKind::Write, None)
            .unwrap();
        let _ = scope.begin_nested("inner", LockKind::Write, true);
    }

    #[test]
    #[should_panic(expected = "mutation attempted in a read transaction")]
    fn mutation_in_read_scope_panics() {
        let fx = TestFixture::new();
        fx.warm_up();
        let mut scope = fx.read_scope();
        scope.next_item_id();
    }

    #[test]
    fn counters_stay_in_memory_below_checkpoint() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        for _ in 0..5 {
            scope.next_item_id();
        }
        scope.change_id();
        scope.commit();
        scope.close().unwrap();

        // The database never saw the counters, but in-process reads do.
        assert_eq!(0, fx.db.persisted_count());
        assert_eq!(ItemId(5), fx.mailbox.last_item_id());
        assert_eq!(ChangeId(1), fx.mailbox.last_change_id());
    }

    #[test]
    fn crossing_checkpoint_boundary_persists_counters() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        for _ in 0..ITEM_CHECKPOINT_INCREMENT {
            scope.next_item_id();
        }
        scope.commit();
        scope.close().unwrap();

        assert_eq!(1, fx.db.persisted_count());
        let persisted =
            fx.db.state.lock().unwrap().counters[&fx.mailbox.id()].clone();
        assert_eq!(ItemId(ITEM_CHECKPOINT_INCREMENT), persisted.last_item_id);
    }

    #[test]
    fn size_changes_always_persist() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        scope.add_size_delta(4096);
        scope.commit();
        scope.close().unwrap();

        assert_eq!(1, fx.db.persisted_count());
        assert_eq!(4096, fx.mailbox.size_bytes());
    }

    #[test]
    fn wal_records_bracket_the_db_commit() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        let change_id = scope.change_id();
        scope.add_size_delta(10);
        scope.commit();
        scope.close().unwrap();

        assert_eq!(
            vec![
                "start".to_owned(),
                format!("set_change_id:{}", change_id.0),
                "log".to_owned(),
                "commit".to_owned(),
            ],
            *fx.wal.events.lock().unwrap(),
        );
        assert_eq!(1, fx.db.state.lock().unwrap().commits);
    }

    #[test]
    fn commit_applies_caches_and_notifies() {
        let fx = TestFixture::new();
        let listener = Arc::new(RecordingListener::default());
        fx.mailbox
            .notifications()
            .add_listener(Arc::clone(&listener) as Arc<dyn ChangeListener>);

        let mut scope = fx.write_scope();
        let change_id = scope.change_id();
        let item = message(scope.next_item_id(), change_id);
        scope.mark_created(DirtyItem::Item(Arc::clone(&item)));
        scope.commit();
        let snapshot = scope.close().unwrap().unwrap();

        assert_eq!(change_id, snapshot.change_id);
        assert_eq!(1, snapshot.created.len());

        // The committed item is served from the cache without a db row.
        let scope = fx.write_scope();
        assert_eq!(Some(item.clone()), scope.get_item(item.id).unwrap());
        drop(scope);

        assert_eq!(1, fx.mailbox.notifications().drain());
        assert_eq!(vec![change_id], *listener.seen.lock().unwrap());
    }

    #[test]
    fn failed_commit_record_does_not_diverge_cache_from_db() {
        let mut fx = TestFixture::new();
        fx.wal.fail_commit = true;
        let mut scope = fx.write_scope();
        let change_id = scope.change_id();
        let item = message(scope.next_item_id(), change_id);
        scope.mark_created(DirtyItem::Item(Arc::clone(&item)));
        // The size delta forces a counter write, binding a real database
        // transaction to the scope.
        scope.add_size_delta(100);
        scope.commit();
        // The database commit stands; the missing commit record is only
        // logged.
        assert!(scope.close().unwrap().is_some());
        assert_eq!(1, fx.db.state.lock().unwrap().commits);
        assert!(!fx
            .wal
            .events
            .lock()
            .unwrap()
            .contains(&"commit".to_owned()));

        // Caches track the committed database state, not the log.
        assert_eq!(100, fx.mailbox.size_bytes());
        let scope = fx.write_scope();
        assert_eq!(Some(item.clone()), scope.get_item(item.id).unwrap());
    }

    #[test]
    fn rollback_cleans_db_wal_caches_and_staged_blobs() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        let change_id = scope.change_id();
        let item = message(scope.next_item_id(), change_id);
        let staged = scope.stage_blob(b"hello").unwrap();
        scope.mark_created(DirtyItem::Item(Arc::clone(&item)));
        // No commit(): the close below rolls back.
        assert!(scope.close().unwrap().is_none());
        drop(scope);

        assert!(fx
            .wal
            .events
            .lock()
            .unwrap()
            .contains(&"abort".to_owned()));
        assert_eq!(0, fx.db.state.lock().unwrap().commits);
        assert_eq!(vec![staged.path], *fx.blobs.deleted.lock().unwrap());
        assert!(fx.mailbox.items.lock().unwrap().is_empty());

        // Counters were never advanced.
        assert_eq!(ItemId(0), fx.mailbox.last_item_id());
        assert_eq!(ChangeId(0), fx.mailbox.last_change_id());
    }

    #[test]
    fn inner_failure_poisons_outer_commit() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        scope.add_size_delta(10);
        scope.begin_nested("inner", LockKind::Write, false).unwrap();
        scope.close().unwrap(); // inner level, no commit()

        scope.commit();
        assert!(scope.close().unwrap().is_none());
        assert_eq!(0, fx.mailbox.size_bytes());
        assert_eq!(0, fx.db.state.lock().unwrap().commits);
    }

    #[test]
    fn dropped_scope_rolls_back_and_releases_lock() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        scope.change_id();
        scope.add_size_delta(10);
        drop(scope);

        assert!(fx.mailbox.lock.held_by_current_thread().is_none());
        assert_eq!(0, fx.db.state.lock().unwrap().commits);
        assert!(fx
            .wal
            .events
            .lock()
            .unwrap()
            .contains(&"abort".to_owned()));
    }

    #[test]
    fn deferred_deletes_run_after_successful_commit() {
        let fx = TestFixture::new();
        let mut scope = fx.write_scope();
        scope.queue_blob_delete(BlobHandle {
            path: "old/blob".to_owned(),
        });
        scope.queue_index_delete(IndexId(99));
        scope.mark_deleted(ItemId(5), ItemKind::Message);
        scope.commit();
        scope.close().unwrap();

        assert_eq!(
            vec!["old/blob".to_owned()],
            *fx.blobs.deleted.lock().unwrap(),
        );
        assert_eq!(vec![IndexId(99)], *fx.index.deleted.lock().unwrap());
    }

    #[test]
    fn folder_mutation_rollback_invalidates_folder_cache() {
        let fx = TestFixture::new();
        fx.warm_up();
        let mut scope = fx.write_scope();
        let change_id = scope.change_id();
        scope.mark_created(DirtyItem::Folder(Arc::new(Folder {
            id: ItemId(3),
            uuid: Uuid::new_v4(),
            parent_id: ItemId(1),
            name: "drafts".to_owned(),
            message_count: 0,
            unread_count: 0,
            size: 0,
            mod_metadata: change_id,
        })));
        scope.close().unwrap();

        assert!(!fx.mailbox.folders_tags.is_warm());
    }

    #[test]
    fn dirty_set_merges_and_cancels() {
        let mut mods = PendingModifications::default();
        let a = message(ItemId(1), ChangeId(1));
        let b = message(ItemId(2), ChangeId(1));

        mods.record_created(DirtyItem::Item(Arc::clone(&a)));
        mods.record_modified(DirtyItem::Item(Arc::clone(&a)), ChangeMask::FLAGS);
        // Still a create, not a modify.
        assert_eq!(1, mods.created.len());
        assert!(mods.modified.is_empty());

        mods.record_modified(DirtyItem::Item(Arc::clone(&b)), ChangeMask::FLAGS);
        mods.record_modified(DirtyItem::Item(Arc::clone(&b)), ChangeMask::TAGS);
        assert_eq!(
            ChangeMask::FLAGS | ChangeMask::TAGS,
            mods.modified[&ItemId(2)].1,
        );

        // Deleting the same-transaction create cancels it entirely.
        mods.record_deleted(ItemId(1), ItemKind::Message);
        assert!(mods.created.is_empty());
        assert!(!mods.deleted.contains_key(&ItemId(1)));

        mods.record_deleted(ItemId(2), ItemKind::Message);
        assert!(mods.modified.is_empty());
        assert_eq!(Some(&ItemKind::Message), mods.deleted.get(&ItemId(2)));
    }

    #[test]
    fn conflicted_commit_is_retryable() {
        let fx = TestFixture::new();
        fx.db.state.lock().unwrap().conflict_commits = 2;

        let result = retry_on_conflict(|_attempt| {
            let mut scope = fx.write_scope();
            scope.add_size_delta(10);
            scope.commit();
            scope.close().map(|_| ())
        });
        assert!(result.is_ok());
        assert_eq!(10, fx.mailbox.size_bytes());
    }

    #[test]
    fn conflict_surfaces_after_three_attempts() {
        let mut calls = 0;
        let result: Result<(), Error> = retry_on_conflict(|attempt| {
            calls += 1;
            assert_eq!(calls, attempt);
            Err(Error::DbConflict)
        });
        assert!(matches!(result, Err(Error::DbConflict)));
        assert_eq!(3, calls);
    }

    #[test]
    fn checkpoint_rounding() {
        assert_eq!(0, round_up_to_checkpoint(0, ITEM_CHECKPOINT_INCREMENT));
        assert_eq!(20, round_up_to_checkpoint(1, ITEM_CHECKPOINT_INCREMENT));
        assert_eq!(20, round_up_to_checkpoint(20, ITEM_CHECKPOINT_INCREMENT));
        assert_eq!(40, round_up_to_checkpoint(21, ITEM_CHECKPOINT_INCREMENT));
        assert_eq!(
            200,
            round_up_to_checkpoint(101, CHANGE_CHECKPOINT_INCREMENT),
        );
    }

    #[test]
    fn modify_conflict_surfaces_through_lookup() {
        let fx = TestFixture::new();
        fx.db
            .insert_item(fx.mailbox.id(), (*message(ItemId(9), ChangeId(50))).clone());

        let scope = fx.write_scope();
        let constraint = Some(ChangeConstraint::CheckModified(ChangeId(10)));
        assert!(matches!(
            scope.get_item_checked(ItemId(9), constraint),
            Err(Error::ModifyConflict),
        ));
    }
}
