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

//! The data model shared by the lock, cache and transaction layers.

use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::prelude::*;
use uuid::Uuid;

use crate::support::error::Error;

/// The id of a mailbox, unique within the deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub i64);

/// The id of the account owning a mailbox.
///
/// Account ids are compared case-insensitively; the constructor normalises.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(raw: &str) -> Self {
        Self(raw.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The id of an item within one mailbox.
///
/// Item ids are assigned from a monotonic per-mailbox counter and are never
/// reused, though crash recovery may leave gaps (see the checkpoint
/// increments in the transaction layer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub i32);

/// A change sequence number.
///
/// Every write transaction on a mailbox is assigned a monotonically
/// non-decreasing (though not necessarily gap-free) change id; all writes in
/// one transaction share it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId(pub i32);

/// The id of a saved search, assigned from its own counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SearchId(pub i32);

/// The id of a full-text index entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(pub i64);

/// A second-resolution UTC timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub DateTime<Utc>);

impl UnixTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn zero() -> Self {
        Self(DateTime::<Utc>::from_timestamp(0, 0).unwrap())
    }
}

/// The kind of an item stored in a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Folder,
    Tag,
    Message,
    Conversation,
    Contact,
    CalendarItem,
    Document,
}

impl ItemKind {
    /// Whether items of this kind live in the always-resident folder/tag
    /// cache rather than the bounded item cache.
    pub fn is_always_cached(self) -> bool {
        matches!(self, Self::Folder | Self::Tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Tag => "tag",
            Self::Message => "message",
            Self::Conversation => "conversation",
            Self::Contact => "contact",
            Self::CalendarItem => "calendar-item",
            Self::Document => "document",
        }
    }
}

bitflags! {
    /// Why an item appears in a transaction's modified set.
    pub struct ChangeMask: u32 {
        const CONTENT  = 1 << 0;
        const FLAGS    = 1 << 1;
        const FOLDER   = 1 << 2;
        const TAGS     = 1 << 3;
        const SIZE     = 1 << 4;
        const UNREAD   = 1 << 5;
        const NAME     = 1 << 6;
        const POSITION = 1 << 7;
        const CONFIG   = 1 << 8;
        const METADATA = 1 << 9;
    }
}

bitflags! {
    /// User-visible flags on an item.
    pub struct ItemFlags: u32 {
        const UNREAD    = 1 << 0;
        const FLAGGED   = 1 << 1;
        const DRAFT     = 1 << 2;
        const DELETED   = 1 << 3;
        const REPLIED   = 1 << 4;
        const FORWARDED = 1 << 5;
        const ATTACHED  = 1 << 6;
        const COPIED    = 1 << 7;
    }
}

/// An immutable snapshot of one mail item.
///
/// Items are shared between the caches and callers as `Arc<MailItem>`; a
/// mutation produces a new snapshot which replaces the old one at commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailItem {
    pub id: ItemId,
    pub uuid: Uuid,
    pub kind: ItemKind,
    /// The folder containing this item.
    pub folder_id: ItemId,
    pub flags: ItemFlags,
    /// Size of the item's content in bytes.
    pub size: u64,
    /// Change id of the last metadata modification.
    pub mod_metadata: ChangeId,
    /// Change id of the item's creation or last content modification.
    pub mod_content: ChangeId,
}

/// An always-resident folder entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    pub id: ItemId,
    pub uuid: Uuid,
    pub parent_id: ItemId,
    pub name: String,
    pub message_count: u32,
    pub unread_count: u32,
    pub size: u64,
    pub mod_metadata: ChangeId,
}

/// An always-resident tag entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub id: ItemId,
    pub uuid: Uuid,
    pub name: String,
    pub unread_count: u32,
    pub mod_metadata: ChangeId,
}

/// One entry in a transaction's dirty set, or in a notification snapshot.
#[derive(Clone, Debug)]
pub enum DirtyItem {
    Item(Arc<MailItem>),
    Folder(Arc<Folder>),
    Tag(Arc<Tag>),
}

impl DirtyItem {
    pub fn id(&self) -> ItemId {
        match *self {
            Self::Item(ref item) => item.id,
            Self::Folder(ref folder) => folder.id,
            Self::Tag(ref tag) => tag.id,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match *self {
            Self::Item(ref item) => item.kind,
            Self::Folder(..) => ItemKind::Folder,
            Self::Tag(..) => ItemKind::Tag,
        }
    }
}

/// The persistent scalar state of a mailbox.
///
/// The in-memory copy is authoritative between checkpoints; the database
/// copy may lag by up to one checkpoint increment for the id counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxData {
    /// Total content size of the mailbox in bytes.
    pub size_bytes: u64,
    /// High-water mark of assigned item ids.
    pub last_item_id: ItemId,
    /// High-water mark of assigned change ids.
    pub last_change_id: ChangeId,
    /// High-water mark of assigned saved-search ids.
    pub last_search_id: SearchId,
    /// Number of contacts in the mailbox.
    pub contacts: u32,
    /// Number of messages considered "recent" for display purposes.
    pub recent_messages: u32,
    /// The earliest change id for which sync tracking data is retained, if
    /// sync tracking is on.
    pub sync_cutoff: Option<ChangeId>,
    /// Whether IMAP move tracking is enabled.
    pub track_imap: bool,
    /// The set of per-application config sections present for this mailbox.
    pub config_keys: HashSet<String>,
    /// Timestamp of the last committed change. Not persisted across restart.
    pub last_change_at: UnixTimestamp,
    /// Storage schema version of the mailbox.
    pub version: u32,
}

impl Default for MailboxData {
    fn default() -> Self {
        Self {
            size_bytes: 0,
            last_item_id: ItemId(0),
            last_change_id: ChangeId(0),
            last_search_id: SearchId(0),
            contacts: 0,
            recent_messages: 0,
            sync_cutoff: None,
            track_imap: false,
            config_keys: HashSet::new(),
            last_change_at: UnixTimestamp::zero(),
            version: 1,
        }
    }
}

/// A caller-supplied optimistic-concurrency constraint on the items a
/// transaction may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeConstraint {
    /// The item must not have been created (or content-modified) after the
    /// given change.
    CheckCreated(ChangeId),
    /// The item must not have been modified after the given change.
    CheckModified(ChangeId),
}

/// Evaluates a change constraint against an item.
///
/// `CheckCreated` reports a too-new item by returning `Ok(false)` so the
/// caller can skip it; `CheckModified` is a hard conflict and errors.
pub fn check_item_change_id(
    constraint: Option<ChangeConstraint>,
    item: &MailItem,
) -> Result<bool, Error> {
    match constraint {
        None => Ok(true),
        Some(ChangeConstraint::CheckCreated(bound)) => {
            Ok(item.mod_content <= bound)
        },
        Some(ChangeConstraint::CheckModified(bound)) => {
            if item.mod_metadata > bound {
                Err(Error::ModifyConflict)
            } else {
                Ok(true)
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(mod_metadata: i32, mod_content: i32) -> MailItem {
        MailItem {
            id: ItemId(256),
            uuid: Uuid::new_v4(),
            kind: ItemKind::Message,
            folder_id: ItemId(2),
            flags: ItemFlags::UNREAD,
            size: 1024,
            mod_metadata: ChangeId(mod_metadata),
            mod_content: ChangeId(mod_content),
        }
    }

    #[test]
    fn account_ids_are_case_insensitive() {
        assert_eq!(AccountId::new("User@Example.COM"), AccountId::new("user@example.com"));
    }

    #[test]
    fn change_constraint_unconstrained() {
        assert!(check_item_change_id(None, &item(50, 10)).unwrap());
    }

    #[test]
    fn change_constraint_check_created() {
        let constraint = Some(ChangeConstraint::CheckCreated(ChangeId(20)));
        assert!(check_item_change_id(constraint, &item(50, 10)).unwrap());
        assert!(!check_item_change_id(constraint, &item(50, 30)).unwrap());
    }

    #[test]
    fn change_constraint_check_modified() {
        let constraint = Some(ChangeConstraint::CheckModified(ChangeId(20)));
        assert!(check_item_change_id(constraint, &item(20, 10)).unwrap());
        assert!(matches!(
            check_item_change_id(constraint, &item(21, 10)),
            Err(Error::ModifyConflict),
        ));
    }
}
