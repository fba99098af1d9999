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

//! The per-mailbox two-tier item cache.
//!
//! The first tier holds strong references with LRU replacement, bounded by
//! `item_cache_capacity`. Eviction from the first tier demotes the item to
//! the second tier, which holds weak references: a demoted item stays
//! retrievable for as long as something else in the process keeps it alive,
//! and quietly drops under memory pressure otherwise.
//!
//! Folders and tags never pass through here; they live in the always-resident
//! [`FolderTagCache`](super::folder_cache::FolderTagCache).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use lru_cache::LruCache;
use uuid::Uuid;

use super::model::{ItemId, MailItem};
use crate::support::log_prefix::LogPrefix;

pub struct ItemCache {
    log_prefix: LogPrefix,
    capacity: usize,
    hard: LruCache<ItemId, Arc<MailItem>>,
    soft: HashMap<ItemId, SoftEntry>,
    by_uuid: HashMap<Uuid, ItemId>,
}

struct SoftEntry {
    weak: Weak<MailItem>,
    uuid: Uuid,
}

/// Which tier an id currently occupies. Test introspection only.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheTier {
    Hard,
    Soft,
}

impl ItemCache {
    pub fn new(log_prefix: LogPrefix, capacity: usize) -> Self {
        Self {
            log_prefix,
            capacity,
            // The LRU map never exceeds `capacity`; demotion is explicit so
            // evictees land in the soft tier instead of being discarded.
            hard: LruCache::new(capacity.max(1)),
            soft: HashMap::new(),
            by_uuid: HashMap::new(),
        }
    }

    /// Inserts or replaces an item.
    ///
    /// An item already present in either tier is re-inserted fresh, so a
    /// commit that replaces a snapshot also restores it to the first tier.
    pub fn put(&mut self, item: Arc<MailItem>) {
        let id = item.id;
        if let Some(entry) = self.soft.remove(&id) {
            self.by_uuid.remove(&entry.uuid);
        }
        if let Some(old) = self.hard.remove(&id) {
            self.by_uuid.remove(&old.uuid);
        }

        self.by_uuid.insert(item.uuid, id);

        if 0 == self.capacity {
            self.soft.insert(
                id,
                SoftEntry {
                    weak: Arc::downgrade(&item),
                    uuid: item.uuid,
                },
            );
            return;
        }

        if self.hard.len() >= self.capacity {
            // Demote the least-recently-used entry rather than letting the
            // LRU map drop it.
            if let Some((old_id, old)) = self.hard.remove_lru() {
                self.soft.insert(
                    old_id,
                    SoftEntry {
                        weak: Arc::downgrade(&old),
                        uuid: old.uuid,
                    },
                );
            }
        }
        self.hard.insert(id, item);
    }

    /// Looks up an item by id in both tiers.
    ///
    /// A hit in the first tier refreshes its recency. A hit on a dead weak
    /// reference in the second tier is a miss; the stale entry is removed and
    /// the caller reloads from the database.
    pub fn get(&mut self, id: ItemId) -> Option<Arc<MailItem>> {
        if let Some(item) = self.hard.get_mut(&id) {
            return Some(Arc::clone(item));
        }

        match self.soft.get(&id) {
            None => None,
            Some(entry) => match entry.weak.upgrade() {
                Some(item) => Some(item),
                None => {
                    let uuid = entry.uuid;
                    self.soft.remove(&id);
                    self.by_uuid.remove(&uuid);
                    log::debug!(
                        "{} Item {} reclaimed from cache, will reload",
                        self.log_prefix,
                        id.0,
                    );
                    None
                },
            },
        }
    }

    pub fn get_by_uuid(&mut self, uuid: Uuid) -> Option<Arc<MailItem>> {
        let id = *self.by_uuid.get(&uuid)?;
        self.get(id)
    }

    /// Removes an item from whichever tier holds it, returning the strong
    /// reference if it was still reachable.
    pub fn remove(&mut self, id: ItemId) -> Option<Arc<MailItem>> {
        if let Some(item) = self.hard.remove(&id) {
            self.by_uuid.remove(&item.uuid);
            return Some(item);
        }

        let entry = self.soft.remove(&id)?;
        self.by_uuid.remove(&entry.uuid);
        entry.weak.upgrade()
    }

    /// Drops everything from both tiers.
    pub fn clear(&mut self) {
        self.hard.clear();
        self.soft.clear();
        self.by_uuid.clear();
    }

    pub fn len(&self) -> usize {
        self.hard.len() + self.soft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hard.is_empty() && self.soft.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tier(&mut self, id: ItemId) -> Option<CacheTier> {
        if self.hard.contains_key(&id) {
            Some(CacheTier::Hard)
        } else if self.soft.contains_key(&id) {
            Some(CacheTier::Soft)
        } else {
            None
        }
    }
}
