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

//! The always-resident folder and tag cache.
//!
//! Unlike the bounded item cache, this cache is all-or-nothing: either every
//! folder and tag of the mailbox is resident (warm) or none is (cold). A
//! cold cache forces the next transaction onto the exclusive lock so it can
//! repopulate, which is why warmth feeds into
//! [`decide_lock_kind`](super::lock::decide_lock_kind).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::model::{Folder, ItemId, Tag};

#[derive(Default)]
pub struct FolderTagCache {
    warm: RwLock<Option<Warm>>,
}

#[derive(Default)]
struct Warm {
    folders: HashMap<ItemId, Arc<Folder>>,
    folder_names: HashMap<String, ItemId>,
    tags: HashMap<ItemId, Arc<Tag>>,
    tag_names: HashMap<String, ItemId>,
}

impl FolderTagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_warm(&self) -> bool {
        self.warm.read().unwrap().is_some()
    }

    /// Replaces the cache contents wholesale with a fresh load from the
    /// database, making the cache warm.
    pub fn install(&self, folders: Vec<Folder>, tags: Vec<Tag>) {
        let mut warm = Warm::default();
        for folder in folders {
            warm.folder_names.insert(folder.name.clone(), folder.id);
            warm.folders.insert(folder.id, Arc::new(folder));
        }
        for tag in tags {
            warm.tag_names.insert(tag.name.clone(), tag.id);
            warm.tags.insert(tag.id, Arc::new(tag));
        }
        *self.warm.write().unwrap() = Some(warm);
    }

    /// Drops the contents, making the cache cold.
    pub fn invalidate(&self) {
        *self.warm.write().unwrap() = None;
    }

    /// Looks up a folder by id. `None` either because no such folder exists
    /// or because the cache is cold; callers distinguish via [`is_warm`].
    ///
    /// [`is_warm`]: Self::is_warm
    pub fn folder(&self, id: ItemId) -> Option<Arc<Folder>> {
        self.warm
            .read()
            .unwrap()
            .as_ref()
            .and_then(|warm| warm.folders.get(&id).cloned())
    }

    pub fn folder_by_name(&self, name: &str) -> Option<Arc<Folder>> {
        let warm = self.warm.read().unwrap();
        let warm = warm.as_ref()?;
        warm.folders.get(warm.folder_names.get(name)?).cloned()
    }

    pub fn tag(&self, id: ItemId) -> Option<Arc<Tag>> {
        self.warm
            .read()
            .unwrap()
            .as_ref()
            .and_then(|warm| warm.tags.get(&id).cloned())
    }

    pub fn tag_by_name(&self, name: &str) -> Option<Arc<Tag>> {
        let warm = self.warm.read().unwrap();
        let warm = warm.as_ref()?;
        warm.tags.get(warm.tag_names.get(name)?).cloned()
    }

    pub fn folders(&self) -> Vec<Arc<Folder>> {
        self.warm
            .read()
            .unwrap()
            .as_ref()
            .map(|warm| warm.folders.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tags(&self) -> Vec<Arc<Tag>> {
        self.warm
            .read()
            .unwrap()
            .as_ref()
            .map(|warm| warm.tags.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts or replaces a folder. No-op when cold; the next warm load
    /// will pick the folder up from the database anyway.
    pub fn put_folder(&self, folder: Arc<Folder>) {
        if let Some(ref mut warm) = *self.warm.write().unwrap() {
            if let Some(old) = warm.folders.insert(folder.id, Arc::clone(&folder)) {
                if old.name != folder.name {
                    warm.folder_names.remove(&old.name);
                }
            }
            warm.folder_names.insert(folder.name.clone(), folder.id);
        }
    }

    pub fn remove_folder(&self, id: ItemId) {
        if let Some(ref mut warm) = *self.warm.write().unwrap() {
            if let Some(old) = warm.folders.remove(&id) {
                warm.folder_names.remove(&old.name);
            }
        }
    }

    pub fn put_tag(&self, tag: Arc<Tag>) {
        if let Some(ref mut warm) = *self.warm.write().unwrap() {
            if let Some(old) = warm.tags.insert(tag.id, Arc::clone(&tag)) {
                if old.name != tag.name {
                    warm.tag_names.remove(&old.name);
                }
            }
            warm.tag_names.insert(tag.name.clone(), tag.id);
        }
    }

    pub fn remove_tag(&self, id: ItemId) {
        if let Some(ref mut warm) = *self.warm.write().unwrap() {
            if let Some(old) = warm.tags.remove(&id) {
                warm.tag_names.remove(&old.name);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::super::model::ChangeId;
    use super::*;

    fn folder(id: i32, name: &str) -> Folder {
        Folder {
            id: ItemId(id),
            uuid: Uuid::new_v4(),
            parent_id: ItemId(1),
            name: name.to_owned(),
            message_count: 0,
            unread_count: 0,
            size: 0,
            mod_metadata: ChangeId(1),
        }
    }

    fn tag(id: i32, name: &str) -> Tag {
        Tag {
            id: ItemId(id),
            uuid: Uuid::new_v4(),
            name: name.to_owned(),
            unread_count: 0,
            mod_metadata: ChangeId(1),
        }
    }

    #[test]
    fn cold_until_installed() {
        let cache = FolderTagCache::new();
        assert!(!cache.is_warm());
        assert_eq!(None, cache.folder(ItemId(2)));

        cache.install(vec![folder(2, "inbox")], vec![tag(64, "urgent")]);
        assert!(cache.is_warm());
        assert_eq!("inbox", cache.folder(ItemId(2)).unwrap().name);
        assert_eq!(ItemId(64), cache.tag_by_name("urgent").unwrap().id);

        cache.invalidate();
        assert!(!cache.is_warm());
        assert_eq!(None, cache.folder(ItemId(2)));
    }

    #[test]
    fn rename_updates_name_index() {
        let cache = FolderTagCache::new();
        cache.install(vec![folder(2, "inbox")], vec![]);

        cache.put_folder(Arc::new(folder(2, "archive")));
        assert_eq!(None, cache.folder_by_name("inbox").map(|f| f.id));
        assert_eq!(Some(ItemId(2)), cache.folder_by_name("archive").map(|f| f.id));
    }

    #[test]
    fn remove_clears_both_indices() {
        let cache = FolderTagCache::new();
        cache.install(vec![], vec![tag(64, "urgent")]);

        cache.remove_tag(ItemId(64));
        assert_eq!(None, cache.tag(ItemId(64)));
        assert_eq!(None, cache.tag_by_name("urgent"));
    }

    #[test]
    fn mutation_while_cold_is_ignored() {
        let cache = FolderTagCache::new();
        cache.put_folder(Arc::new(folder(2, "inbox")));
        assert!(!cache.is_warm());
        assert!(cache.folders().is_empty());
    }
}
