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

//! The process-wide mailbox registry.
//!
//! Maps account ids to mailbox ids and mailbox ids to live mailbox
//! instances. Mailboxes are faulted in on first access and, on purgeable
//! deployments, held through a weak reference afterwards so an idle mailbox
//! can drop from memory under pressure and be reloaded on demand.
//!
//! The registry is an explicit instance owned by the embedding server, not a
//! global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex, Weak};

use super::defs::Mailbox;
use super::interfaces::{BlobStore, DbPool};
use super::maintenance::MaintenanceToken;
use super::model::{AccountId, MailboxId};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::StoreConfig;

pub struct MailboxRegistry {
    config: StoreConfig,
    log_prefix: LogPrefix,
    db: Arc<dyn DbPool>,
    blobs: Arc<dyn BlobStore>,
    inner: Mutex<Inner>,
    next_episode: AtomicU64,
}

#[derive(Default)]
struct Inner {
    account_ids: HashMap<AccountId, MailboxId>,
    mailboxes: HashMap<MailboxId, CacheSlot>,
}

enum CacheSlot {
    /// Pinned in memory.
    Loaded(Arc<Mailbox>),
    /// Held weakly; reclaimed when the last outside reference drops.
    Soft(Weak<Mailbox>),
    /// Under maintenance. Only the maintenance holder gets the instance.
    Maintenance {
        token: MaintenanceToken,
        mailbox: Arc<Mailbox>,
    },
}

impl MailboxRegistry {
    /// Creates a registry, priming the account → mailbox id map from the
    /// database. No mailbox is loaded yet.
    pub fn new(
        log_prefix: LogPrefix,
        config: StoreConfig,
        db: Arc<dyn DbPool>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, Error> {
        let account_ids = db.load_mailbox_ids()?;
        log::info!(
            "{} Registry primed with {} mailboxes",
            log_prefix,
            account_ids.len(),
        );
        Ok(Self {
            config,
            log_prefix,
            db,
            blobs,
            inner: Mutex::new(Inner {
                account_ids,
                mailboxes: HashMap::new(),
            }),
            next_episode: AtomicU64::new(0),
        })
    }

    /// Returns the account's mailbox, creating its persistent record on
    /// first-ever access and faulting it into memory if necessary.
    pub fn get_or_load(
        &self,
        account: &AccountId,
    ) -> Result<Arc<Mailbox>, Error> {
        let known = self
            .inner
            .lock()
            .unwrap()
            .account_ids
            .get(account)
            .copied();
        let id = match known {
            Some(id) => id,
            None => {
                let id = self.db.create_mailbox(account)?;
                // Re-checked under the registry lock: another thread may
                // have created the account's mailbox while this one was in
                // the database. Exactly one id may ever be mapped.
                let mut inner = self.inner.lock().unwrap();
                match inner.account_ids.get(account) {
                    Some(&existing) => {
                        log::warn!(
                            "{} Lost creation race for {}; \
                             abandoning duplicate mailbox {}",
                            self.log_prefix,
                            account.as_str(),
                            id.0,
                        );
                        existing
                    },
                    None => {
                        log::info!(
                            "{} Created mailbox {} for {}",
                            self.log_prefix,
                            id.0,
                            account.as_str(),
                        );
                        inner.account_ids.insert(account.clone(), id);
                        id
                    },
                }
            },
        };
        self.load_slot(id, account)
    }

    pub fn mailbox_id_for(&self, account: &AccountId) -> Option<MailboxId> {
        self.inner.lock().unwrap().account_ids.get(account).copied()
    }

    /// Number of mailboxes currently resident in memory, counting soft
    /// slots only while their instance is still alive.
    pub fn resident_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .mailboxes
            .values()
            .filter(|slot| match **slot {
                CacheSlot::Loaded(..) | CacheSlot::Maintenance { .. } => true,
                CacheSlot::Soft(ref weak) => weak.strong_count() > 0,
            })
            .count()
    }

    /// Drops soft slots whose mailbox has been reclaimed.
    pub fn prune(&self) {
        self.inner.lock().unwrap().mailboxes.retain(|_, slot| {
            match *slot {
                CacheSlot::Soft(ref weak) => weak.strong_count() > 0,
                _ => true,
            }
        });
    }

    /// Takes the account's mailbox offline for a structural operation and
    /// marks its registry slot accordingly: until the returned token is
    /// surrendered, only the calling thread can reach the mailbox.
    pub fn begin_maintenance(
        &self,
        account: &AccountId,
    ) -> Result<MaintenanceToken, Error> {
        let mailbox = self.get_or_load(account)?;
        let episode = self.next_episode.fetch_add(1, Relaxed) + 1;
        let token = mailbox.begin_maintenance(episode)?;
        self.inner.lock().unwrap().mailboxes.insert(
            mailbox.id(),
            CacheSlot::Maintenance {
                token: token.clone(),
                mailbox,
            },
        );
        Ok(token)
    }

    /// Surrenders a maintenance token.
    ///
    /// On success the mailbox returns to service with purged caches, or is
    /// forgotten entirely when `remove_from_cache` is set (mailbox
    /// deletion). On failure the mailbox stays resident but permanently
    /// unavailable, so callers get a clear error instead of stale data.
    pub fn end_maintenance(
        &self,
        token: &MaintenanceToken,
        success: bool,
        remove_from_cache: bool,
    ) -> Result<(), Error> {
        let mailbox = {
            let inner = self.inner.lock().unwrap();
            match inner.mailboxes.get(&token.mailbox_id) {
                Some(&CacheSlot::Maintenance {
                    token: ref slot_token,
                    ref mailbox,
                }) if slot_token == token => Arc::clone(mailbox),
                _ => return Err(Error::BadMaintenanceToken),
            }
        };
        mailbox.end_maintenance(token, success)?;

        let mut inner = self.inner.lock().unwrap();
        if !success {
            log::warn!(
                "{} Maintenance on mailbox {} failed",
                self.log_prefix,
                token.mailbox_id.0,
            );
            inner
                .mailboxes
                .insert(token.mailbox_id, CacheSlot::Loaded(mailbox));
            return Ok(());
        }

        if mailbox.in_maintenance() {
            // Inner level of a nested episode; the outer holder still owns
            // the mailbox.
            return Ok(());
        }

        if remove_from_cache {
            inner.mailboxes.remove(&token.mailbox_id);
            inner.account_ids.remove(&token.account_id);
        } else {
            inner
                .mailboxes
                .insert(token.mailbox_id, self.slot_for(&mailbox));
        }
        Ok(())
    }

    fn slot_for(&self, mailbox: &Arc<Mailbox>) -> CacheSlot {
        if self.config.purgeable_mailboxes {
            CacheSlot::Soft(Arc::downgrade(mailbox))
        } else {
            CacheSlot::Loaded(Arc::clone(mailbox))
        }
    }

    fn load_slot(
        &self,
        id: MailboxId,
        account: &AccountId,
    ) -> Result<Arc<Mailbox>, Error> {
        {
            let inner = self.inner.lock().unwrap();
            match inner.mailboxes.get(&id) {
                Some(&CacheSlot::Loaded(ref mailbox)) => {
                    return Ok(Arc::clone(mailbox))
                },
                Some(&CacheSlot::Soft(ref weak)) => {
                    if let Some(mailbox) = weak.upgrade() {
                        return Ok(mailbox);
                    }
                    // Reclaimed; fall through and reload.
                },
                Some(&CacheSlot::Maintenance { ref mailbox, .. }) => {
                    mailbox.maintenance.check_open()?;
                    return Ok(Arc::clone(mailbox));
                },
                None => {},
            }
        }

        // Load outside the registry lock; a slow database must not block
        // access to unrelated mailboxes.
        let mailbox = Arc::new(Mailbox::load(
            self.log_prefix.deep_clone(),
            self.config.clone(),
            id,
            account.clone(),
            Arc::clone(&self.db),
            Arc::clone(&self.blobs),
            None,
        )?);

        let mut inner = self.inner.lock().unwrap();
        // Double check: another thread may have won the race meanwhile.
        match inner.mailboxes.get(&id) {
            Some(&CacheSlot::Loaded(ref existing)) => {
                return Ok(Arc::clone(existing))
            },
            Some(&CacheSlot::Soft(ref weak)) => {
                if let Some(existing) = weak.upgrade() {
                    return Ok(existing);
                }
            },
            Some(&CacheSlot::Maintenance { .. }) => {
                return Err(Error::MailboxInMaintenance)
            },
            None => {},
        }
        inner.mailboxes.insert(id, self.slot_for(&mailbox));
        Ok(mailbox)
    }
}

#[cfg(test)]
mod test {
    use super::super::interfaces::testutil::{MemBlobs, MemDb};
    use super::super::lock::LockKind;
    use super::*;

    fn registry(config: StoreConfig) -> (MemDb, MailboxRegistry) {
        let db = MemDb::default();
        let registry = MailboxRegistry::new(
            LogPrefix::new("registry".to_owned()),
            config,
            Arc::new(db.clone()),
            Arc::new(MemBlobs::default()),
        )
        .unwrap();
        (db, registry)
    }

    fn account() -> AccountId {
        AccountId::new("user@example.com")
    }

    #[test]
    fn creates_mailbox_on_first_access() {
        let (db, registry) = registry(StoreConfig::default());
        assert_eq!(None, registry.mailbox_id_for(&account()));

        let mailbox = registry.get_or_load(&account()).unwrap();
        assert_eq!(Some(mailbox.id()), registry.mailbox_id_for(&account()));
        assert!(db
            .state
            .lock()
            .unwrap()
            .accounts
            .contains_key(&account()));

        // While the instance is alive, lookups return the same one.
        let again = registry.get_or_load(&account()).unwrap();
        assert!(Arc::ptr_eq(&mailbox, &again));
        assert_eq!(1, registry.resident_count());
    }

    #[test]
    fn racing_first_accesses_converge_on_one_mailbox() {
        let (db, registry) = registry(StoreConfig::default());
        let registry = Arc::new(registry);
        let rendezvous = Arc::new(std::sync::Barrier::new(2));
        db.state.lock().unwrap().create_rendezvous =
            Some(Arc::clone(&rendezvous));

        let other = Arc::clone(&registry);
        let racer = std::thread::spawn(move || {
            other.get_or_load(&account()).unwrap().id()
        });

        // Hold the racer mid-creation, then race it from this thread.
        rendezvous.wait();
        db.state.lock().unwrap().create_rendezvous = None;
        let id = registry.get_or_load(&account()).unwrap().id();

        assert_eq!(id, racer.join().unwrap());
        assert_eq!(Some(id), registry.mailbox_id_for(&account()));
    }

    #[test]
    fn reclaimed_soft_slot_reloads() {
        let (_db, registry) = registry(StoreConfig::default());
        let mailbox = registry.get_or_load(&account()).unwrap();
        let id = mailbox.id();
        drop(mailbox);

        assert_eq!(0, registry.resident_count());
        registry.prune();

        let reloaded = registry.get_or_load(&account()).unwrap();
        assert_eq!(id, reloaded.id());
    }

    #[test]
    fn non_purgeable_deployment_pins_mailboxes() {
        let config = StoreConfig {
            purgeable_mailboxes: false,
            ..StoreConfig::default()
        };
        let (_db, registry) = registry(config);

        let mailbox = registry.get_or_load(&account()).unwrap();
        drop(mailbox);
        // Still resident; the registry itself holds it.
        assert_eq!(1, registry.resident_count());
    }

    #[test]
    fn maintenance_slot_blocks_non_holders() {
        let (_db, registry) = registry(StoreConfig::default());
        let registry = Arc::new(registry);
        let token = registry.begin_maintenance(&account()).unwrap();

        // The holder thread retains access.
        let mailbox = registry.get_or_load(&account()).unwrap();
        let mut scope = mailbox
            .begin("holder", LockKind::Write, None)
            .unwrap();
        scope.commit();
        scope.close().unwrap();

        let other = Arc::clone(&registry);
        std::thread::spawn(move || {
            assert!(matches!(
                other.get_or_load(&account()),
                Err(Error::MailboxInMaintenance),
            ));
        })
        .join()
        .unwrap();

        registry.end_maintenance(&token, true, false).unwrap();
        assert!(registry.get_or_load(&account()).is_ok());
    }

    #[test]
    fn successful_maintenance_purges_caches() {
        let (_db, registry) = registry(StoreConfig::default());
        let mailbox = registry.get_or_load(&account()).unwrap();

        // Warm the folder/tag cache.
        let mut scope = mailbox.begin("warm", LockKind::Write, None).unwrap();
        scope.commit();
        scope.close().unwrap();
        assert!(mailbox.folders_tags.is_warm());

        let token = registry.begin_maintenance(&account()).unwrap();
        registry.end_maintenance(&token, true, false).unwrap();
        assert!(!mailbox.folders_tags.is_warm());
    }

    #[test]
    fn nested_maintenance_ends_on_last_surrender() {
        let (_db, registry) = registry(StoreConfig::default());
        let outer = registry.begin_maintenance(&account()).unwrap();
        let inner = registry.begin_maintenance(&account()).unwrap();
        assert_eq!(outer, inner);

        registry.end_maintenance(&inner, true, false).unwrap();
        let mailbox = registry.get_or_load(&account()).unwrap();
        assert!(mailbox.in_maintenance());

        registry.end_maintenance(&outer, true, false).unwrap();
        assert!(!registry
            .get_or_load(&account())
            .unwrap()
            .in_maintenance());
    }

    #[test]
    fn failed_maintenance_leaves_unavailable_slot() {
        let (_db, registry) = registry(StoreConfig::default());
        let token = registry.begin_maintenance(&account()).unwrap();
        registry.end_maintenance(&token, false, false).unwrap();

        let mailbox = registry.get_or_load(&account()).unwrap();
        assert!(mailbox.is_unavailable());
        assert!(matches!(
            mailbox.begin("late", LockKind::Write, None),
            Err(Error::MailboxUnavailable),
        ));
    }

    #[test]
    fn deletion_forgets_account_and_slot() {
        let (_db, registry) = registry(StoreConfig::default());
        let original = registry.get_or_load(&account()).unwrap();
        let original_id = original.id();
        drop(original);

        let token = registry.begin_maintenance(&account()).unwrap();
        registry.end_maintenance(&token, true, true).unwrap();

        assert_eq!(None, registry.mailbox_id_for(&account()));
        // The next access provisions a brand new mailbox.
        let fresh = registry.get_or_load(&account()).unwrap();
        assert_ne!(original_id, fresh.id());
    }

    #[test]
    fn surrendering_a_foreign_token_fails() {
        let (_db, registry) = registry(StoreConfig::default());
        let token = registry.begin_maintenance(&account()).unwrap();
        registry.end_maintenance(&token, true, false).unwrap();

        // The episode is over; the token is no longer honored.
        assert!(matches!(
            registry.end_maintenance(&token, true, false),
            Err(Error::BadMaintenanceToken),
        ));
    }
}
