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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Deployment configuration for the storage core.
///
/// These are operational knobs, read once when a mailbox is opened (and on
/// explicit reconfiguration); they are not part of any on-disk format.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The maximum number of items a mailbox's cache holds with strong
    /// ownership. Items evicted from the bounded tier are demoted to the
    /// reclaimable tier rather than discarded outright.
    ///
    /// `0` sends every item directly to the reclaimable tier, trading cache
    /// misses for memory on constrained deployments.
    pub item_cache_capacity: usize,
    /// How long a transaction waits for the mailbox lock before giving up
    /// with a retryable failure.
    pub lock_timeout_secs: u64,
    /// Whether read-intent transactions may take the shared lock. When
    /// false, every transaction escalates to the exclusive lock.
    pub split_rw_locking: bool,
    /// Forces every transaction to the exclusive lock regardless of intent
    /// or cache state. Used by deployment topologies that cannot tolerate
    /// split read/write locking at all.
    pub force_write_lock: bool,
    /// Whether the registry keeps evicted mailboxes on a reclaimable
    /// reference, allowing them to drop from memory under pressure.
    pub purgeable_mailboxes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            item_cache_capacity: 500,
            lock_timeout_secs: 15,
            split_rw_locking: true,
            force_write_lock: false,
            purgeable_mailboxes: true,
        }
    }
}

impl StoreConfig {
    /// Parses a configuration from its TOML representation.
    ///
    /// Missing fields assume their defaults.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(500, config.item_cache_capacity);
        assert_eq!(Duration::from_secs(15), config.lock_timeout());
        assert!(config.split_rw_locking);
        assert!(!config.force_write_lock);
        assert!(config.purgeable_mailboxes);
    }

    #[test]
    fn parse_partial_toml() {
        let config = StoreConfig::parse(
            "item_cache_capacity = 0\nforce_write_lock = true\n",
        )
        .unwrap();
        assert_eq!(0, config.item_cache_capacity);
        assert!(config.force_write_lock);
        // Unspecified fields keep their defaults.
        assert_eq!(15, config.lock_timeout_secs);
        assert!(config.split_rw_locking);
    }

    #[test]
    fn parse_empty_is_default() {
        assert_eq!(StoreConfig::default(), StoreConfig::parse("").unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(StoreConfig::parse("item_cache_capacity = \"lots\"").is_err());
    }
}
