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

//! Mailcell is the transactional storage core of a multi-tenant mail store.
//!
//! Each tenant's mailbox is a long-lived aggregate of folders, tags and mail
//! items, accessed concurrently by worker threads and mutated through a
//! write-ahead log for crash recovery. This crate provides the substrate that
//! makes that access correct and efficient:
//!
//! - the per-mailbox reentrant read/write lock with escalation
//!   ([`mailbox::MailboxLock`]),
//! - the per-thread nestable transaction scope ([`mailbox::TxnScope`]),
//! - the two-tier (bounded hard / reclaimable soft) item cache
//!   ([`mailbox::ItemCache`]),
//! - the maintenance/exclusivity mode and the process-scope mailbox registry
//!   ([`mailbox::MailboxRegistry`]).
//!
//! The mail semantics themselves (copy, move, tag, and so forth), the durable
//! format of the write-ahead log, the blob store backend, and the full-text
//! index are all external collaborators consumed through the narrow traits in
//! [`mailbox::interfaces`].

pub mod mailbox;
pub mod support;
