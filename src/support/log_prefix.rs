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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so a component
/// that learns more context (for example, which mailbox it ended up
/// operating on) enriches the prefix for every holder at once.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    component: String,
    account: Option<String>,
    mailbox_id: Option<i64>,
}

impl LogPrefix {
    pub fn new(component: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component,
                account: None,
                mailbox_id: None,
            })),
        }
    }

    /// Creates a prefix which no longer shares data with `self`.
    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner::clone(&inner))),
        }
    }

    pub fn set_account(&self, account: String) {
        self.inner.lock().unwrap().account = Some(sanitise(account));
    }

    pub fn set_mailbox_id(&self, id: i64) {
        self.inner.lock().unwrap().mailbox_id = Some(id);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "[{}", inner.component)?;
        if let Some(ref account) = inner.account {
            write!(f, ":{account}")?;
        }
        if let Some(id) = inner.mailbox_id {
            write!(f, "/mbox{id}")?;
        }
        write!(f, "]")
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control() && ']' != c);
    s
}
