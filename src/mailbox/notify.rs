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

//! Post-commit change notifications.
//!
//! Committed transactions publish an immutable snapshot of their change set
//! to a queue; listeners consume snapshots strictly after the commit and
//! outside the mailbox lock, so a slow or broken listener can never stall or
//! roll back a transaction.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crossbeam::channel;

use super::interfaces::ChangeListener;
use super::model::{
    ChangeId, ChangeMask, DirtyItem, ItemId, ItemKind, UnixTimestamp,
};
use crate::support::log_prefix::LogPrefix;

/// An immutable description of one committed transaction's change set.
#[derive(Clone, Debug)]
pub struct NotificationSnapshot {
    pub change_id: ChangeId,
    pub timestamp: UnixTimestamp,
    pub created: Vec<DirtyItem>,
    pub modified: Vec<(DirtyItem, ChangeMask)>,
    pub deleted: Vec<(ItemId, ItemKind)>,
}

impl NotificationSnapshot {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
    }
}

/// The per-mailbox notification queue and its listener set.
pub struct NotificationQueue {
    log_prefix: LogPrefix,
    tx: channel::Sender<Arc<NotificationSnapshot>>,
    rx: channel::Receiver<Arc<NotificationSnapshot>>,
    listeners: Arc<Mutex<Vec<Arc<dyn ChangeListener>>>>,
}

impl NotificationQueue {
    pub fn new(log_prefix: LogPrefix) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            log_prefix,
            tx,
            rx,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Enqueues a snapshot. Called by the transaction layer after the commit
    /// has fully taken effect, with the mailbox lock already released.
    pub fn publish(&self, snapshot: NotificationSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        // Send on an unbounded channel only fails if the receiver is gone,
        // which cannot happen while we hold it.
        let _ = self.tx.send(Arc::new(snapshot));
    }

    /// Delivers every queued snapshot to every listener, in publication
    /// order. Returns the number of snapshots delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        while let Ok(snapshot) = self.rx.try_recv() {
            let listeners = self.listeners.lock().unwrap().clone();
            deliver(&self.log_prefix, &listeners, &snapshot);
            delivered += 1;
        }
        delivered
    }

    /// Spawns a dedicated worker thread which delivers snapshots as they are
    /// published. The worker exits once the queue itself is dropped and the
    /// remaining snapshots have been delivered.
    pub fn spawn_dispatcher(&self) -> std::thread::JoinHandle<()> {
        let rx = self.rx.clone();
        let listeners = Arc::clone(&self.listeners);
        let log_prefix = self.log_prefix.clone();
        std::thread::spawn(move || {
            while let Ok(snapshot) = rx.recv() {
                let listeners = listeners.lock().unwrap().clone();
                deliver(&log_prefix, &listeners, &snapshot);
            }
        })
    }
}

/// Invokes every listener for one snapshot. A panicking listener is
/// contained and logged; it does not disturb other listeners or later
/// snapshots.
fn deliver(
    log_prefix: &LogPrefix,
    listeners: &[Arc<dyn ChangeListener>],
    snapshot: &NotificationSnapshot,
) {
    for listener in listeners {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            listener.notify(snapshot)
        }));
        if result.is_err() {
            log::error!(
                "{} Change listener panicked on change {}",
                log_prefix,
                snapshot.change_id.0,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::interfaces::testutil::RecordingListener;
    use super::*;

    fn snapshot(change_id: i32) -> NotificationSnapshot {
        NotificationSnapshot {
            change_id: ChangeId(change_id),
            timestamp: UnixTimestamp::now(),
            created: Vec::new(),
            modified: Vec::new(),
            deleted: vec![(ItemId(1), ItemKind::Message)],
        }
    }

    #[test]
    fn delivers_in_publication_order() {
        let queue = NotificationQueue::new(LogPrefix::new("test".to_owned()));
        let listener = Arc::new(RecordingListener::default());
        queue.add_listener(Arc::clone(&listener) as Arc<dyn ChangeListener>);

        queue.publish(snapshot(1));
        queue.publish(snapshot(2));
        queue.publish(snapshot(3));
        assert_eq!(3, queue.drain());
        assert_eq!(
            vec![ChangeId(1), ChangeId(2), ChangeId(3)],
            *listener.seen.lock().unwrap(),
        );

        // Draining again delivers nothing new.
        assert_eq!(0, queue.drain());
    }

    #[test]
    fn empty_snapshots_are_suppressed() {
        let queue = NotificationQueue::new(LogPrefix::new("test".to_owned()));
        queue.publish(NotificationSnapshot {
            change_id: ChangeId(1),
            timestamp: UnixTimestamp::now(),
            created: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
        });
        assert_eq!(0, queue.drain());
    }

    #[test]
    fn dispatcher_thread_delivers_and_exits_with_queue() {
        let queue = NotificationQueue::new(LogPrefix::new("test".to_owned()));
        let listener = Arc::new(RecordingListener::default());
        queue.add_listener(Arc::clone(&listener) as Arc<dyn ChangeListener>);

        let worker = queue.spawn_dispatcher();
        queue.publish(snapshot(1));
        queue.publish(snapshot(2));
        drop(queue);

        // The worker drains whatever was still queued, then exits.
        worker.join().unwrap();
        assert_eq!(
            vec![ChangeId(1), ChangeId(2)],
            *listener.seen.lock().unwrap(),
        );
    }

    #[test]
    fn panicking_listener_is_contained() {
        struct Panicker;
        impl ChangeListener for Panicker {
            fn notify(&self, _: &NotificationSnapshot) {
                panic!("listener bug")
            }
        }

        let queue = NotificationQueue::new(LogPrefix::new("test".to_owned()));
        let listener = Arc::new(RecordingListener::default());
        queue.add_listener(Arc::new(Panicker));
        queue.add_listener(Arc::clone(&listener) as Arc<dyn ChangeListener>);

        queue.publish(snapshot(4));
        queue.publish(snapshot(5));
        assert_eq!(2, queue.drain());
        // The well-behaved listener saw everything.
        assert_eq!(
            vec![ChangeId(4), ChangeId(5)],
            *listener.seen.lock().unwrap(),
        );
    }
}
