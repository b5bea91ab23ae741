//! Change Listener & Sync Queue
//!
//! The listener turns entity-store save notifications into queued
//! pending-change refs for the sync worker. It never touches the
//! outstanding log itself - the store's save path already wrote the
//! durable entries - so the only work on the writer's thread is an
//! enqueue.
//!
//! The queue is volatile by design: the outstanding tables are the
//! source of truth, and `rebuild_queue` reconstructs the queue from
//! them at process start.

use super::outstanding::OutstandingLog;
use crate::db::{Database, DbResult};
use crate::store::models::{ALL_KINDS, EntityKind};
use crate::store::{ChangeObserver, SaveEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Reference to an entity with pending outstanding entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub kind: EntityKind,
    pub entity_id: i64,
}

/// In-memory queue of entities awaiting a sync round
pub struct SyncQueue {
    inner: Mutex<VecDeque<PendingChange>>,
    notify: Notify,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append a pending change and wake the worker. Refs already queued
    /// for the same entity are coalesced - the eventual message reads
    /// the whole log anyway.
    pub fn enqueue(&self, change: PendingChange) {
        {
            let mut queue = self.inner.lock().unwrap();
            if !queue.contains(&change) {
                queue.push_back(change);
            }
        }
        self.notify.notify_one();
    }

    /// Take up to `max` refs off the front of the queue
    pub fn drain(&self, max: usize) -> Vec<PendingChange> {
        let mut queue = self.inner.lock().unwrap();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Put refs back at the front, preserving order (failed round)
    pub fn requeue_front(&self, changes: Vec<PendingChange>) {
        let mut queue = self.inner.lock().unwrap();
        for change in changes.into_iter().rev() {
            if !queue.contains(&change) {
                queue.push_front(change);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Resolves on the next enqueue
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Wake the worker without new work (used by shutdown)
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Change Listener
// ============================================================================

/// Store observer feeding the sync queue
pub struct ChangeListener {
    queue: Arc<SyncQueue>,
}

impl ChangeListener {
    pub fn new(queue: Arc<SyncQueue>) -> Self {
        Self { queue }
    }
}

impl ChangeObserver for ChangeListener {
    fn on_saved(&self, event: &SaveEvent) {
        // Saves that logged nothing (no synced column changed, or the
        // write was suppressed) produce no sync traffic.
        if !event.changed_synced_columns {
            return;
        }

        log::debug!(
            "Queueing {} {} for sync",
            event.kind.as_str(),
            event.entity_id
        );
        self.queue.enqueue(PendingChange {
            kind: event.kind,
            entity_id: event.entity_id,
        });
    }
}

/// Rebuild the volatile queue from the durable outstanding tables.
/// Called once at process start, before the worker begins draining.
pub fn rebuild_queue(db: &Arc<Database>, queue: &SyncQueue) -> DbResult<usize> {
    let mut queued = 0;
    for kind in ALL_KINDS {
        let log = OutstandingLog::new(db.clone(), kind);
        for entity_id in log.pending_entity_ids()? {
            queue.enqueue(PendingChange { kind, entity_id });
            queued += 1;
        }
    }
    if queued > 0 {
        log::info!("Rebuilt sync queue with {} pending entities", queued);
    }
    Ok(queued)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use crate::store::models::Task;

    #[test]
    fn test_enqueue_coalesces_duplicates() {
        let queue = SyncQueue::new();
        let change = PendingChange {
            kind: EntityKind::Task,
            entity_id: 1,
        };

        queue.enqueue(change);
        queue.enqueue(change);
        queue.enqueue(PendingChange {
            kind: EntityKind::Tag,
            entity_id: 1,
        });

        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_and_requeue_preserve_order() {
        let queue = SyncQueue::new();
        for id in 1..=3 {
            queue.enqueue(PendingChange {
                kind: EntityKind::Task,
                entity_id: id,
            });
        }

        let drained = queue.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].entity_id, 1);
        assert_eq!(queue.len(), 1);

        queue.requeue_front(drained);
        let all = queue.drain(10);
        let ids: Vec<i64> = all.iter().map(|c| c.entity_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_listener_enqueues_only_logged_saves() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = EntityStore::new(db);
        let queue = Arc::new(SyncQueue::new());
        store.add_observer(Arc::new(ChangeListener::new(queue.clone())));

        let mut task = Task::new("notice me");
        store.save_task(&mut task, false).unwrap();
        assert_eq!(queue.len(), 1);

        // Suppressed write: durable row changes, queue does not
        task.title = "quiet edit".to_string();
        store.save_task(&mut task, true).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rebuild_queue_scans_outstanding_tables() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = EntityStore::new(db.clone());

        // Two tasks with pending entries, saved without any listener
        let mut a = Task::new("a");
        let mut b = Task::new("b");
        store.save_task(&mut a, false).unwrap();
        store.save_task(&mut b, false).unwrap();

        // Fresh queue, as after a process restart
        let queue = SyncQueue::new();
        let queued = rebuild_queue(&db, &queue).unwrap();
        assert_eq!(queued, 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let queue = Arc::new(SyncQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
            })
        };

        // Give the waiter a moment to park, then enqueue
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.enqueue(PendingChange {
            kind: EntityKind::Task,
            entity_id: 7,
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("enqueue must wake the waiter")
            .unwrap();
    }
}
