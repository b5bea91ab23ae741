//! Outstanding-Table Builder - repair & late-join seeding
//!
//! Reconstructs an entity type's outstanding log from the current store
//! snapshot, treating every synchronizable column as "changed at the
//! row's own creation time". Used when a device joins sync late (the
//! whole store becomes one initial upload) and when a log must be
//! rebuilt after corruption - no edit history is needed, current state
//! is enough because messages restate full values.
//!
//! The per-column upsert makes a rebuild idempotent: re-running against
//! an existing log refreshes entries instead of duplicating them.

use super::outstanding::OutstandingLog;
use crate::store::models::{EntityKind, NO_UUID};
use crate::store::{EntityStore, StoreError};

/// Hook emitting synthetic outstanding entries for one entity, derived
/// from related tables the base columns cannot see
pub trait BuilderExtras {
    fn emit(
        &self,
        store: &EntityStore,
        log: &OutstandingLog,
        entity_id: i64,
        created_at: i64,
    ) -> Result<usize, StoreError>;
}

/// Task extras: one synthetic "tag_added" entry per live tag link, so
/// membership survives a rebuild without the protocol knowing about the
/// link table.
pub struct TaskTagExtras;

impl BuilderExtras for TaskTagExtras {
    fn emit(
        &self,
        store: &EntityStore,
        log: &OutstandingLog,
        entity_id: i64,
        created_at: i64,
    ) -> Result<usize, StoreError> {
        let links = store.links_for_task(entity_id)?;
        for link in &links {
            log.upsert(
                entity_id,
                &format!("tag_added:{}", link.tag_uuid),
                &link.tag_uuid,
                created_at,
            )?;
        }
        Ok(links.len())
    }
}

/// Rebuilds outstanding logs from store snapshots
pub struct OutstandingTableBuilder {
    store: EntityStore,
}

impl OutstandingTableBuilder {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Emit one outstanding entry per synchronizable column for every
    /// live row of `kind`, stamped with the row's creation time. Rows
    /// missing a global uuid are assigned one first (suppressed write -
    /// identity is not a synced change). Returns the number of entries
    /// emitted.
    pub fn build(
        &self,
        kind: EntityKind,
        extras: Option<&dyn BuilderExtras>,
    ) -> Result<usize, StoreError> {
        let log = OutstandingLog::new(self.store.database(), kind);
        let snapshots = self.store.snapshot(kind)?;

        let mut emitted = 0;
        let mut rows = 0;
        for snapshot in snapshots {
            if snapshot.deleted_at != 0 {
                continue;
            }
            rows += 1;

            if snapshot.uuid == NO_UUID {
                let minted = uuid::Uuid::new_v4().to_string();
                self.store.set_uuid(kind, snapshot.id, &minted)?;
            }

            for (column, value) in &snapshot.values {
                log.upsert(snapshot.id, column, value, snapshot.created_at)?;
                emitted += 1;
            }

            if let Some(extras) = extras {
                emitted += extras.emit(&self.store, &log, snapshot.id, snapshot.created_at)?;
            }
        }

        log::info!(
            "Rebuilt {} outstanding log: {} entries across {} rows",
            kind.as_str(),
            emitted,
            rows
        );
        Ok(emitted)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::models::{TagData, Task};
    use std::sync::Arc;

    fn setup() -> (EntityStore, OutstandingTableBuilder) {
        let store = EntityStore::new(Arc::new(Database::in_memory().unwrap()));
        let builder = OutstandingTableBuilder::new(store.clone());
        (store, builder)
    }

    /// Save n tasks and wipe the log, as if it had been lost
    fn seed_tasks_with_cleared_log(store: &EntityStore, n: i64) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..n {
            let mut task = Task::new(format!("task {}", i));
            ids.push(store.save_task(&mut task, false).unwrap());
        }
        let log = OutstandingLog::new(store.database(), EntityKind::Task);
        for id in &ids {
            log.purge_entity(*id).unwrap();
        }
        ids
    }

    #[test]
    fn test_build_emits_n_times_k_entries() {
        let (store, builder) = setup();
        seed_tasks_with_cleared_log(&store, 3);

        let emitted = builder.build(EntityKind::Task, None).unwrap();
        let k = EntityKind::Task.synced_columns().len();
        assert_eq!(emitted, 3 * k);

        let log = OutstandingLog::new(store.database(), EntityKind::Task);
        assert_eq!(log.count().unwrap(), (3 * k) as i64);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (store, builder) = setup();
        seed_tasks_with_cleared_log(&store, 2);

        builder.build(EntityKind::Task, None).unwrap();
        let log = OutstandingLog::new(store.database(), EntityKind::Task);
        let count_first = log.count().unwrap();

        // Immediately rebuilding must not add a single row
        builder.build(EntityKind::Task, None).unwrap();
        assert_eq!(log.count().unwrap(), count_first);
    }

    #[test]
    fn test_entries_stamped_with_row_creation_time() {
        let (store, builder) = setup();
        let mut task = Task::new("old task");
        task.created_at = 1_600_000_000_000;
        let id = store.save_task(&mut task, false).unwrap();

        let log = OutstandingLog::new(store.database(), EntityKind::Task);
        log.purge_entity(id).unwrap();

        builder.build(EntityKind::Task, None).unwrap();
        let pending = log.all_pending(id).unwrap();
        assert!(pending.iter().all(|e| e.created_at == 1_600_000_000_000));
    }

    #[test]
    fn test_deleted_rows_are_skipped() {
        let (store, builder) = setup();
        let ids = seed_tasks_with_cleared_log(&store, 2);
        store.soft_delete_task(ids[0], true).unwrap();

        let emitted = builder.build(EntityKind::Task, None).unwrap();
        assert_eq!(emitted, EntityKind::Task.synced_columns().len());
    }

    #[test]
    fn test_extras_emit_tag_links() {
        let (store, builder) = setup();
        let ids = seed_tasks_with_cleared_log(&store, 1);
        store.add_tag_link(ids[0], "tag-a", true).unwrap();
        store.add_tag_link(ids[0], "tag-b", true).unwrap();
        // A removed link must not reappear in the rebuilt log
        store.add_tag_link(ids[0], "tag-c", true).unwrap();
        store.remove_tag_link(ids[0], "tag-c", true).unwrap();

        let emitted = builder.build(EntityKind::Task, Some(&TaskTagExtras)).unwrap();
        assert_eq!(emitted, EntityKind::Task.synced_columns().len() + 2);

        let log = OutstandingLog::new(store.database(), EntityKind::Task);
        let columns: Vec<String> = log
            .all_pending(ids[0])
            .unwrap()
            .into_iter()
            .map(|e| e.column_name)
            .collect();
        assert!(columns.contains(&"tag_added:tag-a".to_string()));
        assert!(columns.contains(&"tag_added:tag-b".to_string()));
        assert!(!columns.iter().any(|c| c.contains("tag-c")));
    }

    #[test]
    fn test_build_mints_missing_uuids() {
        let (store, builder) = setup();
        let ids = seed_tasks_with_cleared_log(&store, 1);
        assert_eq!(store.fetch_task(ids[0]).unwrap().unwrap().uuid, NO_UUID);

        builder.build(EntityKind::Task, None).unwrap();
        let uuid = store.fetch_task(ids[0]).unwrap().unwrap().uuid;
        assert_ne!(uuid, NO_UUID);

        // A second build keeps the minted identity
        builder.build(EntityKind::Task, None).unwrap();
        assert_eq!(store.fetch_task(ids[0]).unwrap().unwrap().uuid, uuid);
    }

    #[test]
    fn test_build_other_kinds() {
        let (store, builder) = setup();
        let mut tag = TagData::new("errands");
        let id = store.save_tag(&mut tag, false).unwrap();
        let log = OutstandingLog::new(store.database(), EntityKind::Tag);
        log.purge_entity(id).unwrap();

        let emitted = builder.build(EntityKind::Tag, None).unwrap();
        assert_eq!(emitted, EntityKind::Tag.synced_columns().len());
    }
}
