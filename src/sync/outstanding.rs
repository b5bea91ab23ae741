//! Outstanding-Entry Log - the durable record of what must be sent
//!
//! One log table per entity type. Each row says "this column of this
//! entity changed to this value at this local time". The UNIQUE
//! (entity_id, column_name) constraint bounds the log to one pending
//! entry per column: repeated edits collapse into the latest value.
//!
//! Entries are deleted only after the server acknowledges the batch
//! that carried them; a crash mid-sync leaves them pending for the
//! next round (at-least-once delivery).

use crate::db::{Database, DbResult};
use crate::store::models::EntityKind;
use rusqlite::params;
use std::sync::Arc;

/// One pending, not-yet-acknowledged column change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingEntry {
    pub id: i64,
    pub entity_id: i64,
    pub column_name: String,
    pub value_string: String,
    pub created_at: i64,
}

/// Accessor for one entity type's outstanding log
#[derive(Clone)]
pub struct OutstandingLog {
    db: Arc<Database>,
    kind: EntityKind,
}

impl OutstandingLog {
    pub fn new(db: Arc<Database>, kind: EntityKind) -> Self {
        Self { db, kind }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Record a pending change. A second write to the same (entity,
    /// column) overwrites the value and timestamp of the existing row.
    pub fn upsert(
        &self,
        entity_id: i64,
        column: &str,
        value: &str,
        created_at: i64,
    ) -> DbResult<()> {
        self.db.execute(
            &format!(
                r#"
                INSERT INTO {} (entity_id, column_name, value_string, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(entity_id, column_name) DO UPDATE SET
                    value_string = excluded.value_string,
                    created_at = excluded.created_at
                "#,
                self.kind.outstanding_table()
            ),
            params![entity_id, column, value, created_at],
        )?;
        Ok(())
    }

    /// All pending entries for one entity, oldest first
    pub fn all_pending(&self, entity_id: i64) -> DbResult<Vec<OutstandingEntry>> {
        self.db.query(
            &format!(
                r#"
                SELECT id, entity_id, column_name, value_string, created_at
                FROM {}
                WHERE entity_id = ?1
                ORDER BY created_at ASC, id ASC
                "#,
                self.kind.outstanding_table()
            ),
            params![entity_id],
            |row| {
                Ok(OutstandingEntry {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    column_name: row.get(2)?,
                    value_string: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
    }

    /// Delete the given columns for one entity (after server ack)
    pub fn delete_columns(&self, entity_id: i64, columns: &[String]) -> DbResult<usize> {
        let mut deleted = 0;
        for column in columns {
            deleted += self.db.execute(
                &format!(
                    "DELETE FROM {} WHERE entity_id = ?1 AND column_name = ?2",
                    self.kind.outstanding_table()
                ),
                params![entity_id, column],
            )?;
        }
        Ok(deleted)
    }

    /// Drop every pending entry for an entity (entity no longer exists,
    /// or a repair is about to rebuild its log)
    pub fn purge_entity(&self, entity_id: i64) -> DbResult<usize> {
        self.db.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1",
                self.kind.outstanding_table()
            ),
            params![entity_id],
        )
    }

    /// Distinct entity ids with pending entries. Used to rebuild the
    /// volatile queue at process start.
    pub fn pending_entity_ids(&self) -> DbResult<Vec<i64>> {
        self.db.query(
            &format!(
                "SELECT DISTINCT entity_id FROM {} ORDER BY entity_id ASC",
                self.kind.outstanding_table()
            ),
            [],
            |row| row.get(0),
        )
    }

    /// Total pending entries across all entities of this type
    pub fn count(&self) -> DbResult<i64> {
        self.db.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.kind.outstanding_table()),
            [],
            |row| row.get(0),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> OutstandingLog {
        let db = Arc::new(Database::in_memory().unwrap());
        OutstandingLog::new(db, EntityKind::Task)
    }

    #[test]
    fn test_upsert_is_idempotent_per_column() {
        let log = test_log();

        log.upsert(1, "title", "first", 100).unwrap();
        log.upsert(1, "title", "second", 200).unwrap();
        log.upsert(1, "title", "third", 300).unwrap();

        let pending = log.all_pending(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value_string, "third");
        assert_eq!(pending[0].created_at, 300);
    }

    #[test]
    fn test_entries_are_per_entity() {
        let log = test_log();

        log.upsert(1, "title", "a", 100).unwrap();
        log.upsert(2, "title", "b", 100).unwrap();
        log.upsert(2, "notes", "c", 100).unwrap();

        assert_eq!(log.all_pending(1).unwrap().len(), 1);
        assert_eq!(log.all_pending(2).unwrap().len(), 2);
        assert_eq!(log.count().unwrap(), 3);
    }

    #[test]
    fn test_delete_columns_only_removes_named() {
        let log = test_log();

        log.upsert(1, "title", "a", 100).unwrap();
        log.upsert(1, "notes", "b", 100).unwrap();

        let deleted = log.delete_columns(1, &["title".to_string()]).unwrap();
        assert_eq!(deleted, 1);

        let pending = log.all_pending(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].column_name, "notes");
    }

    #[test]
    fn test_pending_entity_ids() {
        let log = test_log();

        log.upsert(3, "title", "x", 100).unwrap();
        log.upsert(1, "title", "y", 100).unwrap();
        log.upsert(3, "notes", "z", 100).unwrap();

        assert_eq!(log.pending_entity_ids().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_ordering_is_by_timestamp() {
        let log = test_log();

        log.upsert(1, "notes", "later", 300).unwrap();
        log.upsert(1, "title", "earlier", 100).unwrap();

        let pending = log.all_pending(1).unwrap();
        assert_eq!(pending[0].column_name, "title");
        assert_eq!(pending[1].column_name, "notes");
    }
}
