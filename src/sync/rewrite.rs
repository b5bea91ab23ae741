//! Self-Id Rewriter - transactional user-id rebasing
//!
//! When an account merge renames a user id, every user-reference column
//! in every entity table must move to the new id - and references to
//! the device's own user fold into the self sentinel so "is this me"
//! stays a plain string compare.
//!
//! The whole multi-table rewrite runs in a single SQLite transaction:
//! either every table is rebased or none is. A half-rebased reference
//! set would silently corrupt self checks, so a failed attempt rolls
//! back and may simply be retried. Writes bypass the store's save path,
//! which is what keeps a million-row rebase from enqueuing a million
//! outbound messages.

use super::models::AccountContext;
use crate::db::{Database, DbError};
use crate::store::models::{USER_ID_SELF, USER_REFERENCE_COLUMNS};
use rusqlite::params;
use std::sync::{Arc, Mutex};

/// Rewrite error types
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("No own user id available to rewrite")]
    NoOwnId,
}

/// Rewrites user-id references across all entity tables
#[derive(Clone)]
pub struct SelfIdRewriter {
    db: Arc<Database>,
    account: AccountContext,
    /// One rewrite in flight process-wide
    guard: Arc<Mutex<()>>,
}

impl SelfIdRewriter {
    pub fn new(db: Arc<Database>, account: AccountContext) -> Self {
        Self {
            db,
            account,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Fold every reference to `old_id` into the self sentinel. The
    /// no-argument form resolves the device's own stored id first,
    /// covering the bootstrap case where real ids were written before
    /// any sentinel existed. Returns the number of rewritten rows.
    pub fn execute(&self, old_id: Option<&str>) -> Result<usize, RewriteError> {
        let old = match old_id {
            Some(id) => id.to_string(),
            None => self.account.own_user_id()?.ok_or(RewriteError::NoOwnId)?,
        };
        self.rewrite(&old, USER_ID_SELF)
    }

    /// Rewrite references from one real id to another (merges between
    /// two users that are not this device's own)
    pub fn rewrite_references(&self, old_id: &str, new_id: &str) -> Result<usize, RewriteError> {
        self.rewrite(old_id, new_id)
    }

    fn rewrite(&self, old_id: &str, new_id: &str) -> Result<usize, RewriteError> {
        if old_id == new_id {
            return Ok(0);
        }

        let _in_flight = self.guard.lock().unwrap();

        let rewritten = self.db.with_transaction(|tx| {
            let mut rewritten = 0;
            for (table, columns) in USER_REFERENCE_COLUMNS {
                for column in columns {
                    rewritten += tx.execute(
                        &format!(
                            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                            table, column, column
                        ),
                        params![new_id, old_id],
                    )?;
                }
            }
            Ok(rewritten)
        })?;

        log::info!(
            "Rewrote {} user references from '{}' to '{}'",
            rewritten,
            old_id,
            new_id
        );
        Ok(rewritten)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use crate::store::models::{EntityKind, TagData, Task, UserActivity};
    use crate::sync::outstanding::OutstandingLog;

    fn setup() -> (EntityStore, SelfIdRewriter) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = EntityStore::new(db.clone());
        let account = AccountContext::new(db.clone());
        (store, SelfIdRewriter::new(db, account))
    }

    fn seed(store: &EntityStore, user: &str) {
        let mut task = Task::new("review draft");
        task.creator_id = user.to_string();
        task.assignee_id = "u-other".to_string();
        task.waiting_on_id = user.to_string();
        store.save_task(&mut task, false).unwrap();

        let mut tag = TagData::new("work");
        tag.owner_id = user.to_string();
        store.save_tag(&mut tag, false).unwrap();

        let mut activity = UserActivity::new("task_created", "t-1");
        activity.actor_id = user.to_string();
        store.save_activity(&mut activity, false).unwrap();
    }

    fn count_references(store: &EntityStore, user: &str) -> i64 {
        let db = store.database();
        let mut total = 0;
        for (table, columns) in USER_REFERENCE_COLUMNS {
            for column in columns {
                total += db
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {} WHERE {} = ?1", table, column),
                        params![user],
                        |row| row.get::<_, i64>(0),
                    )
                    .unwrap();
            }
        }
        total
    }

    #[test]
    fn test_execute_rewrites_every_table() {
        let (store, rewriter) = setup();
        seed(&store, "u-1");
        assert_eq!(count_references(&store, "u-1"), 4);

        let rewritten = rewriter.execute(Some("u-1")).unwrap();
        assert_eq!(rewritten, 4);
        assert_eq!(count_references(&store, "u-1"), 0);
        assert_eq!(count_references(&store, "u-other"), 1);

        // Idempotent: nothing left to rewrite
        assert_eq!(rewriter.execute(Some("u-1")).unwrap(), 0);
    }

    #[test]
    fn test_rewrite_generates_no_outstanding_entries() {
        let (store, rewriter) = setup();
        seed(&store, "u-1");

        // Clear everything the seed writes logged
        for kind in [EntityKind::Task, EntityKind::Tag, EntityKind::Activity] {
            let log = OutstandingLog::new(store.database(), kind);
            for id in log.pending_entity_ids().unwrap() {
                log.purge_entity(id).unwrap();
            }
        }

        rewriter.execute(Some("u-1")).unwrap();

        for kind in [EntityKind::Task, EntityKind::Tag, EntityKind::Activity] {
            let log = OutstandingLog::new(store.database(), kind);
            assert_eq!(log.count().unwrap(), 0, "{} log must stay empty", kind.as_str());
        }
    }

    #[test]
    fn test_execute_without_argument_uses_own_id() {
        let (store, rewriter) = setup();
        seed(&store, "u-9");

        // Bootstrap: no stored own id yet
        assert!(matches!(rewriter.execute(None), Err(RewriteError::NoOwnId)));

        rewriter.account.set_own_user_id("u-9").unwrap();
        let rewritten = rewriter.execute(None).unwrap();
        assert_eq!(rewritten, 4);
        assert_eq!(count_references(&store, "u-9"), 0);
    }

    #[test]
    fn test_rewrite_between_other_users() {
        let (store, rewriter) = setup();
        seed(&store, "u-1");

        let rewritten = rewriter.rewrite_references("u-other", "u-merged").unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(count_references(&store, "u-other"), 0);
        assert_eq!(count_references(&store, "u-merged"), 1);
        // Untouched columns keep their ids
        assert_eq!(count_references(&store, "u-1"), 4);
    }

    #[test]
    fn test_same_id_is_a_noop() {
        let (store, rewriter) = setup();
        seed(&store, "u-1");
        assert_eq!(rewriter.rewrite_references("u-1", "u-1").unwrap(), 0);
        assert_eq!(count_references(&store, "u-1"), 4);
    }
}
