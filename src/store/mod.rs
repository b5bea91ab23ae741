//! Entity Store - persistent tasks, tags, and activity
//!
//! The store owns the only write path for entity rows. Every save:
//! - diffs the synchronizable columns against the prior row state
//! - records one outstanding entry per changed column (unless the
//!   caller passes `suppress_sync = true`)
//! - notifies registered observers with a "did this save log anything"
//!   flag, which is what drives the sync queue
//!
//! Suppression is an explicit parameter on the save calls rather than a
//! process-wide flag, so applying remote changes can never loop back
//! into the outbound log.

pub mod models;

use crate::db::{Database, DbError};
use crate::sync::outstanding::OutstandingLog;
use models::{
    EntityKind, EntitySnapshot, NO_UUID, TagData, TagLink, Task, UserActivity, now_millis,
};
use rusqlite::params;
use std::sync::{Arc, Mutex};

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, i64),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Save Notifications
// ============================================================================

/// Event delivered to observers after every successful save
#[derive(Debug, Clone)]
pub struct SaveEvent {
    pub kind: EntityKind,
    pub entity_id: i64,
    pub uuid: String,
    /// True when this save recorded at least one outstanding entry
    pub changed_synced_columns: bool,
}

/// Observer of entity-store writes (the sync change listener)
pub trait ChangeObserver: Send + Sync {
    fn on_saved(&self, event: &SaveEvent);
}

// ============================================================================
// Entity Store
// ============================================================================

#[derive(Clone)]
pub struct EntityStore {
    db: Arc<Database>,
    observers: Arc<Mutex<Vec<Arc<dyn ChangeObserver>>>>,
}

impl EntityStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Register a save observer. Observers run synchronously on the
    /// writing thread and must be cheap (an enqueue, nothing heavier).
    pub fn add_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    fn notify(&self, event: SaveEvent) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_saved(&event);
        }
    }

    /// Shared tail of every save: diff, log, notify.
    fn finish_save(
        &self,
        kind: EntityKind,
        entity_id: i64,
        uuid: &str,
        prior: Option<Vec<(&'static str, String)>>,
        current: Vec<(&'static str, String)>,
        suppress_sync: bool,
    ) -> StoreResult<bool> {
        let changed: Vec<(&'static str, String)> = match prior {
            // A brand new row: every synchronizable column counts
            None => current,
            Some(old) => current
                .into_iter()
                .filter(|(col, value)| {
                    old.iter()
                        .find(|(c, _)| c == col)
                        .map_or(true, |(_, v)| v != value)
                })
                .collect(),
        };

        let logged = !suppress_sync && !changed.is_empty();
        if logged {
            let log = OutstandingLog::new(self.db.clone(), kind);
            let stamp = now_millis();
            for (column, value) in &changed {
                log.upsert(entity_id, column, value, stamp)?;
            }
            log::debug!(
                "Recorded {} outstanding entries for {} {}",
                changed.len(),
                kind.as_str(),
                entity_id
            );
        }

        self.notify(SaveEvent {
            kind,
            entity_id,
            uuid: uuid.to_string(),
            changed_synced_columns: logged,
        });

        Ok(logged)
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    pub fn save_task(&self, task: &mut Task, suppress_sync: bool) -> StoreResult<i64> {
        match task.id {
            None => {
                if task.created_at == 0 {
                    task.created_at = now_millis();
                }
                let id = self.db.execute_insert(
                    r#"
                    INSERT INTO tasks (
                        uuid, title, notes, importance, due_date, repeat_rule,
                        completed_at, creator_id, assignee_id, waiting_on_id,
                        created_at, deleted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                    params![
                        task.uuid,
                        task.title,
                        task.notes,
                        task.importance,
                        task.due_date,
                        task.repeat_rule,
                        task.completed_at,
                        task.creator_id,
                        task.assignee_id,
                        task.waiting_on_id,
                        task.created_at,
                        task.deleted_at,
                    ],
                )?;
                task.id = Some(id);
                self.finish_save(
                    EntityKind::Task,
                    id,
                    &task.uuid,
                    None,
                    task.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
            Some(id) => {
                let prior = self
                    .fetch_task(id)?
                    .ok_or(StoreError::NotFound("task", id))?;
                self.db.execute(
                    r#"
                    UPDATE tasks
                    SET title = ?1, notes = ?2, importance = ?3, due_date = ?4,
                        repeat_rule = ?5, completed_at = ?6, creator_id = ?7,
                        assignee_id = ?8, waiting_on_id = ?9, deleted_at = ?10
                    WHERE id = ?11
                    "#,
                    params![
                        task.title,
                        task.notes,
                        task.importance,
                        task.due_date,
                        task.repeat_rule,
                        task.completed_at,
                        task.creator_id,
                        task.assignee_id,
                        task.waiting_on_id,
                        task.deleted_at,
                        id,
                    ],
                )?;
                self.finish_save(
                    EntityKind::Task,
                    id,
                    &prior.uuid,
                    Some(prior.synced_values()),
                    task.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
        }
    }

    pub fn fetch_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let mut rows = self.db.query(
            r#"
            SELECT id, uuid, title, notes, importance, due_date, repeat_rule,
                   completed_at, creator_id, assignee_id, waiting_on_id,
                   created_at, deleted_at
            FROM tasks WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(Task {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    title: row.get(2)?,
                    notes: row.get(3)?,
                    importance: row.get(4)?,
                    due_date: row.get(5)?,
                    repeat_rule: row.get(6)?,
                    completed_at: row.get(7)?,
                    creator_id: row.get(8)?,
                    assignee_id: row.get(9)?,
                    waiting_on_id: row.get(10)?,
                    created_at: row.get(11)?,
                    deleted_at: row.get(12)?,
                })
            },
        )?;
        Ok(rows.pop())
    }

    /// Soft delete: stamps deleted_at and goes through the normal save
    /// path so the deletion itself is synced.
    pub fn soft_delete_task(&self, id: i64, suppress_sync: bool) -> StoreResult<()> {
        let mut task = self
            .fetch_task(id)?
            .ok_or(StoreError::NotFound("task", id))?;
        task.deleted_at = now_millis();
        self.save_task(&mut task, suppress_sync)?;
        Ok(())
    }

    // =========================================================================
    // TAGS
    // =========================================================================

    pub fn save_tag(&self, tag: &mut TagData, suppress_sync: bool) -> StoreResult<i64> {
        match tag.id {
            None => {
                if tag.created_at == 0 {
                    tag.created_at = now_millis();
                }
                let id = self.db.execute_insert(
                    r#"
                    INSERT INTO tags (uuid, name, color, owner_id, created_at, deleted_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        tag.uuid,
                        tag.name,
                        tag.color,
                        tag.owner_id,
                        tag.created_at,
                        tag.deleted_at
                    ],
                )?;
                tag.id = Some(id);
                self.finish_save(
                    EntityKind::Tag,
                    id,
                    &tag.uuid,
                    None,
                    tag.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
            Some(id) => {
                let prior = self.fetch_tag(id)?.ok_or(StoreError::NotFound("tag", id))?;
                self.db.execute(
                    r#"
                    UPDATE tags
                    SET name = ?1, color = ?2, owner_id = ?3, deleted_at = ?4
                    WHERE id = ?5
                    "#,
                    params![tag.name, tag.color, tag.owner_id, tag.deleted_at, id],
                )?;
                self.finish_save(
                    EntityKind::Tag,
                    id,
                    &prior.uuid,
                    Some(prior.synced_values()),
                    tag.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
        }
    }

    pub fn fetch_tag(&self, id: i64) -> StoreResult<Option<TagData>> {
        let mut rows = self.db.query(
            r#"
            SELECT id, uuid, name, color, owner_id, created_at, deleted_at
            FROM tags WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(TagData {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    name: row.get(2)?,
                    color: row.get(3)?,
                    owner_id: row.get(4)?,
                    created_at: row.get(5)?,
                    deleted_at: row.get(6)?,
                })
            },
        )?;
        Ok(rows.pop())
    }

    // =========================================================================
    // USER ACTIVITY
    // =========================================================================

    pub fn save_activity(
        &self,
        activity: &mut UserActivity,
        suppress_sync: bool,
    ) -> StoreResult<i64> {
        match activity.id {
            None => {
                if activity.created_at == 0 {
                    activity.created_at = now_millis();
                }
                let id = self.db.execute_insert(
                    r#"
                    INSERT INTO user_activity
                        (uuid, actor_id, action, message, target_uuid, created_at, deleted_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        activity.uuid,
                        activity.actor_id,
                        activity.action,
                        activity.message,
                        activity.target_uuid,
                        activity.created_at,
                        activity.deleted_at,
                    ],
                )?;
                activity.id = Some(id);
                self.finish_save(
                    EntityKind::Activity,
                    id,
                    &activity.uuid,
                    None,
                    activity.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
            Some(id) => {
                let prior = self
                    .fetch_activity(id)?
                    .ok_or(StoreError::NotFound("activity", id))?;
                self.db.execute(
                    r#"
                    UPDATE user_activity
                    SET actor_id = ?1, action = ?2, message = ?3,
                        target_uuid = ?4, deleted_at = ?5
                    WHERE id = ?6
                    "#,
                    params![
                        activity.actor_id,
                        activity.action,
                        activity.message,
                        activity.target_uuid,
                        activity.deleted_at,
                        id,
                    ],
                )?;
                self.finish_save(
                    EntityKind::Activity,
                    id,
                    &prior.uuid,
                    Some(prior.synced_values()),
                    activity.synced_values(),
                    suppress_sync,
                )?;
                Ok(id)
            }
        }
    }

    pub fn fetch_activity(&self, id: i64) -> StoreResult<Option<UserActivity>> {
        let mut rows = self.db.query(
            r#"
            SELECT id, uuid, actor_id, action, message, target_uuid, created_at, deleted_at
            FROM user_activity WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(UserActivity {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    actor_id: row.get(2)?,
                    action: row.get(3)?,
                    message: row.get(4)?,
                    target_uuid: row.get(5)?,
                    created_at: row.get(6)?,
                    deleted_at: row.get(7)?,
                })
            },
        )?;
        Ok(rows.pop())
    }

    // =========================================================================
    // TAG LINKS
    // =========================================================================

    /// Attach a tag to a task. Records a synthetic "tag_added" outstanding
    /// entry keyed by the tag uuid, so re-adding the same tag collapses
    /// into one pending entry.
    pub fn add_tag_link(
        &self,
        task_id: i64,
        tag_uuid: &str,
        suppress_sync: bool,
    ) -> StoreResult<()> {
        let stamp = now_millis();
        self.db.execute(
            r#"
            INSERT INTO task_tag_links (task_id, tag_uuid, created_at, deleted_at)
            VALUES (?1, ?2, ?3, 0)
            ON CONFLICT(task_id, tag_uuid)
            DO UPDATE SET deleted_at = 0, created_at = excluded.created_at
            "#,
            params![task_id, tag_uuid, stamp],
        )?;

        if !suppress_sync {
            let log = OutstandingLog::new(self.db.clone(), EntityKind::Task);
            // An add supersedes any pending removal of the same tag
            log.delete_columns(task_id, &[format!("tag_removed:{}", tag_uuid)])?;
            log.upsert(task_id, &format!("tag_added:{}", tag_uuid), tag_uuid, stamp)?;
        }

        let uuid = self
            .fetch_task(task_id)?
            .map(|t| t.uuid)
            .unwrap_or_else(|| NO_UUID.to_string());
        self.notify(SaveEvent {
            kind: EntityKind::Task,
            entity_id: task_id,
            uuid,
            changed_synced_columns: !suppress_sync,
        });
        Ok(())
    }

    /// Detach a tag from a task (soft-deletes the link row).
    pub fn remove_tag_link(
        &self,
        task_id: i64,
        tag_uuid: &str,
        suppress_sync: bool,
    ) -> StoreResult<()> {
        let stamp = now_millis();
        self.db.execute(
            "UPDATE task_tag_links SET deleted_at = ?1 WHERE task_id = ?2 AND tag_uuid = ?3",
            params![stamp, task_id, tag_uuid],
        )?;

        if !suppress_sync {
            let log = OutstandingLog::new(self.db.clone(), EntityKind::Task);
            log.delete_columns(task_id, &[format!("tag_added:{}", tag_uuid)])?;
            log.upsert(
                task_id,
                &format!("tag_removed:{}", tag_uuid),
                tag_uuid,
                stamp,
            )?;
        }

        let uuid = self
            .fetch_task(task_id)?
            .map(|t| t.uuid)
            .unwrap_or_else(|| NO_UUID.to_string());
        self.notify(SaveEvent {
            kind: EntityKind::Task,
            entity_id: task_id,
            uuid,
            changed_synced_columns: !suppress_sync,
        });
        Ok(())
    }

    /// Live (not soft-deleted) tag links for a task
    pub fn links_for_task(&self, task_id: i64) -> StoreResult<Vec<TagLink>> {
        Ok(self.db.query(
            r#"
            SELECT id, task_id, tag_uuid, created_at, deleted_at
            FROM task_tag_links
            WHERE task_id = ?1 AND deleted_at = 0
            ORDER BY created_at ASC
            "#,
            params![task_id],
            |row| {
                Ok(TagLink {
                    id: Some(row.get(0)?),
                    task_id: row.get(1)?,
                    tag_uuid: row.get(2)?,
                    created_at: row.get(3)?,
                    deleted_at: row.get(4)?,
                })
            },
        )?)
    }

    // =========================================================================
    // GENERIC ACCESS (builder & message construction)
    // =========================================================================

    /// Uniform snapshot of every row of an entity table
    pub fn snapshot(&self, kind: EntityKind) -> StoreResult<Vec<EntitySnapshot>> {
        let snapshots = match kind {
            EntityKind::Task => self
                .all_tasks()?
                .into_iter()
                .map(|t| EntitySnapshot {
                    id: t.id.unwrap_or_default(),
                    uuid: t.uuid.clone(),
                    created_at: t.created_at,
                    deleted_at: t.deleted_at,
                    values: t.synced_values(),
                })
                .collect(),
            EntityKind::Tag => self
                .all_tags()?
                .into_iter()
                .map(|t| EntitySnapshot {
                    id: t.id.unwrap_or_default(),
                    uuid: t.uuid.clone(),
                    created_at: t.created_at,
                    deleted_at: t.deleted_at,
                    values: t.synced_values(),
                })
                .collect(),
            EntityKind::Activity => self
                .all_activity()?
                .into_iter()
                .map(|a| EntitySnapshot {
                    id: a.id.unwrap_or_default(),
                    uuid: a.uuid.clone(),
                    created_at: a.created_at,
                    deleted_at: a.deleted_at,
                    values: a.synced_values(),
                })
                .collect(),
        };
        Ok(snapshots)
    }

    /// Snapshot of one row, None if the row no longer exists
    pub fn snapshot_one(&self, kind: EntityKind, id: i64) -> StoreResult<Option<EntitySnapshot>> {
        let snapshot = match kind {
            EntityKind::Task => self.fetch_task(id)?.map(|t| EntitySnapshot {
                id,
                uuid: t.uuid.clone(),
                created_at: t.created_at,
                deleted_at: t.deleted_at,
                values: t.synced_values(),
            }),
            EntityKind::Tag => self.fetch_tag(id)?.map(|t| EntitySnapshot {
                id,
                uuid: t.uuid.clone(),
                created_at: t.created_at,
                deleted_at: t.deleted_at,
                values: t.synced_values(),
            }),
            EntityKind::Activity => self.fetch_activity(id)?.map(|a| EntitySnapshot {
                id,
                uuid: a.uuid.clone(),
                created_at: a.created_at,
                deleted_at: a.deleted_at,
                values: a.synced_values(),
            }),
        };
        Ok(snapshot)
    }

    /// Assign a global uuid to a row without touching the outstanding
    /// log (uuids are identity, not synced state).
    pub fn set_uuid(&self, kind: EntityKind, id: i64, uuid: &str) -> StoreResult<()> {
        let affected = self.db.execute(
            &format!("UPDATE {} SET uuid = ?1 WHERE id = ?2", kind.table()),
            params![uuid, id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(kind.table(), id));
        }
        Ok(())
    }

    fn all_tasks(&self) -> StoreResult<Vec<Task>> {
        Ok(self.db.query(
            r#"
            SELECT id, uuid, title, notes, importance, due_date, repeat_rule,
                   completed_at, creator_id, assignee_id, waiting_on_id,
                   created_at, deleted_at
            FROM tasks ORDER BY id ASC
            "#,
            [],
            |row| {
                Ok(Task {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    title: row.get(2)?,
                    notes: row.get(3)?,
                    importance: row.get(4)?,
                    due_date: row.get(5)?,
                    repeat_rule: row.get(6)?,
                    completed_at: row.get(7)?,
                    creator_id: row.get(8)?,
                    assignee_id: row.get(9)?,
                    waiting_on_id: row.get(10)?,
                    created_at: row.get(11)?,
                    deleted_at: row.get(12)?,
                })
            },
        )?)
    }

    fn all_tags(&self) -> StoreResult<Vec<TagData>> {
        Ok(self.db.query(
            "SELECT id, uuid, name, color, owner_id, created_at, deleted_at FROM tags ORDER BY id ASC",
            [],
            |row| {
                Ok(TagData {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    name: row.get(2)?,
                    color: row.get(3)?,
                    owner_id: row.get(4)?,
                    created_at: row.get(5)?,
                    deleted_at: row.get(6)?,
                })
            },
        )?)
    }

    fn all_activity(&self) -> StoreResult<Vec<UserActivity>> {
        Ok(self.db.query(
            r#"
            SELECT id, uuid, actor_id, action, message, target_uuid, created_at, deleted_at
            FROM user_activity ORDER BY id ASC
            "#,
            [],
            |row| {
                Ok(UserActivity {
                    id: Some(row.get(0)?),
                    uuid: row.get(1)?,
                    actor_id: row.get(2)?,
                    action: row.get(3)?,
                    message: row.get(4)?,
                    target_uuid: row.get(5)?,
                    created_at: row.get(6)?,
                    deleted_at: row.get(7)?,
                })
            },
        )?)
    }
}

// ============================================================================
// Tests
// ============================================================================
