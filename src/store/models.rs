//! Entity Models - Synchronizable Records
//!
//! Defines the task, tag, and activity entities plus the static
//! per-entity-type schema the sync engine validates against:
//! - which table and outstanding-log table back the type
//! - which columns are synchronizable
//! - which synthetic columns may appear in the log
//! - which columns hold user references (rebased on account merge)

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Placeholder uuid for entities that have never been synced.
pub const NO_UUID: &str = "0";

/// Sentinel stored in user-reference columns meaning "this device's own
/// user". Keeps "is this me" checks a plain string compare.
pub const USER_ID_SELF: &str = "0";

/// Millisecond wall-clock timestamp used for entity and log stamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Entity Kind & Column Schemas
// ============================================================================

/// Entity type tag carried by outstanding entries and sync messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Tag,
    Activity,
}

pub const ALL_KINDS: [EntityKind; 3] = [EntityKind::Task, EntityKind::Tag, EntityKind::Activity];

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Tag => "tag",
            Self::Activity => "activity",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "tag" => Some(Self::Tag),
            "activity" => Some(Self::Activity),
            _ => None,
        }
    }

    /// Entity table backing this type
    pub fn table(&self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Tag => "tags",
            Self::Activity => "user_activity",
        }
    }

    /// Outstanding-entry log table for this type
    pub fn outstanding_table(&self) -> &'static str {
        match self {
            Self::Task => "task_outstanding",
            Self::Tag => "tag_outstanding",
            Self::Activity => "activity_outstanding",
        }
    }

    /// Columns whose changes are recorded in the outstanding log
    pub fn synced_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Task => &[
                "title",
                "notes",
                "importance",
                "due_date",
                "repeat_rule",
                "completed_at",
                "creator_id",
                "assignee_id",
                "waiting_on_id",
                "deleted_at",
            ],
            Self::Tag => &["name", "color", "owner_id", "deleted_at"],
            Self::Activity => &["actor_id", "action", "message", "target_uuid", "deleted_at"],
        }
    }

    /// Synthetic column bases: log entries derived from related tables
    /// rather than from a real column of the entity row
    pub fn synthetic_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Task => &["tag_added", "tag_removed"],
            Self::Tag | Self::Activity => &[],
        }
    }

    /// True if `column` may appear in an outbound message for this type.
    /// Synthetic entries are keyed as "base:discriminator" in the log so
    /// the one-entry-per-column rule still holds per related row.
    pub fn is_outbound_column(&self, column: &str) -> bool {
        let base = column.split_once(':').map_or(column, |(b, _)| b);
        self.synced_columns().contains(&base) || self.synthetic_columns().contains(&base)
    }
}

/// (table, user-reference columns) pairs the Self-Id Rewriter touches.
/// Every column listed here stores a global user id or the self sentinel.
pub const USER_REFERENCE_COLUMNS: [(&str, &[&str]); 3] = [
    ("tasks", &["creator_id", "assignee_id", "waiting_on_id"]),
    ("tags", &["owner_id"]),
    ("user_activity", &["actor_id"]),
];

// ============================================================================
// Entity Records
// ============================================================================

/// A task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<i64>,
    pub uuid: String,
    pub title: String,
    pub notes: String,
    pub importance: i64,
    pub due_date: i64,
    pub repeat_rule: String,
    pub completed_at: i64,
    pub creator_id: String,
    pub assignee_id: String,
    pub waiting_on_id: String,
    pub created_at: i64,
    pub deleted_at: i64,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            uuid: NO_UUID.to_string(),
            title: title.into(),
            notes: String::new(),
            importance: 0,
            due_date: 0,
            repeat_rule: String::new(),
            completed_at: 0,
            creator_id: USER_ID_SELF.to_string(),
            assignee_id: USER_ID_SELF.to_string(),
            waiting_on_id: USER_ID_SELF.to_string(),
            created_at: 0,
            deleted_at: 0,
        }
    }

    /// Serialized snapshot of every synchronizable column, in schema order
    pub fn synced_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("title", self.title.clone()),
            ("notes", self.notes.clone()),
            ("importance", self.importance.to_string()),
            ("due_date", self.due_date.to_string()),
            ("repeat_rule", self.repeat_rule.clone()),
            ("completed_at", self.completed_at.to_string()),
            ("creator_id", self.creator_id.clone()),
            ("assignee_id", self.assignee_id.clone()),
            ("waiting_on_id", self.waiting_on_id.clone()),
            ("deleted_at", self.deleted_at.to_string()),
        ]
    }
}

/// A tag row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagData {
    pub id: Option<i64>,
    pub uuid: String,
    pub name: String,
    pub color: i64,
    pub owner_id: String,
    pub created_at: i64,
    pub deleted_at: i64,
}

impl TagData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            uuid: NO_UUID.to_string(),
            name: name.into(),
            color: 0,
            owner_id: USER_ID_SELF.to_string(),
            created_at: 0,
            deleted_at: 0,
        }
    }

    pub fn synced_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("color", self.color.to_string()),
            ("owner_id", self.owner_id.clone()),
            ("deleted_at", self.deleted_at.to_string()),
        ]
    }
}

/// A user-activity row. Doubles as the history table filled by
/// Fetch-History backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub id: Option<i64>,
    pub uuid: String,
    pub actor_id: String,
    pub action: String,
    pub message: String,
    pub target_uuid: String,
    pub created_at: i64,
    pub deleted_at: i64,
}

impl UserActivity {
    pub fn new(action: impl Into<String>, target_uuid: impl Into<String>) -> Self {
        Self {
            id: None,
            uuid: NO_UUID.to_string(),
            actor_id: USER_ID_SELF.to_string(),
            action: action.into(),
            message: String::new(),
            target_uuid: target_uuid.into(),
            created_at: 0,
            deleted_at: 0,
        }
    }

    pub fn synced_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("actor_id", self.actor_id.clone()),
            ("action", self.action.clone()),
            ("message", self.message.clone()),
            ("target_uuid", self.target_uuid.clone()),
            ("deleted_at", self.deleted_at.to_string()),
        ]
    }
}

/// Task-to-tag membership link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagLink {
    pub id: Option<i64>,
    pub task_id: i64,
    pub tag_uuid: String,
    pub created_at: i64,
    pub deleted_at: i64,
}

/// Uniform snapshot of one entity row, used by the builder and by
/// message construction (id, uuid, creation stamp, serialized columns).
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub id: i64,
    pub uuid: String,
    pub created_at: i64,
    pub deleted_at: i64,
    pub values: Vec<(&'static str, String)>,
}

// ============================================================================
// Tests
// ============================================================================
