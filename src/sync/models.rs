//! Sync Models - Configuration & Account Context
//!
//! Small settings-backed values shared across the engine:
//! - SyncConfig: device identity and background-sync settings
//! - AccountContext: the device's own global user id and the per-kind
//!   "pushed at" watermarks used by BriefMe catch-up requests
//! - SyncState: observable worker state

use crate::db::{Database, DbResult};
use crate::store::models::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SETTING_SYNC_CONFIG: &str = "sync_config";
const SETTING_OWN_USER_ID: &str = "own_user_id";

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration and state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether sync is enabled
    pub enabled: bool,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name (e.g., "Workstation", "Laptop")
    pub device_name: String,

    /// Last successful sync timestamp
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Background sync interval in minutes (0 = manual only)
    pub sync_interval_minutes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            last_sync_at: None,
            sync_interval_minutes: 30,
        }
    }
}

impl SyncConfig {
    /// Load from the settings table, creating (and persisting) a default
    /// config with a fresh device id on first run.
    pub fn load(db: &Database) -> DbResult<Self> {
        if let Some(config) = db.get_setting::<SyncConfig>(SETTING_SYNC_CONFIG)? {
            return Ok(config);
        }
        let config = SyncConfig::default();
        db.set_setting(SETTING_SYNC_CONFIG, &config)?;
        Ok(config)
    }

    pub fn save(&self, db: &Database) -> DbResult<()> {
        db.set_setting(SETTING_SYNC_CONFIG, self)
    }
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Tasknest Device".to_string())
}

// ============================================================================
// Account Context
// ============================================================================

/// Settings-backed account state, passed explicitly to the components
/// that need it (message processor, self-id rewriter).
#[derive(Clone)]
pub struct AccountContext {
    db: Arc<Database>,
}

impl AccountContext {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The device's own global user id, None until first assigned
    pub fn own_user_id(&self) -> DbResult<Option<String>> {
        self.db.get_setting(SETTING_OWN_USER_ID)
    }

    pub fn set_own_user_id(&self, user_id: &str) -> DbResult<()> {
        self.db.set_setting(SETTING_OWN_USER_ID, &user_id)
    }

    /// Millisecond watermark of the newest server state this device has
    /// seen for one entity kind. Zero until the first acked round.
    pub fn pushed_at(&self, kind: EntityKind) -> DbResult<i64> {
        Ok(self
            .db
            .get_setting::<i64>(&format!("pushed_at_{}", kind.as_str()))?
            .unwrap_or(0))
    }

    pub fn set_pushed_at(&self, kind: EntityKind, stamp: i64) -> DbResult<()> {
        self.db
            .set_setting(&format!("pushed_at_{}", kind.as_str()), &stamp)
    }
}

// ============================================================================
// Worker State
// ============================================================================

/// Observable sync-worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Draining,
    AwaitingReply,
    Applying,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Draining => "draining",
            SyncState::AwaitingReply => "awaiting_reply",
            SyncState::Applying => "applying",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
