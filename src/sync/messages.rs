//! Message Protocol Layer - typed outbound and inbound messages
//!
//! Outbound, the engine speaks in two message types:
//! - ChangesHappened: every pending outstanding entry for one entity,
//!   read from the log at construction time
//! - BriefMe: "send me everything newer than this watermark", used by
//!   background rounds with an empty queue
//!
//! Inbound messages form a tagged union dispatched with an exhaustive
//! match. Unknown type discriminators are logged and skipped so a new
//! server message type never aborts a batch.

use super::api::{ApiError, Transport};
use super::models::AccountContext;
use super::outstanding::OutstandingLog;
use super::rewrite::{RewriteError, SelfIdRewriter};
use crate::db::DbError;
use crate::store::models::{EntityKind, NO_UUID};
use crate::store::{EntityStore, StoreError};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message layer errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rewrite error: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("Transport error: {0}")]
    Transport(#[from] ApiError),
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// One (column, value, timestamp) triple of a ChangesHappened message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub column: String,
    pub value: String,
    pub created_at: i64,
}

/// Client-to-server message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// All pending changes for one entity. A missing uuid tells the
    /// server this is a creation.
    ChangesHappened {
        kind: EntityKind,
        entity_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        uuid: Option<String>,
        changes: Vec<ChangeRecord>,
        /// Log column keys consumed by this message; deleted from the
        /// outstanding table once the server acks the batch. Local
        /// bookkeeping only.
        #[serde(skip)]
        log_columns: Vec<String>,
    },

    /// Catch-up request: everything for this kind newer than pushed_at
    BriefMe { kind: EntityKind, pushed_at: i64 },
}

impl ClientMessage {
    /// Build the ChangesHappened message for one entity from its
    /// outstanding log. Returns Ok(None) when there is nothing to send:
    /// no pending entries, or the entity row no longer exists (its log
    /// is purged, matching the contract that vanished entities stop
    /// sending changes).
    pub fn changes_happened(
        store: &EntityStore,
        log: &OutstandingLog,
        entity_id: i64,
    ) -> Result<Option<ClientMessage>, MessageError> {
        let kind = log.kind();

        let snapshot = match store.snapshot_one(kind, entity_id)? {
            Some(s) => s,
            None => {
                let purged = log.purge_entity(entity_id)?;
                if purged > 0 {
                    log::info!(
                        "Dropped {} outstanding entries for vanished {} {}",
                        purged,
                        kind.as_str(),
                        entity_id
                    );
                }
                return Ok(None);
            }
        };

        let entries = log.all_pending(entity_id)?;
        if entries.is_empty() {
            return Ok(None);
        }

        let mut changes = Vec::with_capacity(entries.len());
        let mut log_columns = Vec::with_capacity(entries.len());
        let mut invalid = Vec::new();

        for entry in entries {
            if !kind.is_outbound_column(&entry.column_name) {
                // A malformed column must never reach an outbound
                // message; drop the entry so it cannot poison retries.
                log::error!(
                    "Outstanding entry for {} {} names unknown column '{}', discarding",
                    kind.as_str(),
                    entity_id,
                    entry.column_name
                );
                invalid.push(entry.column_name);
                continue;
            }

            // Synthetic entries are keyed "base:discriminator" in the
            // log; the wire column is the base name.
            let wire_column = entry
                .column_name
                .split_once(':')
                .map_or(entry.column_name.as_str(), |(base, _)| base)
                .to_string();

            changes.push(ChangeRecord {
                column: wire_column,
                value: entry.value_string,
                created_at: entry.created_at,
            });
            log_columns.push(entry.column_name);
        }

        if !invalid.is_empty() {
            log.delete_columns(entity_id, &invalid)?;
        }
        if changes.is_empty() {
            return Ok(None);
        }

        let uuid = if snapshot.uuid == NO_UUID {
            None
        } else {
            Some(snapshot.uuid)
        };

        Ok(Some(ClientMessage::ChangesHappened {
            kind,
            entity_id,
            uuid,
            changes,
            log_columns,
        }))
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ClientMessage::ChangesHappened { kind, .. } => *kind,
            ClientMessage::BriefMe { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// Inbound Messages
// ============================================================================

/// Server-to-client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An account merge renamed a user id
    UserMigrated {
        prev_user_id: String,
        new_user_id: String,
    },

    /// Backfill the activity table for one entity, page by page
    FetchHistory {
        kind: EntityKind,
        uuid: String,
        modified_after: i64,
        offset: i64,
    },
}

impl ServerMessage {
    /// Map an inbound payload to a message by its type discriminator.
    /// Unknown or malformed payloads are logged and return None - the
    /// caller skips them and continues the batch.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Skipping unrecognized server message ({}): {}", e, value);
                None
            }
        }
    }
}

// ============================================================================
// Inbound Dispatch
// ============================================================================

/// Applies inbound messages locally. Holds everything a message may
/// need - store, account state, rewriter, and the transport for
/// follow-up history fetches.
pub struct MessageProcessor {
    store: EntityStore,
    account: AccountContext,
    transport: Arc<dyn Transport>,
    rewriter: SelfIdRewriter,
}

impl MessageProcessor {
    pub fn new(store: EntityStore, account: AccountContext, transport: Arc<dyn Transport>) -> Self {
        let rewriter = SelfIdRewriter::new(store.database(), account.clone());
        Self {
            store,
            account,
            transport,
            rewriter,
        }
    }

    pub fn rewriter(&self) -> &SelfIdRewriter {
        &self.rewriter
    }

    /// Perform the local effect of one inbound message. Safe to invoke
    /// more than once for the same message.
    pub async fn process(
        &self,
        message: ServerMessage,
        server_time: i64,
    ) -> Result<(), MessageError> {
        match message {
            ServerMessage::UserMigrated {
                prev_user_id,
                new_user_id,
            } => self.apply_user_migrated(&prev_user_id, &new_user_id),
            ServerMessage::FetchHistory {
                kind,
                uuid,
                modified_after,
                offset,
            } => {
                self.apply_fetch_history(kind, &uuid, modified_after, offset, server_time)
                    .await
            }
        }
    }

    fn apply_user_migrated(&self, prev: &str, new: &str) -> Result<(), MessageError> {
        let own = self.account.own_user_id()?;

        match own.as_deref() {
            // Our own account was merged: adopt the new id, then fold
            // every reference to the old one into the self sentinel.
            Some(id) if id == prev => {
                log::info!("Own user id migrated");
                self.account.set_own_user_id(new)?;
                self.rewriter.execute(Some(prev))?;
            }
            // The old id was an alias of us (already rebased): only the
            // leftover references need folding. Re-running is a no-op.
            Some(id) if id == new => {
                self.rewriter.execute(Some(prev))?;
            }
            // First migration this device ever sees: it names us.
            None => {
                self.account.set_own_user_id(new)?;
                self.rewriter.execute(Some(prev))?;
            }
            // Two other users merged; rewrite references between them.
            Some(_) => {
                self.rewriter.rewrite_references(prev, new)?;
            }
        }
        Ok(())
    }

    async fn apply_fetch_history(
        &self,
        kind: EntityKind,
        uuid: &str,
        modified_after: i64,
        start_offset: i64,
        server_time: i64,
    ) -> Result<(), MessageError> {
        let db = self.store.database();
        let mut offset = start_offset;
        let mut inserted = 0usize;

        loop {
            let page = self
                .transport
                .fetch_history_page(kind, uuid, modified_after, offset)
                .await?;

            if page.records.is_empty() {
                break;
            }
            offset += page.records.len() as i64;

            for record in &page.records {
                // Already-seen records are skipped by timestamp; the
                // unique uuid index makes replays harmless.
                if record.created_at <= modified_after {
                    continue;
                }
                inserted += db.execute(
                    r#"
                    INSERT OR IGNORE INTO user_activity
                        (uuid, actor_id, action, message, target_uuid, created_at, deleted_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                    "#,
                    params![
                        record.uuid,
                        record.actor_id,
                        record.action,
                        record.message,
                        record.target_uuid,
                        record.created_at,
                    ],
                )?;
            }

            if !page.has_more {
                break;
            }
        }

        log::info!(
            "History backfill for {} {} inserted {} records (server time {})",
            kind.as_str(),
            uuid,
            inserted,
            server_time
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
