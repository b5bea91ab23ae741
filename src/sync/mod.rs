//! Sync Module - Offline-First Synchronization Engine
//!
//! Captures local edits as a durable change log, packages them into
//! versioned messages, sends them to the sync server, and applies the
//! messages the server sends back.
//!
//! Architecture:
//! - Outstanding log: one pending entry per changed (entity, column),
//!   deleted only after the server acks the batch carrying it
//! - Change listener: store saves become queued refs; applying remote
//!   changes uses suppressed saves so nothing loops back outbound
//! - Single worker: at most one sync conversation in flight
//! - Builder: rebuilds the whole log from current store state
//! - Rewriter: transactional user-id rebasing on account merges

pub mod api;
pub mod builder;
pub mod listener;
pub mod messages;
pub mod models;
pub mod outstanding;
pub mod rewrite;
pub mod scheduler;
pub mod worker;


// Re-export commonly used types
pub use api::{ApiError, HistoryPage, HistoryRecord, HttpTransport, SyncResponse, Transport};
pub use builder::{BuilderExtras, OutstandingTableBuilder, TaskTagExtras};
pub use listener::{ChangeListener, PendingChange, SyncQueue, rebuild_queue};
pub use messages::{ChangeRecord, ClientMessage, MessageError, MessageProcessor, ServerMessage};
pub use models::{AccountContext, SyncConfig, SyncState};
pub use outstanding::{OutstandingEntry, OutstandingLog};
pub use rewrite::{RewriteError, SelfIdRewriter};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use worker::{RoundSummary, SyncError, SyncWorker};
