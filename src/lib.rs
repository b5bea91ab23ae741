//! # Tasknest
//!
//! Offline-first task manager sync engine. Local edits to tasks, tags,
//! and activity are captured as a durable outstanding-entry log and
//! reconciled with a remote sync server by a single background worker.
//!
//! The UI and transport protocol live elsewhere; this crate owns the
//! entity store's save path, the change log, the message protocol, and
//! the reconciliation rules that keep the log consistent.

pub mod db;
pub mod store;
pub mod sync;

pub use db::{Database, DbError};
pub use store::models::{EntityKind, NO_UUID, TagData, Task, USER_ID_SELF, UserActivity};
pub use store::{ChangeObserver, EntityStore, SaveEvent, StoreError};
pub use sync::{
    AccountContext, BackgroundScheduler, ClientMessage, HttpTransport, MessageProcessor,
    OutstandingLog, OutstandingTableBuilder, SelfIdRewriter, ServerMessage, SyncConfig, SyncError,
    SyncState, SyncWorker, TaskTagExtras, Transport,
};
