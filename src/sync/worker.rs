//! Sync Worker - the single conversation with the server
//!
//! One worker drains the queue, sends outbound batches, and applies the
//! reply, serialized so at most one sync conversation is ever in
//! flight. The observable state machine is
//! Idle -> Draining -> AwaitingReply -> Applying -> Idle.
//!
//! Failure model: a round either completes (consumed outstanding
//! entries deleted) or fails wholesale (nothing deleted, refs
//! re-queued). Errors never propagate to whoever made the original
//! edit; retries are driven externally by the scheduler.

use super::api::{ApiError, Transport};
use super::listener::{ChangeListener, PendingChange, SyncQueue, rebuild_queue};
use super::messages::{ClientMessage, MessageError, MessageProcessor, ServerMessage};
use super::models::{AccountContext, SyncConfig, SyncState};
use super::outstanding::OutstandingLog;
use crate::db::DbError;
use crate::store::models::ALL_KINDS;
use crate::store::{EntityStore, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Outbound messages per round start here and adapt: double after a
/// successful round, halve after a transport failure.
const INITIAL_BATCH_SIZE: usize = 4;
const MAX_BATCH_SIZE: usize = 32;

/// Debounce after a queue notification, letting bursts of saves finish
/// before the round drains (saving a task with several tags fires a
/// notification per write).
const DRAIN_DEBOUNCE_MS: u64 = 500;

/// Sync error types
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Transport error: {0}")]
    Transport(#[from] ApiError),
}

/// Outcome of one sync round
#[derive(Debug, Clone, Default)]
pub struct RoundSummary {
    /// Outbound messages sent
    pub sent: usize,
    /// Inbound messages applied
    pub applied: usize,
    /// Inbound messages skipped (unknown type)
    pub skipped: usize,
}

/// Background worker owning the sync conversation
pub struct SyncWorker {
    store: EntityStore,
    queue: Arc<SyncQueue>,
    transport: Arc<dyn Transport>,
    account: AccountContext,
    processor: MessageProcessor,
    state: StdMutex<SyncState>,
    /// Serializes rounds; sync_once callers queue behind the worker task
    round: Mutex<()>,
    batch_size: AtomicUsize,
    running: Arc<AtomicBool>,
    task_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Wire the worker into a store: registers the change listener and
    /// rebuilds the volatile queue from the outstanding tables.
    pub fn new(store: EntityStore, transport: Arc<dyn Transport>) -> Result<Arc<Self>, SyncError> {
        let db = store.database();
        let queue = Arc::new(SyncQueue::new());
        let account = AccountContext::new(db.clone());
        let processor = MessageProcessor::new(store.clone(), account.clone(), transport.clone());

        store.add_observer(Arc::new(ChangeListener::new(queue.clone())));
        rebuild_queue(&db, &queue)?;

        Ok(Arc::new(Self {
            store,
            queue,
            transport,
            account,
            processor,
            state: StdMutex::new(SyncState::Idle),
            round: Mutex::new(()),
            batch_size: AtomicUsize::new(INITIAL_BATCH_SIZE),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: StdMutex::new(None),
        }))
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        self.queue.clone()
    }

    pub fn account(&self) -> &AccountContext {
        &self.account
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Current worker state
    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap() = state;
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    /// Run one sync round to completion. `background` rounds with an
    /// empty queue fall back to BriefMe catch-up requests instead of
    /// returning immediately.
    pub async fn sync_once(&self, background: bool) -> Result<RoundSummary, SyncError> {
        let _round = self.round.lock().await;
        let result = self.run_round(background).await;
        self.set_state(SyncState::Idle);
        match &result {
            Ok(summary) => {
                if summary.sent > 0 || summary.applied > 0 {
                    log::info!(
                        "Sync round complete: sent {}, applied {}, skipped {}",
                        summary.sent,
                        summary.applied,
                        summary.skipped
                    );
                }
            }
            Err(e) => log::warn!("Sync round failed, entries retained: {}", e),
        }
        result
    }

    async fn run_round(&self, background: bool) -> Result<RoundSummary, SyncError> {
        self.set_state(SyncState::Draining);

        let batch_size = self.batch_size.load(Ordering::Relaxed);
        let refs = self.queue.drain(batch_size);

        let mut messages = Vec::new();
        for change in &refs {
            let log = OutstandingLog::new(self.store.database(), change.kind);
            match ClientMessage::changes_happened(&self.store, &log, change.entity_id) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => log::error!(
                    "Dropping unbuildable message for {} {}: {}",
                    change.kind.as_str(),
                    change.entity_id,
                    e
                ),
            }
        }

        // Idle background pass: ask for news instead of sending none
        if messages.is_empty() && background {
            for kind in ALL_KINDS {
                messages.push(ClientMessage::BriefMe {
                    kind,
                    pushed_at: self.account.pushed_at(kind)?,
                });
            }
        }

        if messages.is_empty() {
            return Ok(RoundSummary::default());
        }

        self.set_state(SyncState::AwaitingReply);
        log::debug!("Sending {} messages", messages.len());

        let response = match self.transport.send_batch(&messages).await {
            Ok(response) if response.acked => response,
            Ok(_) => return Err(self.round_failed(refs, ApiError::Rejected)),
            Err(e) => return Err(self.round_failed(refs, e)),
        };

        // Acked: consumed entries may now be deleted, and they are
        // deleted before inbound processing can enqueue new work for
        // the same entities.
        let mut round_kinds = HashSet::new();
        for message in &messages {
            round_kinds.insert(message.kind());
            if let ClientMessage::ChangesHappened {
                kind,
                entity_id,
                log_columns,
                ..
            } = message
            {
                let log = OutstandingLog::new(self.store.database(), *kind);
                log.delete_columns(*entity_id, log_columns)?;
            }
        }

        for kind in round_kinds {
            if response.server_time > self.account.pushed_at(kind)? {
                self.account.set_pushed_at(kind, response.server_time)?;
            }
        }

        let next = batch_size.saturating_mul(2).clamp(1, MAX_BATCH_SIZE);
        self.batch_size.store(next, Ordering::Relaxed);

        self.set_state(SyncState::Applying);
        let mut summary = RoundSummary {
            sent: messages.len(),
            ..Default::default()
        };

        // Server messages apply strictly in the order received; history
        // pagination depends on it.
        for raw in &response.messages {
            match ServerMessage::from_json(raw) {
                None => summary.skipped += 1,
                Some(message) => {
                    match self.processor.process(message, response.server_time).await {
                        Ok(()) => summary.applied += 1,
                        // A failed message is logged and the batch
                        // continues; processing is idempotent, so the
                        // server may simply resend it.
                        Err(e) => log::error!("Failed to apply server message: {}", e),
                    }
                }
            }
        }

        let db = self.store.database();
        let mut config = SyncConfig::load(&db)?;
        config.last_sync_at = Some(chrono::Utc::now());
        config.save(&db)?;

        Ok(summary)
    }

    /// Transport failure: nothing is deleted, refs go back to the front
    /// of the queue, and the next round sends a smaller batch.
    fn round_failed(&self, refs: Vec<PendingChange>, error: ApiError) -> SyncError {
        let current = self.batch_size.load(Ordering::Relaxed);
        self.batch_size.store((current / 2).max(1), Ordering::Relaxed);
        self.queue.requeue_front(refs);
        SyncError::Transport(error)
    }

    // =========================================================================
    // Background Task
    // =========================================================================

    /// Spawn the drain loop. Each queue notification triggers a round;
    /// a short debounce lets multi-write edits settle first.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Sync worker already running");
            return;
        }

        let worker = self.clone();
        let handle = tokio::spawn(async move {
            log::info!("Sync worker started");
            while worker.running.load(Ordering::SeqCst) {
                worker.queue.notified().await;
                if !worker.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(DRAIN_DEBOUNCE_MS)).await;

                // Drain until the queue is empty; each pass is one
                // bounded batch.
                while !worker.queue.is_empty() {
                    if worker.sync_once(false).await.is_err() {
                        // Retry belongs to the scheduler, not a tight loop
                        break;
                    }
                }
            }
            log::info!("Sync worker stopped");
        });

        *self.task_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the drain loop. Aborting mid-round is safe: outstanding
    /// entries are only deleted after an ack, and an entry resent after
    /// an ack-then-abort race is idempotent on the server because every
    /// message restates the column's full value.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.wake();
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn batch_size_for_tests(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }
}
