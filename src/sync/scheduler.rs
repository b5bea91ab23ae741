//! Background Sync Scheduler
//!
//! Periodic trigger for the sync worker. Failed rounds are not retried
//! here in a tight loop - the next tick (or the next local edit) picks
//! the pending entries up again.

use super::worker::SyncWorker;
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background scheduler for automatic sync rounds
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .db
            .get_setting("scheduler_config")
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting("scheduler_config", &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self, worker: Arc<SyncWorker>) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_minutes = self.config.read().await.interval_minutes;
        if interval_minutes < 1 || interval_minutes > 1440 {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be 1-1440 minutes, got {}",
                interval_minutes
            )));
        }

        self.running.store(true, Ordering::Relaxed);

        let running_clone = self.running.clone();
        let db_clone = self.db.clone();
        let config_clone = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running_clone, db_clone, config_clone, worker).await;
        });

        *self.task_handle.lock().unwrap() = Some(handle);

        log::info!(
            "Background scheduler started (interval: {} minutes)",
            interval_minutes
        );
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        worker: Arc<SyncWorker>,
    ) -> Result<(), SchedulerError> {
        if interval_minutes < 1 || interval_minutes > 1440 {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be 1-1440 minutes, got {}",
                interval_minutes
            )));
        }

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        let was_running = self.is_running();
        if was_running {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start(worker).await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        worker: Arc<SyncWorker>,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(60 * interval_minutes));
        // The first tick completes immediately; consume it so rounds
        // only run at interval boundaries.
        interval.tick().await;

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            interval.tick().await;

            if !running.load(Ordering::Relaxed) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::info!("Background sync triggered by scheduler");

            match worker.sync_once(true).await {
                Ok(summary) => {
                    log::info!(
                        "Background sync completed: sent={}, applied={}, skipped={}",
                        summary.sent,
                        summary.applied,
                        summary.skipped
                    );

                    let mut cfg = config.write().await;
                    cfg.last_run = Some(Utc::now().to_rfc3339());
                    drop(cfg);

                    if let Err(e) = db.set_setting("scheduler_config", &*config.read().await) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                Err(e) => {
                    // Outstanding entries survive the failure; the next
                    // tick resends them
                    log::error!("Background sync failed: {:?}", e);
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
