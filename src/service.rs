// ABOUTME: SyncService - lifecycle API pairing the SyncLock with one SyncWorker
// ABOUTME: start/status/check_and_update_progress/reset; the lock is released on every terminal outcome

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::connector::Connector;
use crate::error::{SyncError, SyncResult};
use crate::lock::SyncLock;
use crate::worker::{ProgressData, ProgressEvent, ProgressMessage, SyncParams, SyncStatus, SyncWorker};

pub struct SyncService {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    lock: SyncLock,
    lock_held: bool,
    worker: Option<SyncWorker>,
    progress: Option<mpsc::Receiver<ProgressMessage>>,
    last_progress: Option<ProgressData>,
}

impl SyncService {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let lock = SyncLock::new(config.state.lock_file.clone(), config.state.lock_stale_after());
        Self {
            config,
            connector,
            lock,
            lock_held: false,
            worker: None,
            progress: None,
            last_progress: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    /// Start a sync. Returns false, with the reason logged, when it cannot start.
    pub fn start(&mut self, params: SyncParams) -> bool {
        match self.try_start(params) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Sync not started: {}", e);
                false
            }
        }
    }

    /// Like `start`, but reports why a sync could not start.
    pub fn try_start(&mut self, params: SyncParams) -> SyncResult<()> {
        if self.worker.as_ref().is_some_and(|w| w.is_alive()) {
            return Err(SyncError::AlreadyRunning);
        }
        // The previous run ended without anyone draining its progress
        if self.lock_held {
            self.release_lock();
        }
        params.resolve(&self.config)?;

        let acquired = self
            .lock
            .acquire(self.config.state.lock_timeout())
            .map_err(SyncError::State)?;
        if !acquired {
            let holder = self
                .lock
                .lock_info()
                .map(|r| format!("pid {} on {}", r.pid, r.hostname))
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(SyncError::LockContention(holder));
        }
        self.lock_held = true;

        let (tx, rx) = mpsc::channel(self.config.sync.progress_channel_capacity);
        let mut worker = SyncWorker::new(
            self.config.clone(),
            Arc::clone(&self.connector),
            params,
            Some(tx),
        );
        if let Err(e) = worker.start() {
            self.release_lock();
            return Err(e);
        }

        self.worker = Some(worker);
        self.progress = Some(rx);
        self.last_progress = None;
        Ok(())
    }

    /// Current worker status; idle when nothing has been started.
    pub fn status(&self) -> SyncStatus {
        self.worker
            .as_ref()
            .map(|w| w.status())
            .unwrap_or_else(SyncStatus::idle)
    }

    /// Drain pending progress messages and return the newest one.
    ///
    /// Releases the lock once the worker has reached a terminal state.
    pub fn check_and_update_progress(&mut self) -> Option<ProgressMessage> {
        let mut latest = None;
        if let Some(rx) = self.progress.as_mut() {
            while let Ok(message) = rx.try_recv() {
                if let ProgressEvent::Progress(data) = &message.event {
                    self.last_progress = Some(data.clone());
                }
                latest = Some(message);
            }
        }

        if self.lock_held && self.status().state.is_terminal() {
            self.release_lock();
        }
        latest
    }

    /// Most recent progress data seen by `check_and_update_progress`.
    pub fn last_progress(&self) -> Option<&ProgressData> {
        self.last_progress.as_ref()
    }

    /// Block until the current worker exits, then release the lock.
    pub fn wait(&mut self) -> SyncStatus {
        let status = match self.worker.as_mut() {
            Some(worker) => worker.join(),
            None => SyncStatus::idle(),
        };
        if self.lock_held && status.state.is_terminal() {
            self.release_lock();
        }
        status
    }

    /// Stop any worker, release the lock and forget cached progress.
    ///
    /// Blocks while a worker finishes its in-flight batch; the lock is held
    /// until that thread has exited.
    pub fn reset(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            let status = worker.join();
            tracing::debug!("Sync worker exited as {:?} on reset", status.state);
        }
        if self.lock_held {
            self.release_lock();
        }
        self.progress = None;
        self.last_progress = None;
    }

    pub fn pause(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.pause())
    }

    pub fn resume(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.resume())
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.as_ref() {
            worker.stop();
        }
    }

    fn release_lock(&mut self) {
        self.lock.release();
        self.lock_held = false;
        tracing::debug!("Released sync lock {:?}", self.lock.path());
    }
}
