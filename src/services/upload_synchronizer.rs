//! src/services/upload_synchronizer.rs
//!
//! UploadSynchronizer drains the `ChunkStore` towards the server.
//!
//! One cycle takes a small batch of queued chunk ids, delivers them
//! concurrently, removes the acknowledged ones and settles per-token outcomes
//! (completion, terminal rejection). A whole batch failing marks the network
//! down until a later batch gets a chunk through. A sibling loop reports
//! aggregate progress to the host on a fixed cadence.

use crate::models::events::{UploadEvent, UploadState};
use crate::services::{
    chunk_store::{ChunkStore, StoreResult},
    transport::ChunkTransport,
};
use futures::future::join_all;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Chunks in flight per cycle.
    pub batch_size: usize,

    /// Pause after an idle or failed cycle.
    pub idle_interval: Duration,

    /// Cadence of progress reports.
    pub progress_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Flags shared between the synchronizer loops and their controller.
#[derive(Debug, Default)]
pub struct SyncState {
    net_down: AtomicBool,
    cancel: AtomicBool,
    wake: Notify,
}

impl SyncState {
    pub fn is_net_down(&self) -> bool {
        self.net_down.load(Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stop sending queued chunks until the store has been emptied.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Cut the current idle pause short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Tally of one synchronization cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleOutcome {
    pub attempted: usize,
    pub accepted: usize,
    pub failed: usize,
    pub rejected: usize,

    /// Tokens whose every chunk has now been acknowledged.
    pub completed: Vec<String>,

    /// Tokens dropped after a terminal rejection.
    pub dropped: Vec<String>,

    /// The store held no chunks once the cycle settled.
    pub drained: bool,
}

impl CycleOutcome {
    /// Pause before the next cycle unless progress was made and work remains.
    pub fn should_pause(&self) -> bool {
        self.accepted == 0 || self.drained
    }
}

enum Delivery {
    Accepted,
    Rejected { token: String, reason: String },
    Failed,
    /// Removed from the store while the batch was being assembled.
    Gone,
}

pub struct UploadSynchronizer<T> {
    store: ChunkStore,
    transport: Arc<T>,
    config: SyncConfig,
    state: Arc<SyncState>,
    events: UnboundedSender<UploadEvent>,
    cycle: Arc<AsyncMutex<()>>,
}

impl<T> Clone for UploadSynchronizer<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            cycle: self.cycle.clone(),
        }
    }
}

impl<T: ChunkTransport> UploadSynchronizer<T> {
    pub fn new(
        store: ChunkStore,
        transport: Arc<T>,
        config: SyncConfig,
        events: UnboundedSender<UploadEvent>,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            state: Arc::new(SyncState::default()),
            events,
            cycle: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn state(&self) -> Arc<SyncState> {
        self.state.clone()
    }

    /// Run one delivery cycle. Concurrent callers wait for the running cycle.
    pub async fn sync_once(&self) -> StoreResult<CycleOutcome> {
        let _running = self.cycle.lock().await;

        let mut ids = self.store.chunk_ids(self.config.batch_size).await?;
        let mut seen = BTreeSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        let cancelled = self.state.is_cancel_requested();
        if cancelled {
            ids.clear();
        }

        let deliveries = join_all(ids.iter().map(|id| self.deliver(id))).await;

        let mut outcome = CycleOutcome {
            attempted: ids.len(),
            ..CycleOutcome::default()
        };
        let mut rejected_tokens = BTreeMap::new();
        for delivery in deliveries {
            match delivery {
                Ok(Delivery::Accepted) => outcome.accepted += 1,
                Ok(Delivery::Rejected { token, reason }) => {
                    outcome.rejected += 1;
                    rejected_tokens.entry(token).or_insert(reason);
                }
                Ok(Delivery::Failed) => outcome.failed += 1,
                Ok(Delivery::Gone) => {}
                Err(err) => {
                    warn!("chunk delivery bookkeeping failed: {}", err);
                    outcome.failed += 1;
                }
            }
        }

        if outcome.accepted > 0 || outcome.rejected > 0 {
            if self.state.net_down.swap(false, Ordering::SeqCst) {
                info!("upload endpoint reachable again");
            }
        } else if outcome.failed > 0 && !cancelled {
            if !self.state.net_down.swap(true, Ordering::SeqCst) {
                warn!(failed = outcome.failed, "whole batch failed, marking network down");
            }
            self.emit(UploadEvent::State(UploadState::Disconnected));
        }

        for (token, reason) in rejected_tokens {
            let removed = self.store.remove_token_chunks(&token).await?;
            if let Some(record) = self.store.remove_token(&token).await? {
                warn!(token = %token, removed, "upload rejected by server: {}", reason);
                self.emit(UploadEvent::UploadFailed { record, reason });
            }
            outcome.dropped.push(token);
        }

        // Tokens still being sliced stay open even when their queue is empty.
        for record in self.store.take_completed().await? {
            info!(token = %record.token, filename = %record.filename, "upload complete");
            outcome.completed.push(record.token.clone());
            self.emit(UploadEvent::UploadDone(record));
        }

        outcome.drained = self.store.is_empty().await?;
        if outcome.drained && self.state.cancel.swap(false, Ordering::SeqCst) {
            debug!("queue drained, cancellation cleared");
        }

        Ok(outcome)
    }

    async fn deliver(&self, id: &str) -> StoreResult<Delivery> {
        let Some(chunk) = self.store.get(id).await? else {
            return Ok(Delivery::Gone);
        };

        match self.transport.send(&chunk).await {
            Ok(receipt) => {
                self.store.remove(id).await?;
                debug!(
                    id,
                    duplicate = receipt.duplicate,
                    done = receipt.done,
                    "chunk acknowledged"
                );
                Ok(Delivery::Accepted)
            }
            Err(err) if err.is_terminal() => Ok(Delivery::Rejected {
                token: chunk.token,
                reason: err.to_string(),
            }),
            Err(err) => {
                debug!(id, attempts = chunk.fail_count + 1, "chunk delivery failed: {}", err);
                self.store.inc_fail(id).await?;
                Ok(Delivery::Failed)
            }
        }
    }

    /// Deliver chunks until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(batch_size = self.config.batch_size, "synchronizer started");
        loop {
            let pause = match self.sync_once().await {
                Ok(outcome) => outcome.should_pause(),
                Err(err) => {
                    warn!("synchronization cycle failed: {}", err);
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.state.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                }
            } else if shutdown.is_cancelled() {
                break;
            }
        }
        info!("synchronizer stopped");
    }

    /// Current aggregate state, `None` while the network is marked down.
    pub async fn progress_state(&self) -> StoreResult<Option<UploadState>> {
        if self.state.is_net_down() {
            return Ok(None);
        }
        if self.store.is_empty().await? {
            return Ok(Some(UploadState::None));
        }
        let progress = self.store.get_progress().await?;
        if progress.is_empty() {
            return Ok(Some(UploadState::Preparation));
        }
        Ok(Some(UploadState::Progress(progress)))
    }

    /// Emit `progress_state` every `progress_interval` until `shutdown` fires.
    pub async fn report_progress(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.progress_state().await {
                Ok(Some(state)) => self.emit(UploadEvent::State(state)),
                Ok(None) => {}
                Err(err) => warn!("progress report failed: {}", err),
            }
        }
    }

    fn emit(&self, event: UploadEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
