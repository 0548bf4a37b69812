//! Host-facing handle that wires the store, the slicer and the synchronizer.
//!
//! `Uploader::start` spawns three tasks: the synchronizer loop, the progress
//! reporter and a control loop that owns the producers. The host talks to the
//! control loop through `Control` commands and listens on the returned event
//! receiver.

use crate::models::{
    chunk::{DEFAULT_CHUNK_SIZE, TokenRecord},
    events::UploadEvent,
};
use crate::services::{
    chunk_store::ChunkStore,
    slice_producer::{SliceProducer, SliceRequest},
    transport::{ChunkTransport, HttpTransport},
    upload_synchronizer::{SyncConfig, SyncState, UploadSynchronizer},
};
use chrono::Utc;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UploaderError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("uploader has shut down")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct UploaderConfig {
    pub chunk_size: usize,
    pub sync: SyncConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync: SyncConfig::default(),
        }
    }
}

/// Commands accepted by the control loop.
#[derive(Debug)]
pub enum Control {
    Upload(SliceRequest),
    /// Stop slicing, stop sending and forget every queued upload.
    Cancel,
    SetChunkSize(usize),
}

pub struct Uploader<T> {
    store: ChunkStore,
    transport: Arc<T>,
    state: Arc<SyncState>,
    control: UnboundedSender<Control>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: ChunkTransport> Uploader<T> {
    /// Spawn the workers on the current runtime.
    pub fn start(
        store: ChunkStore,
        transport: T,
        config: UploaderConfig,
    ) -> (Self, UnboundedReceiver<UploadEvent>) {
        let transport = Arc::new(transport);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let sync = UploadSynchronizer::new(
            store.clone(),
            transport.clone(),
            config.sync.clone(),
            event_tx.clone(),
        );
        let state = sync.state();

        let control_loop = ControlLoop {
            store: store.clone(),
            state: state.clone(),
            events: event_tx,
            chunk_size: config.chunk_size,
            generation: shutdown.child_token(),
            producers: JoinSet::new(),
        };

        let tasks = vec![
            tokio::spawn(sync.clone().run(shutdown.clone())),
            tokio::spawn(sync.report_progress(shutdown.clone())),
            tokio::spawn(control_loop.run(control_rx, shutdown.clone())),
        ];
        info!(chunk_size = config.chunk_size, "uploader started");

        (
            Self {
                store,
                transport,
                state,
                control: control_tx,
                shutdown,
                tasks,
            },
            event_rx,
        )
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue `request` for slicing; chunks start flowing as they are stored.
    pub fn upload_file(&self, request: SliceRequest) -> Result<(), UploaderError> {
        self.send(Control::Upload(request))
    }

    pub fn cancel(&self) -> Result<(), UploaderError> {
        self.send(Control::Cancel)
    }

    /// Chunk size for files submitted from now on.
    pub fn set_chunk_size(&self, chunk_size: usize) -> Result<(), UploaderError> {
        if chunk_size == 0 {
            return Err(UploaderError::InvalidChunkSize);
        }
        self.send(Control::SetChunkSize(chunk_size))
    }

    fn send(&self, command: Control) -> Result<(), UploaderError> {
        self.control
            .send(command)
            .map_err(|_| UploaderError::Closed)
    }

    /// Stop every worker and wait for them to exit. Queued chunks stay stored.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.state.wake();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("uploader task ended abnormally: {}", err);
            }
        }
        info!("uploader stopped");
    }
}

impl Uploader<HttpTransport> {
    pub fn set_endpoint(&self, endpoint: Url) {
        info!(%endpoint, "upload endpoint changed");
        self.transport.set_endpoint(endpoint);
        self.state.wake();
    }
}

struct ControlLoop {
    store: ChunkStore,
    state: Arc<SyncState>,
    events: UnboundedSender<UploadEvent>,
    chunk_size: usize,

    /// Cancelled on `Control::Cancel` and replaced for later producers.
    generation: CancellationToken,

    producers: JoinSet<()>,
}

impl ControlLoop {
    async fn run(mut self, mut control: UnboundedReceiver<Control>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = control.recv() => match command {
                    Some(command) => self.handle(command, &shutdown).await,
                    None => break,
                },
                Some(joined) = self.producers.join_next(), if !self.producers.is_empty() => {
                    if let Err(err) = joined {
                        warn!("producer task ended abnormally: {}", err);
                    }
                }
            }
        }

        self.generation.cancel();
        while self.producers.join_next().await.is_some() {}
        debug!("control loop stopped");
    }

    async fn handle(&mut self, command: Control, shutdown: &CancellationToken) {
        match command {
            Control::Upload(request) => {
                let producer =
                    SliceProducer::new(self.store.clone(), self.chunk_size, self.events.clone());
                let cancel = self.generation.clone();
                let store = self.store.clone();
                let events = self.events.clone();
                let state = self.state.clone();
                self.producers.spawn(async move {
                    match producer.slice(&request, &cancel).await {
                        Ok(report) => {
                            info!(
                                token = %report.token,
                                enqueued = report.enqueued,
                                cancelled = report.cancelled,
                                "file sliced"
                            );
                            state.wake();
                        }
                        Err(err) => {
                            warn!(token = %request.token, "slicing failed: {}", err);
                            abandon(&store, &events, &request, err.to_string()).await;
                        }
                    }
                });
            }
            Control::Cancel => {
                info!("cancelling all uploads");
                self.generation.cancel();
                self.state.request_cancel();
                while self.producers.join_next().await.is_some() {}
                self.generation = shutdown.child_token();
                if let Err(err) = self.store.clear().await {
                    warn!("could not clear the chunk store: {}", err);
                }
                self.state.wake();
            }
            Control::SetChunkSize(chunk_size) => {
                debug!(chunk_size, "chunk size changed");
                self.chunk_size = chunk_size;
            }
        }
    }
}

/// Drop whatever a failed producer already queued and tell the host.
async fn abandon(
    store: &ChunkStore,
    events: &UnboundedSender<UploadEvent>,
    request: &SliceRequest,
    reason: String,
) {
    let token = request.token.as_str();
    if let Err(err) = store.remove_token_chunks(token).await {
        warn!(token, "could not drop queued chunks: {}", err);
    }
    let record = match store.remove_token(token).await {
        Ok(Some(record)) => record,
        Ok(None) => TokenRecord {
            token: request.token.clone(),
            start: Utc::now(),
            path: request.path.clone(),
            filename: request
                .file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            filesize: 0,
            max: 0,
            hash: String::new(),
        },
        Err(err) => {
            warn!(token, "could not drop token record: {}", err);
            return;
        }
    };
    let _ = events.send(UploadEvent::UploadFailed { record, reason });
}
