use anyhow::{Context, Result};
use axum::Router;
use resumable_upload::{
    config::{AppCommand, PushJob, ServerConfig},
    models::{
        chunk::is_token_safe,
        events::{UploadEvent, UploadState},
    },
    routes,
    services::{
        chunk_store::ChunkStore,
        slice_producer::SliceRequest,
        transport::HttpTransport,
        upload_service::{UploadLimits, UploadService},
        uploader::{Uploader, UploaderConfig},
    },
};
use std::{collections::BTreeSet, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match AppCommand::from_env_and_args()? {
        AppCommand::Serve(cfg) => serve(cfg).await,
        AppCommand::Push(job) => push(job).await,
        AppCommand::Status { cache_db } => status(&cache_db).await,
        AppCommand::Cancel { cache_db } => cancel(&cache_db).await,
    }
}

async fn serve(cfg: ServerConfig) -> Result<()> {
    tracing::info!("Starting upload server with config: {:?}", cfg);

    // --- Ensure upload directory exists ---
    if !cfg.upload_dir.exists() {
        std::fs::create_dir_all(&cfg.upload_dir)?;
        tracing::info!("Created upload directory at {}", cfg.upload_dir.display());
    }

    let limits = UploadLimits {
        max_total_size: cfg.max_total_size,
        ..UploadLimits::default()
    };
    let service = UploadService::with_limits(cfg.upload_dir.clone(), limits);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_size).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

async fn push(job: PushJob) -> Result<()> {
    let store = ChunkStore::open(&job.client.cache_db)
        .await
        .with_context(|| format!("opening chunk cache {}", job.client.cache_db.display()))?;

    for record in store.discard_unsliced().await? {
        tracing::warn!(
            token = %record.token,
            "Dropping {}: slicing was interrupted, queue it again",
            record.filename
        );
    }

    // Uploads left over from an earlier run resume alongside the new ones.
    let mut pending: BTreeSet<String> = store
        .list_tokens()
        .await?
        .into_iter()
        .map(|record| record.token)
        .collect();

    let mut requests = Vec::with_capacity(job.files.len());
    for file in &job.files {
        let token = match &job.token {
            Some(token) => token.clone(),
            None => Uuid::new_v4().simple().to_string(),
        };
        if !is_token_safe(&token) {
            anyhow::bail!("token `{}` must be alphanumeric", token);
        }
        tracing::info!(token = %token, "queueing {}", file.display());
        pending.insert(token.clone());
        requests.push(SliceRequest {
            file: file.clone(),
            token,
            path: job.path.clone(),
            filetype: job.filetype.clone(),
        });
    }

    if pending.is_empty() && store.is_empty().await? {
        tracing::info!("Nothing to upload");
        return Ok(());
    }

    let transport = HttpTransport::new(job.client.server_url.clone())?;
    let config = UploaderConfig {
        chunk_size: job.client.chunk_size,
        ..UploaderConfig::default()
    };
    let (uploader, mut events) = Uploader::start(store, transport, config);
    for request in requests {
        uploader.upload_file(request)?;
    }

    let mut failed = Vec::new();
    while !pending.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; queued chunks stay in the cache for the next run");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            UploadEvent::State(UploadState::Progress(files)) => {
                for file in files {
                    tracing::info!(
                        token = %file.record.token,
                        left = file.left,
                        "{} {}%",
                        file.record.filename,
                        file.progress
                    );
                }
            }
            UploadEvent::State(UploadState::Disconnected) => {
                tracing::warn!("Upload server unreachable, retrying");
            }
            UploadEvent::State(UploadState::Preparation) => {
                tracing::debug!("Preparing files");
            }
            UploadEvent::State(UploadState::None) => {}
            UploadEvent::UploadDone(record) => {
                tracing::info!(token = %record.token, "Uploaded {}", record.filename);
                pending.remove(&record.token);
            }
            UploadEvent::UploadFailed { record, reason } => {
                tracing::error!(token = %record.token, "Upload of {} failed: {}", record.filename, reason);
                pending.remove(&record.token);
                failed.push(record.filename);
            }
        }
    }

    uploader.shutdown().await;
    if !failed.is_empty() {
        anyhow::bail!("{} upload(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

async fn status(cache_db: &Path) -> Result<()> {
    let store = ChunkStore::open(cache_db).await?;
    let progress = store.get_progress().await?;
    println!("{}", serde_json::to_string_pretty(&progress)?);
    store.close().await;
    Ok(())
}

async fn cancel(cache_db: &Path) -> Result<()> {
    let store = ChunkStore::open(cache_db).await?;
    store.clear().await?;
    tracing::info!("Cleared chunk cache at {}", cache_db.display());
    store.close().await;
    Ok(())
}
