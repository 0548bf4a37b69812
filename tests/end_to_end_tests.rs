//! Client workers uploading to a live server over HTTP.

mod common;

use common::{MAX_CHUNK_SIZE, TestServer};
use reqwest::Url;
use resumable_upload::{
    models::events::{UploadEvent, UploadState},
    services::{
        chunk_store::ChunkStore,
        digest::sha256_bytes,
        slice_producer::SliceRequest,
        transport::HttpTransport,
        upload_service::{ASSEMBLY_FILE, UploadLimits},
        upload_synchronizer::SyncConfig,
        uploader::{Uploader, UploaderConfig},
    },
};
use std::{path::PathBuf, time::Duration};
use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver, time::timeout};

async fn spawn_server(server: &TestServer) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{}/upload", addr)).unwrap()
}

fn config() -> UploaderConfig {
    UploaderConfig {
        chunk_size: 4096,
        sync: SyncConfig {
            idle_interval: Duration::from_millis(50),
            progress_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        },
    }
}

async fn write_payload(dir: &std::path::Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 13 % 256) as u8).collect();
    let path = dir.join(name);
    tokio::fs::write(&path, &data).await.unwrap();
    (path, data)
}

async fn next_terminal(events: &mut UnboundedReceiver<UploadEvent>) -> (UploadEvent, Vec<UploadEvent>) {
    let mut seen = Vec::new();
    let terminal = timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.unwrap();
            match event {
                UploadEvent::UploadDone(_) | UploadEvent::UploadFailed { .. } => return event,
                other => seen.push(other),
            }
        }
    })
    .await
    .expect("upload did not finish");
    (terminal, seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_is_uploaded_and_verified() {
    let server = TestServer::new();
    let token_dir = server.authorize("e2e");
    let url = spawn_server(&server).await;

    let client_dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::open(client_dir.path().join("chunks.db")).await.unwrap();
    let (file, data) = write_payload(client_dir.path(), "video.mp4", 50_000).await;

    let transport = HttpTransport::new(url).unwrap();
    let (uploader, mut events) = Uploader::start(store.clone(), transport, config());
    uploader
        .upload_file(SliceRequest {
            file,
            token: "e2e".into(),
            path: "movies".into(),
            filetype: "video/mp4".into(),
        })
        .unwrap();

    let (terminal, seen) = next_terminal(&mut events).await;
    match terminal {
        UploadEvent::UploadDone(record) => {
            assert_eq!(record.token, "e2e");
            assert_eq!(record.filename, "video.mp4");
            assert_eq!(record.max, 13);
            assert_eq!(record.hash, sha256_bytes(&data));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(seen.contains(&UploadEvent::State(UploadState::Preparation)));

    assert_eq!(std::fs::read(token_dir.join(ASSEMBLY_FILE)).unwrap(), data);
    assert!(store.is_empty().await.unwrap());
    assert!(!store.isset_token("e2e").await.unwrap());
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_upload_fails_for_good() {
    let server = TestServer::with_limits(UploadLimits {
        max_total_size: 8 * 1024,
        ..UploadLimits::default()
    });
    server.authorize("big");
    let url = spawn_server(&server).await;

    let client_dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::open(client_dir.path().join("chunks.db")).await.unwrap();
    let (file, _) = write_payload(client_dir.path(), "big.bin", 40_000).await;

    let (uploader, mut events) =
        Uploader::start(store.clone(), HttpTransport::new(url).unwrap(), config());
    uploader
        .upload_file(SliceRequest {
            file,
            token: "big".into(),
            path: String::new(),
            filetype: String::new(),
        })
        .unwrap();

    let (terminal, _) = next_terminal(&mut events).await;
    match terminal {
        UploadEvent::UploadFailed { record, .. } => assert_eq!(record.token, "big"),
        other => panic!("unexpected event {:?}", other),
    }

    // Chunks sliced after the rejection are refused and dropped on later cycles.
    timeout(Duration::from_secs(10), async {
        while store.has_chunk_count("big").await.unwrap() > 0
            || store.isset_token("big").await.unwrap()
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rejected upload was not dropped");
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_waits_for_server_and_resumes() {
    let client_dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::open(client_dir.path().join("chunks.db")).await.unwrap();
    let (file, data) = write_payload(client_dir.path(), "later.bin", 10_000).await;

    // Reserve a port nobody listens on yet.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    let url = Url::parse(&format!("http://{}/upload", addr)).unwrap();

    let (uploader, mut events) =
        Uploader::start(store.clone(), HttpTransport::new(url).unwrap(), config());
    uploader
        .upload_file(SliceRequest {
            file,
            token: "later".into(),
            path: String::new(),
            filetype: String::new(),
        })
        .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            if events.recv().await.unwrap() == UploadEvent::State(UploadState::Disconnected) {
                break;
            }
        }
    })
    .await
    .expect("network loss was not reported");
    assert!(store.isset_token("later").await.unwrap());

    let server = TestServer::new();
    let token_dir = server.authorize("later");
    let listener = TcpListener::bind(addr).await.unwrap();
    let router = server.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let (terminal, _) = next_terminal(&mut events).await;
    assert!(matches!(terminal, UploadEvent::UploadDone(ref r) if r.token == "later"));
    assert_eq!(std::fs::read(token_dir.join(ASSEMBLY_FILE)).unwrap(), data);
    uploader.shutdown().await;
}

#[test]
fn chunk_size_fits_server_body_limit() {
    assert!(config().chunk_size <= MAX_CHUNK_SIZE);
}
