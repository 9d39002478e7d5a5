use llamabar::catalog::{CatalogEntry, Quant};
use llamabar::downloads::{DownloadCoordinator, ModelStore};
use llamabar::events::{self, DownloadEvent, Event, EventReceiver};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Serve fixed bodies over HTTP, one request per connection. A nonzero
/// `chunk_delay` drips the body out slowly so tests can act mid-transfer.
async fn serve_files(
    files: Vec<(&'static str, Vec<u8>)>,
    chunk_delay: Duration,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("No local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let files = files.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    let Ok(n) = stream.read(&mut buf[read..]).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                    if read == buf.len() {
                        return;
                    }
                }

                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                match files.iter().find(|(p, _)| *p == path) {
                    Some((_, body)) => {
                        let header = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        if stream.write_all(header.as_bytes()).await.is_err() {
                            return;
                        }
                        for chunk in body.chunks(8 * 1024) {
                            if stream.write_all(chunk).await.is_err() {
                                return;
                            }
                            if !chunk_delay.is_zero() {
                                sleep(chunk_delay).await;
                            }
                        }
                    }
                    None => {
                        let _ = stream
                            .write_all(
                                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            )
                            .await;
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Serve one request with headers and a first chunk, then hold the socket
/// open without ever sending the rest of the body.
async fn serve_stalling(total_len: usize) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("No local addr");

    let handle = tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {total_len}\r\n\r\n");
        let _ = stream.write_all(header.as_bytes()).await;
        let _ = stream.write_all(&vec![0x55u8; 8 * 1024]).await;
        std::future::pending::<()>().await
    });

    (addr, handle)
}

/// Staged temp files in the store directory.
fn partial_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("read store dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().ends_with(".partial"))
        .collect()
}

fn entry(addr: SocketAddr, shards: &[&str], mmproj: Option<&str>, file_size: u64) -> CatalogEntry {
    CatalogEntry {
        id: "test-model".to_string(),
        family: "Test".to_string(),
        variant: "4B".to_string(),
        series: "test".to_string(),
        blurb: String::new(),
        quant: Quant::Q8,
        released: "2025-01-01".to_string(),
        max_context: 131_072,
        file_size,
        kv_cache_per_1k: 1,
        url: format!("http://{addr}/primary.gguf"),
        shard_urls: shards
            .iter()
            .map(|name| format!("http://{addr}/{name}"))
            .collect(),
        mmproj_url: mmproj.map(|name| format!("http://{addr}/{name}")),
        mmproj_size: if mmproj.is_some() { 16_000 } else { 0 },
        server_args: Vec::new(),
    }
}

/// Two builds of one variant that share a projector file, like the catalog's
/// full-precision and q8 builds of the same model.
fn sibling_entry(id: &str, addr: SocketAddr, primary: &str, mmproj: &str) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        family: "Test".to_string(),
        variant: "4B".to_string(),
        series: "test".to_string(),
        blurb: String::new(),
        quant: Quant::Q8,
        released: "2025-01-01".to_string(),
        max_context: 131_072,
        file_size: 64_000,
        kv_cache_per_1k: 1,
        url: format!("http://{addr}/{primary}"),
        shard_urls: Vec::new(),
        mmproj_url: Some(format!("http://{addr}/{mmproj}")),
        mmproj_size: 256_000,
        server_args: Vec::new(),
    }
}

async fn wait_for<F>(rx: &mut EventReceiver, what: &str, pred: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("Event channel closed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"))
}

#[tokio::test]
async fn test_multi_file_download_completes() {
    let primary = vec![0xAAu8; 64 * 1024];
    let shard = vec![0xBBu8; 32 * 1024];
    let mmproj = vec![0xCCu8; 16 * 1024];
    let (addr, server) = serve_files(
        vec![
            ("/primary.gguf", primary.clone()),
            ("/shard.gguf", shard.clone()),
            ("/mmproj.gguf", mmproj.clone()),
        ],
        Duration::ZERO,
    )
    .await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let entry = entry(addr, &["shard.gguf"], Some("mmproj.gguf"), 96_000);
    coordinator.download(&entry).await.expect("download start");

    wait_for(&mut rx, "started event", |e| {
        matches!(e, Event::Download(DownloadEvent::Started { model, .. }) if model == "test-model")
    })
    .await;
    wait_for(&mut rx, "completed event", |e| {
        matches!(e, Event::Download(DownloadEvent::Completed { model }) if model == "test-model")
    })
    .await;

    assert!(store.is_downloaded(&entry));
    assert_eq!(
        std::fs::read(store.local_path(&entry.url)).expect("primary on disk"),
        primary
    );
    assert_eq!(
        std::fs::read(store.local_path(&entry.shard_urls[0])).expect("shard on disk"),
        shard
    );

    // No temp files left behind.
    assert!(partial_files(tmp.path()).is_empty());
    assert!(!coordinator.is_downloading(&entry.id).await);

    server.abort();
}

#[tokio::test]
async fn test_partial_failure_fails_download_but_keeps_good_file() {
    let primary = vec![0x11u8; 32 * 1024];
    // The shard is not on the server at all.
    let (addr, server) = serve_files(vec![("/primary.gguf", primary)], Duration::ZERO).await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let entry = entry(addr, &["missing.gguf"], None, 64_000);
    coordinator.download(&entry).await.expect("download start");

    let event = wait_for(&mut rx, "failed event", |e| {
        matches!(e, Event::Download(DownloadEvent::Failed { model, .. }) if model == "test-model")
    })
    .await;
    if let Event::Download(DownloadEvent::Failed { reason, .. }) = event {
        assert!(!reason.is_empty());
    }

    assert!(!store.is_downloaded(&entry));
    // The file that did transfer was still committed.
    assert!(store.local_path(&entry.url).exists());
    assert!(!store.local_path(&entry.shard_urls[0]).exists());
    assert!(!coordinator.is_downloading(&entry.id).await);

    server.abort();
}

#[tokio::test]
async fn test_cancel_discards_partial_files() {
    // Slow enough that cancellation lands mid-transfer.
    let body = vec![0x22u8; 256 * 1024];
    let (addr, server) = serve_files(
        vec![("/primary.gguf", body)],
        Duration::from_millis(50),
    )
    .await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let entry = entry(addr, &[], None, 256 * 1024);
    coordinator.download(&entry).await.expect("download start");

    wait_for(&mut rx, "started event", |e| {
        matches!(e, Event::Download(DownloadEvent::Started { .. }))
    })
    .await;

    coordinator.cancel(&entry.id).await.expect("cancel");
    wait_for(&mut rx, "canceled event", |e| {
        matches!(e, Event::Download(DownloadEvent::Canceled { model }) if model == "test-model")
    })
    .await;
    assert!(!coordinator.is_downloading(&entry.id).await);

    // The transfer task notices the token at its next chunk and cleans up.
    let mut cleaned = false;
    for _ in 0..100 {
        if partial_files(tmp.path()).is_empty() {
            cleaned = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(cleaned, "partial file not cleaned up");
    assert!(!store.local_path(&entry.url).exists());

    server.abort();
}

#[tokio::test]
async fn test_second_download_request_is_rejected_while_active() {
    let body = vec![0x33u8; 256 * 1024];
    let (addr, server) = serve_files(
        vec![("/primary.gguf", body)],
        Duration::from_millis(50),
    )
    .await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let entry = entry(addr, &[], None, 256 * 1024);
    coordinator.download(&entry).await.expect("download start");
    wait_for(&mut rx, "started event", |e| {
        matches!(e, Event::Download(DownloadEvent::Started { .. }))
    })
    .await;

    let err = coordinator
        .download(&entry)
        .await
        .expect_err("second download must be rejected");
    assert!(err.to_string().contains("already downloading"), "{err}");

    coordinator.cancel(&entry.id).await.expect("cancel");
    server.abort();
}

#[tokio::test]
async fn test_progress_totals_converge_on_real_sizes() {
    let primary = vec![0x44u8; 100 * 1024];
    let (addr, server) = serve_files(
        vec![("/primary.gguf", primary)],
        Duration::from_millis(20),
    )
    .await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    // Catalog size estimate is wrong on purpose; the wire size must win.
    let entry = entry(addr, &[], None, 5_000);
    coordinator.download(&entry).await.expect("download start");

    let started = wait_for(&mut rx, "started event", |e| {
        matches!(e, Event::Download(DownloadEvent::Started { .. }))
    })
    .await;
    if let Event::Download(DownloadEvent::Started { total_bytes, .. }) = started {
        assert_eq!(total_bytes, 5_000);
    }

    // Once the transfer reports its content length, the aggregate total
    // reflects it. The final progress tick always carries the real size.
    wait_for(&mut rx, "progress with corrected total", |e| {
        matches!(
            e,
            Event::Download(DownloadEvent::Progress { total_bytes, .. }) if *total_bytes == 100 * 1024
        )
    })
    .await;

    wait_for(&mut rx, "completed event", |e| {
        matches!(e, Event::Download(DownloadEvent::Completed { .. }))
    })
    .await;

    // Final status falls back to disk: downloaded, with the real size.
    assert!(store.is_downloaded(&entry));
    assert_eq!(
        std::fs::metadata(store.local_path(&entry.url))
            .expect("metadata")
            .len(),
        100 * 1024
    );

    server.abort();
}

#[tokio::test]
async fn test_concurrent_downloads_sharing_projector_commit_intact_files() {
    let projector = vec![0xEEu8; 256 * 1024];
    // Dripped slowly enough that the two projector transfers overlap.
    let (addr, server) = serve_files(
        vec![
            ("/a.gguf", vec![0xAAu8; 64 * 1024]),
            ("/b.gguf", vec![0xBBu8; 64 * 1024]),
            ("/mmproj.gguf", projector.clone()),
        ],
        Duration::from_millis(20),
    )
    .await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let full = sibling_entry("test-4b", addr, "a.gguf", "mmproj.gguf");
    let q8 = sibling_entry("test-4b-q8", addr, "b.gguf", "mmproj.gguf");

    coordinator.download(&full).await.expect("first download");
    coordinator.download(&q8).await.expect("second download");

    let mut settled = HashSet::new();
    while settled.len() < 2 {
        let event = wait_for(&mut rx, "both downloads to settle", |e| {
            matches!(
                e,
                Event::Download(DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. })
            )
        })
        .await;
        match event {
            Event::Download(DownloadEvent::Completed { model }) => {
                settled.insert(model);
            }
            Event::Download(DownloadEvent::Failed { model, reason }) => {
                panic!("download of {model} failed: {reason}");
            }
            _ => {}
        }
    }

    assert!(store.is_downloaded(&full));
    assert!(store.is_downloaded(&q8));

    // The committed projector is exactly the served bytes, whichever
    // transfer finished last.
    let committed = std::fs::read(store.local_path(full.mmproj_url.as_deref().expect("mmproj")))
        .expect("projector on disk");
    assert_eq!(committed.len(), projector.len());
    assert!(
        committed == projector,
        "projector bytes differ from the served file"
    );

    assert!(partial_files(tmp.path()).is_empty());
    server.abort();
}

#[tokio::test]
async fn test_cancel_interrupts_stalled_transfer() {
    let (addr, server) = serve_stalling(64 * 1024).await;

    let tmp = TempDir::new().expect("tempdir");
    let store = ModelStore::new(tmp.path().to_path_buf()).expect("store");
    let (events, mut rx) = events::channel();
    let coordinator = DownloadCoordinator::new(store.clone(), events);

    let entry = entry(addr, &[], None, 64 * 1024);
    coordinator.download(&entry).await.expect("download start");
    wait_for(&mut rx, "started event", |e| {
        matches!(e, Event::Download(DownloadEvent::Started { .. }))
    })
    .await;

    // First bytes arrive, then the connection goes quiet for good.
    let mut staged = false;
    for _ in 0..100 {
        if !partial_files(tmp.path()).is_empty() {
            staged = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(staged, "transfer never staged a temp file");

    coordinator.cancel(&entry.id).await.expect("cancel");

    // Cleanup must not wait for the server to send another byte.
    let mut cleaned = false;
    for _ in 0..100 {
        if partial_files(tmp.path()).is_empty() {
            cleaned = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "stalled transfer kept its temp file after cancel");
    assert!(!store.local_path(&entry.url).exists());

    server.abort();
}
