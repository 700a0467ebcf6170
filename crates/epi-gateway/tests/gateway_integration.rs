//! End-to-end gateway tests.
//!
//! A real listener on an ephemeral port, a real worker writing signed batch
//! files into a temporary vault, and plain HTTP/1.1 requests over TCP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use epi_core::redact::Redactor;
use epi_core::trust::{FileKeyStore, KeyId, KeyStore, TrustedKeys};
use epi_gateway::batch::{Batch, BatchSink, FileBatchSink};
use epi_gateway::http;
use epi_gateway::worker::{BatchSigner, EvidenceWorker, StopOutcome, WorkerConfig};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

// =============================================================================
// Helpers
// =============================================================================

struct Gateway {
    addr: SocketAddr,
    worker: Arc<EvidenceWorker>,
    shutdown: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start_gateway(
    vault: &Path,
    signer: Option<BatchSigner>,
    max_batch_size: usize,
) -> Gateway {
    let sink = FileBatchSink::open(vault).unwrap();
    let config = WorkerConfig {
        max_batch_size,
        batch_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    };
    let worker = Arc::new(EvidenceWorker::with_parts(
        config,
        Arc::new(sink) as Arc<dyn BatchSink>,
        Redactor::new(),
        signer,
    ));
    worker.start().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(http::serve(listener, Arc::clone(&worker), async move {
        let _ = shutdown_rx.await;
    }));
    Gateway {
        addr,
        worker,
        shutdown,
        server,
    }
}

impl Gateway {
    async fn close(self) -> Arc<EvidenceWorker> {
        let _ = self.shutdown.send(());
        self.server.await.unwrap().unwrap();
        let worker = Arc::clone(&self.worker);
        let outcome = tokio::task::spawn_blocking(move || worker.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        self.worker
    }
}

/// Sends one request and returns the status code and JSON body.
async fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&Value>) -> (u16, Value) {
    let payload = body.map(Value::to_string).unwrap_or_default();
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    let text = String::from_utf8(response).unwrap();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or_default();
    let json = serde_json::from_str(body).unwrap_or(Value::Null);
    (status, json)
}

fn read_batches(vault: &Path) -> Vec<Batch> {
    let mut batches: Vec<Batch> = std::fs::read_dir(vault)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .map(|path| serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap())
        .collect();
    batches.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
    batches
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_to_signed_batch_files() {
    let dir = TempDir::new().unwrap();
    let vault = dir.path().join("vault");
    let store = FileKeyStore::open(dir.path().join("keys")).unwrap();
    let key_id = KeyId::new("gateway").unwrap();
    let key = store.load_or_generate(&key_id).unwrap();
    let signer = BatchSigner::new(key, key_id.clone());

    let gateway = start_gateway(&vault, Some(signer), 3).await;
    for seq in 0..7 {
        let event = json!({
            "kind": "llm.request",
            "content": { "seq": seq, "prompt": "Authorization: Bearer abcdef0123456789" },
            "meta": { "trace_id": format!("t-{seq}") },
        });
        let (status, body) = request(gateway.addr, "POST", "/capture", Some(&event)).await;
        assert_eq!(status, 202);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["message"], "Evidence queued for signing");
    }
    let worker = gateway.close().await;
    assert_eq!(worker.processed_count(), 7);

    let batches = read_batches(&vault);
    let counts: Vec<usize> = batches.iter().map(|b| b.count).collect();
    assert_eq!(counts.iter().sum::<usize>(), 7);
    assert!(counts.iter().all(|&c| c <= 3));

    let trusted = TrustedKeys::from_dir(store.dir()).unwrap();
    for batch in &batches {
        assert!(batch.verify(&trusted).is_valid(), "{}", batch.batch_id);
        for item in &batch.items {
            let prompt = item.content["prompt"].as_str().unwrap();
            assert!(!prompt.contains("abcdef0123456789"), "{prompt}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway(dir.path(), None, 50).await;

    let (status, body) = request(gateway.addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["state"], "running");
    for field in [
        "queue_size",
        "processed_count",
        "failed_batches",
        "dropped_count",
        "discarded_count",
    ] {
        assert!(body[field].is_u64(), "{field} missing: {body}");
    }

    let worker = gateway.close().await;
    assert_eq!(worker.processed_count(), 0);
    assert!(read_batches(dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_capture_is_client_error() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway(dir.path(), None, 50).await;

    let (status, _) =
        request(gateway.addr, "POST", "/capture", Some(&json!({ "content": {} }))).await;
    assert!((400..500).contains(&status), "status {status}");

    gateway.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsignable_capture_is_unprocessable() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway(dir.path(), None, 50).await;

    let body: Value = serde_json::from_str(
        r#"{"kind":"api.call","content":{"caf\u00e9":1,"cafe\u0301":2}}"#,
    )
    .unwrap();
    let (status, reply) = request(gateway.addr, "POST", "/capture", Some(&body)).await;
    assert_eq!(status, 422);
    assert_eq!(reply["status"], "rejected");

    let worker = gateway.close().await;
    assert_eq!(worker.processed_count(), 0);
    assert!(read_batches(dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_after_worker_stop_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway(dir.path(), None, 50).await;
    let worker = Arc::clone(&gateway.worker);
    tokio::task::spawn_blocking(move || worker.stop())
        .await
        .unwrap()
        .unwrap();

    let event = json!({ "kind": "api.call", "content": {} });
    let (status, body) = request(gateway.addr, "POST", "/capture", Some(&event)).await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "rejected");

    let _ = gateway.shutdown.send(());
    gateway.server.await.unwrap().unwrap();
}
