//! Endpoint tests
//!
//! Drives the newline-delimited JSON endpoint over a real TCP socket.
//! Run with: cargo test --test server_tests

use bson::doc;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use txbatch::codec::{WireOperation, WireRequest};
use txbatch::server::{BatchServer, HealthCheck};
use txbatch::{BatchConfig, BatchService, MemoryStore};

struct Harness {
    store: MemoryStore,
    server: Arc<BatchServer>,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    health_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let health_path = dir.path().join("healthy");

    let service = BatchService::new(Arc::new(store.clone()), &BatchConfig::default());
    let server = Arc::new(BatchServer::new(
        "mongo_transaction",
        service,
        HealthCheck::new(&health_path),
    ));
    let listener = BatchServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener, token).await });

    Harness {
        store,
        server,
        addr,
        shutdown,
        health_path,
        _dir: dir,
    }
}

async fn send_lines(addr: std::net::SocketAddr, lines: &[Value], expected_replies: usize) -> Vec<Value> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    for line in lines {
        let mut bytes = serde_json::to_vec(line).unwrap();
        bytes.push(b'\n');
        writer.write_all(&bytes).await.unwrap();
    }

    let mut reader = BufReader::new(reader).lines();
    let mut replies = Vec::new();
    while replies.len() < expected_replies {
        let line = reader.next_line().await.unwrap().expect("connection closed early");
        replies.push(serde_json::from_str(&line).unwrap());
    }
    replies
}

fn insert_payload(text: &str) -> String {
    WireRequest::new("A", "P")
        .operation(WireOperation::insert("notes", &doc! { "text": text }))
        .to_json()
        .unwrap()
}

#[tokio::test]
async fn test_call_replies_with_reference() {
    let harness = start().await;

    let replies = send_lines(
        harness.addr,
        &[json!({
            "type": "call",
            "reference": { "tag": 42 },
            "payload": insert_payload("hi"),
            "request_id": "req-1"
        })],
        1,
    )
    .await;

    assert_eq!(
        replies[0],
        json!({ "reference": { "tag": 42 }, "reply": { "status": "ok" } })
    );
    assert_eq!(harness.store.count("notes").await, 1);
    assert_eq!(harness.server.connections(), 1);
    assert_eq!(harness.server.calls(), 1);
    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_replies_are_correlated_by_reference() {
    let harness = start().await;

    let replies = send_lines(
        harness.addr,
        &[
            json!({ "type": "call", "reference": "a", "payload": insert_payload("one") }),
            json!({ "type": "call", "reference": "b", "payload": r#"{"operations":[]}"# }),
            json!({ "type": "call", "reference": "c", "payload": insert_payload("two") }),
        ],
        3,
    )
    .await;

    let reply_for = |reference: &str| {
        replies
            .iter()
            .find(|reply| reply["reference"] == reference)
            .map(|reply| reply["reply"].clone())
            .unwrap()
    };
    assert_eq!(reply_for("a"), json!({ "status": "ok" }));
    assert_eq!(
        reply_for("b"),
        json!({ "status": "error", "message": "No valid operations" })
    );
    assert_eq!(reply_for("c"), json!({ "status": "ok" }));
    assert_eq!(harness.server.calls(), 3);
    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_health_check_cast_touches_file() {
    let harness = start().await;
    assert!(!harness.health_path.exists());

    // The cast has no reply, so follow it with an unknown request to know
    // the connection has processed it.
    let replies = send_lines(
        harness.addr,
        &[
            json!({ "type": "cast", "message": "check" }),
            json!({ "type": "ping", "reference": 1 }),
        ],
        1,
    )
    .await;

    assert_eq!(
        replies[0],
        json!({ "reference": 1, "reply": { "status": "error", "message": "unknown_request" } })
    );
    assert!(harness.health_path.exists());
    assert_eq!(harness.server.calls(), 0);
    harness.shutdown.cancel();
}
