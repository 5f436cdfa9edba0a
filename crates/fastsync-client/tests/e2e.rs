//! End-to-end tests for fastsync-client.
//!
//! A scripted websocket server plays the sync server and drives the real client through
//! authorization, client identification and a startup sync.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fastsync_client::SyncClient;
use fastsync_core::fingerprint::fingerprint_text;
use fastsync_core::protocol::ChunkFrame;
use fastsync_core::{SyncEvent, SyncSettings};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

const TOKEN: &str = "e2e-token";

/// Scripted server side of one client socket.
struct TestServer {
    ws: WebSocketStream<TcpStream>,
    path: String,
}

impl TestServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("Client never connected")
            .unwrap();
        let seen = Arc::new(Mutex::new(String::new()));
        let record = Arc::clone(&seen);
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *record.lock().unwrap() = req.uri().to_string();
            Ok(resp)
        })
        .await
        .expect("Handshake failed");
        let path = seen.lock().unwrap().clone();
        Self { ws, path }
    }

    /// Next text frame, skipping control frames.
    async fn recv_text(&mut self) -> String {
        loop {
            let msg = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timed out waiting for a frame")
                .expect("Socket ended")
                .unwrap();
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    /// Next frame split into action and JSON payload.
    async fn recv_action(&mut self) -> (String, Value) {
        let text = self.recv_text().await;
        let (action, payload) = text.split_once('|').expect("Frame without separator");
        (action.to_string(), serde_json::from_str(payload).unwrap_or(Value::Null))
    }

    async fn send(&mut self, action: &str, data: Value) {
        let frame = format!("{}|{}", action, json!({ "code": 1, "data": data }));
        self.ws.send(Message::Text(frame)).await.unwrap();
    }

    async fn send_binary(&mut self, frame: Vec<u8>) {
        self.ws.send(Message::Binary(frame)).await.unwrap();
    }

    async fn send_raw(&mut self, frame: &str) {
        self.ws.send(Message::Text(frame.to_string())).await.unwrap();
    }

    /// Wait for the client's close frame and return its reason.
    async fn expect_close(&mut self) -> String {
        loop {
            let msg = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timed out waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| f.reason.into_owned()).unwrap_or_default();
                }
                Some(Ok(_)) => continue,
                _ => panic!("Socket ended without a close frame"),
            }
        }
    }
}

fn settings(port: u16) -> SyncSettings {
    SyncSettings {
        server_url: format!("ws://127.0.0.1:{}", port),
        api_token: TOKEN.into(),
        vault: "e2e".into(),
        startup_delay_ms: 0,
        ..Default::default()
    }
}

async fn wait_for_file(root: &Path, rel: &str) -> String {
    let path = root.join(rel);
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return contents;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", rel);
}

// ==================== Session ====================

#[tokio::test]
async fn test_startup_sync_applies_inlined_note() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("local.md"), "already here").unwrap();

    let client = SyncClient::open(dir.path(), settings(port)).await.unwrap();
    let completed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&completed);
    let _subscription = client.engine().events().subscribe(move |event| {
        if event == SyncEvent::SyncCompleted {
            flag.store(true, Ordering::SeqCst);
        }
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = tokio::spawn(client.run(shutdown_rx));

    let mut server = TestServer::accept(&listener).await;
    assert_eq!(server.path, "/api/user/sync?count=1");
    assert_eq!(server.recv_text().await, format!("Authorization|{}", TOKEN));
    server.send_raw(r#"Authorization|{"code":1,"msg":"ok"}"#).await;

    let (action, info) = server.recv_action().await;
    assert_eq!(action, "ClientInfo");
    assert_eq!(info["offlineSyncStrategy"], json!("repair"));

    let mut requested = HashSet::new();
    let mut note_request = Value::Null;
    while requested.len() < 3 {
        let (action, payload) = server.recv_action().await;
        if action == "NoteSync" {
            note_request = payload.clone();
        }
        if matches!(action.as_str(), "FolderSync" | "NoteSync" | "FileSync") {
            requested.insert(action);
        }
    }
    assert_eq!(note_request["vault"], json!("e2e"));
    let listed: Vec<&str> = note_request["notes"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|n| n["path"].as_str())
        .collect();
    assert_eq!(listed, vec!["local.md"]);

    server.send("FolderSyncEnd", json!({ "lastTime": 7 })).await;
    server
        .send(
            "NoteSyncEnd",
            json!({
                "lastTime": 7,
                "needModifyCount": 1,
                "messages": [{
                    "action": "NoteSyncModify",
                    "data": {
                        "path": "inbox/welcome.md",
                        "content": "hello from server",
                        "contentHash": fingerprint_text("hello from server"),
                        "mtime": 1_700_000_000_000i64
                    }
                }]
            }),
        )
        .await;
    server.send("FileSyncEnd", json!({ "lastTime": 7 })).await;

    assert_eq!(wait_for_file(dir.path(), "inbox/welcome.md").await, "hello from server");
    for _ in 0..100 {
        if completed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(completed.load(Ordering::SeqCst), "sync cycle never completed");

    shutdown_tx.send(true).unwrap();
    assert_eq!(server.expect_close().await, "unRegister");
    timeout(Duration::from_secs(5), session)
        .await
        .expect("Session did not stop")
        .unwrap()
        .unwrap();
    assert!(dir.path().join(".fastsync/state.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunks_follow_their_download_metadata() {
    const FILES: usize = 200;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let client = SyncClient::open(dir.path(), settings(port)).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = tokio::spawn(client.run(shutdown_rx));

    let mut server = TestServer::accept(&listener).await;
    assert_eq!(server.recv_text().await, format!("Authorization|{}", TOKEN));
    server.send_raw(r#"Authorization|{"code":1,"msg":"ok"}"#).await;
    let (action, _) = server.recv_action().await;
    assert_eq!(action, "ClientInfo");

    // Each chunk frame directly follows the metadata frame that opens its session.
    for i in 0..FILES {
        let session_id = format!("00000000-0000-0000-0000-{:012}", i);
        server
            .send(
                "FileSyncChunkDownload",
                json!({
                    "path": format!("att/{}.bin", i),
                    "sessionId": session_id,
                    "totalChunks": 1,
                    "chunkSize": 4,
                    "size": 4
                }),
            )
            .await;
        let chunk = ChunkFrame {
            session_id: &session_id,
            index: 0,
            data: b"data",
        }
        .encode()
        .unwrap();
        server.send_binary(chunk).await;
    }

    let written = |root: &Path| {
        (0..FILES)
            .filter(|i| root.join(format!("att/{}.bin", i)).exists())
            .count()
    };
    for _ in 0..200 {
        if written(dir.path()) == FILES {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(written(dir.path()), FILES);
    assert_eq!(std::fs::read(dir.path().join("att/0.bin")).unwrap(), b"data");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), session)
        .await
        .expect("Session did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_rejected_authorization_closes_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let client = SyncClient::open(dir.path(), settings(port)).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = tokio::spawn(client.run(shutdown_rx));

    let mut server = TestServer::accept(&listener).await;
    assert_eq!(server.recv_text().await, format!("Authorization|{}", TOKEN));
    server
        .send_raw(r#"Authorization|{"code":401,"msg":"bad token"}"#)
        .await;
    assert_eq!(server.expect_close().await, "AuthorizationFaild");
    drop(server);

    let retry = timeout(Duration::from_secs(4), listener.accept()).await;
    assert!(retry.is_err(), "client reconnected after a rejected authorization");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), session)
        .await
        .expect("Session did not stop")
        .unwrap()
        .unwrap();
}
