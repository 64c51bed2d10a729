//! End-to-end tests for grove-daemon.
//!
//! Tests the daemon against live sockets: reload channels against a
//! tokio-tungstenite server, and the full open/edit/save cycle against an
//! axum mock of a grove server (HTTP API plus reload socket).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use grove_core::{Block, Bridge, BridgeOptions, CredentialStore, Document, SaveOutcome, UploadFormat};
use grove_daemon::{
    ChannelBridge, Daemon, FileCredentialStore, FileEvent, FileEventKind, FileWatcher,
    HttpGroveApi, NativeFs, ReloadChannels, ReloadConfig, ReloadEvent, ReloadNotice,
    ReloadRequest,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;

const API_KEY: &str = "secret";
const REMOTE: &str = "/api/grove/file/abc123/notebooks/demo";

// ============================================================================
// Reload server (tokio-tungstenite)
// ============================================================================

/// What a bare reload socket server observed.
#[derive(Default)]
struct ReloadLog {
    connections: AtomicUsize,
    api_keys: Mutex<Vec<String>>,
    frames: Mutex<Vec<serde_json::Value>>,
}

/// Accept reload sockets forever. Each request is answered with `reply`;
/// with `close_after_first` the server hangs up after answering once.
async fn spawn_reload_server(reply: &'static str, close_after_first: bool) -> (SocketAddr, Arc<ReloadLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let log = Arc::new(ReloadLog::default());
    let server_log = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&server_log);
            tokio::spawn(async move {
                let header_log = Arc::clone(&log);
                let callback = move |req: &Request, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    if let Some(key) = req.headers().get("x-api-key") {
                        header_log
                            .api_keys
                            .lock()
                            .unwrap()
                            .push(key.to_str().unwrap_or_default().to_string());
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                log.connections.fetch_add(1, Ordering::SeqCst);

                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                        log.frames.lock().unwrap().push(value);
                        let _ = ws.send(Message::Text(reply.to_string().into())).await;
                        if close_after_first {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                }
            });
        }
    });

    (addr, log)
}

fn request(file_name: &str) -> ReloadRequest {
    ReloadRequest {
        file_name: file_name.to_string(),
        project_id: "abc123".to_string(),
    }
}

async fn next_reload_event(rx: &mut mpsc::UnboundedReceiver<ReloadEvent>) -> ReloadEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for reload event")
        .expect("Reload event channel closed")
}

const RELOAD_OK: &str = r#"{"event":"reloadResult","data":{"success":true}}"#;

#[tokio::test]
async fn test_one_socket_per_origin() {
    let (addr, log) = spawn_reload_server(RELOAD_OK, false).await;
    let origin = format!("http://{}", addr);
    let (channels, _rx) = ReloadChannels::new(ReloadConfig::default());

    channels.send_reload(&origin, API_KEY, &request("a")).await.unwrap();

    // Concurrent requests share the socket too
    let (req_b, req_c) = (request("b"), request("c"));
    let (first, second) = tokio::join!(
        channels.send_reload(&origin, API_KEY, &req_b),
        channels.send_reload(&origin, API_KEY, &req_c),
    );
    first.unwrap();
    second.unwrap();

    timeout(Duration::from_secs(5), async {
        while log.frames.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Server should receive three requests");

    assert_eq!(log.connections.load(Ordering::SeqCst), 1);
    assert_eq!(channels.connection_count().await, 1);
    assert_eq!(*log.api_keys.lock().unwrap(), vec![API_KEY.to_string()]);

    let frames = log.frames.lock().unwrap();
    assert_eq!(frames[0]["event"], "requestReload");
    assert_eq!(frames[0]["data"]["fileName"], "a");
    assert_eq!(frames[0]["data"]["projectId"], "abc123");

    drop(frames);
    channels.shutdown().await;
    assert_eq!(channels.connection_count().await, 0);
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let (addr, log) = spawn_reload_server(RELOAD_OK, true).await;
    let origin = format!("http://{}", addr);
    let (channels, mut rx) = ReloadChannels::new(ReloadConfig::default());

    channels.send_reload(&origin, API_KEY, &request("a")).await.unwrap();

    // Result arrives, then the server hangs up
    let event = next_reload_event(&mut rx).await;
    assert!(matches!(event, ReloadEvent::Notice { .. }));
    let event = next_reload_event(&mut rx).await;
    assert_eq!(event, ReloadEvent::Closed { origin: origin.clone() });
    assert!(!channels.is_connected(&origin).await);

    channels.send_reload(&origin, API_KEY, &request("b")).await.unwrap();
    wait_for("second connection", || {
        (log.connections.load(Ordering::SeqCst) == 2).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_reload_failures_are_forwarded() {
    let (addr, _log) = spawn_reload_server(
        r#"{"event":"reloadResult","data":{"success":false,"message":"syntax error"}}"#,
        false,
    )
    .await;
    let origin = format!("http://{}", addr);
    let (channels, mut rx) = ReloadChannels::new(ReloadConfig::default());

    channels.send_reload(&origin, API_KEY, &request("a")).await.unwrap();

    match next_reload_event(&mut rx).await {
        ReloadEvent::Notice { origin: from, notice } => {
            assert_eq!(from, origin);
            assert_eq!(
                notice,
                ReloadNotice::Result {
                    success: false,
                    message: Some("syntax error".into())
                }
            );
        }
        other => panic!("Expected notice, got {:?}", other),
    }
}

/// Accept connections and complete the handshake, then never read again,
/// so pings go unanswered.
async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(ws);
            });
        }
    });
    addr
}

/// Accept TCP connections but never answer the upgrade.
async fn spawn_stalled_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

#[tokio::test]
async fn test_missed_keepalive_drops_channel() {
    let addr = spawn_silent_server().await;
    let origin = format!("http://{}", addr);
    let (channels, mut rx) = ReloadChannels::new(ReloadConfig {
        ping_interval: Duration::from_secs(1),
        ping_timeout: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
    });

    let started = tokio::time::Instant::now();
    channels.send_reload(&origin, API_KEY, &request("a")).await.unwrap();
    assert!(channels.is_connected(&origin).await);

    let event = next_reload_event(&mut rx).await;
    assert_eq!(event, ReloadEvent::Closed { origin: origin.clone() });
    // Dropped one timeout after the first ping, not at the next ping
    assert!(started.elapsed() < Duration::from_millis(1800));
    assert_eq!(channels.connection_count().await, 0);
}

#[tokio::test]
async fn test_slow_origin_does_not_block_others() {
    let stalled = format!("http://{}", spawn_stalled_server().await);
    let (addr, log) = spawn_reload_server(RELOAD_OK, false).await;
    let healthy = format!("http://{}", addr);
    let (channels, _rx) = ReloadChannels::new(ReloadConfig {
        connect_timeout: Duration::from_secs(3),
        ..Default::default()
    });
    let channels = Arc::new(channels);

    let pending = {
        let channels = Arc::clone(&channels);
        let stalled = stalled.clone();
        tokio::spawn(async move { channels.send_reload(&stalled, API_KEY, &request("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(
        Duration::from_secs(1),
        channels.send_reload(&healthy, API_KEY, &request("fast")),
    )
    .await
    .expect("Healthy origin should not wait for the stalled connect")
    .unwrap();
    wait_for("healthy request", || {
        (!log.frames.lock().unwrap().is_empty()).then_some(())
    })
    .await;

    let result = pending.await.unwrap();
    assert!(result.is_err());
    assert!(!channels.is_connected(&stalled).await);
    assert!(channels.is_connected(&healthy).await);
}

// ============================================================================
// Mock grove server (axum)
// ============================================================================

#[derive(Debug, Clone)]
struct ReceivedUpload {
    file_name: String,
    project_id: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockGrove {
    files: Mutex<HashMap<String, String>>,
    grove_version: Mutex<String>,
    uploads: Mutex<Vec<ReceivedUpload>>,
    reloads: Mutex<Vec<serde_json::Value>>,
    sockets: AtomicUsize,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some(API_KEY)
}

async fn get_file(
    State(mock): State<Arc<MockGrove>>,
    headers: HeaderMap,
    UrlPath(rest): UrlPath<String>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad key").into_response();
    }
    let remote = format!("/api/grove/file/{}", rest);
    match mock.files.lock().unwrap().get(&remote) {
        Some(body) => body.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "no such file").into_response(),
    }
}

async fn list_modules(State(mock): State<Arc<MockGrove>>) -> Json<serde_json::Value> {
    let version = mock.grove_version.lock().unwrap().clone();
    Json(serde_json::json!({
        "content": [
            { "name": "Other", "version": "9.9.9" },
            { "name": "Grove", "version": version }
        ]
    }))
}

async fn upload(State(mock): State<Arc<MockGrove>>, headers: HeaderMap, mut form: Multipart) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad key").into_response();
    }
    let mut received = ReceivedUpload {
        file_name: String::new(),
        project_id: String::new(),
        data: Vec::new(),
    };
    while let Ok(Some(field)) = form.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.unwrap_or_default().to_vec();
        match name.as_str() {
            "fileName" => received.file_name = String::from_utf8(bytes).unwrap(),
            "projectId" => received.project_id = String::from_utf8(bytes).unwrap(),
            "data" => received.data = bytes,
            _ => {}
        }
    }
    mock.uploads.lock().unwrap().push(received);
    StatusCode::OK.into_response()
}

async fn hot_reload(
    State(mock): State<Arc<MockGrove>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| reload_socket(socket, mock))
}

async fn reload_socket(mut socket: WebSocket, mock: Arc<MockGrove>) {
    mock.sockets.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(msg)) = socket.recv().await {
        if let AxumMessage::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            mock.reloads.lock().unwrap().push(value);
            let _ = socket.send(AxumMessage::Text(RELOAD_OK.into())).await;
        }
    }
}

async fn spawn_mock_grove(payload: &str, version: &str) -> (String, Arc<MockGrove>) {
    let mock = Arc::new(MockGrove::default());
    mock.files
        .lock()
        .unwrap()
        .insert(REMOTE.to_string(), payload.to_string());
    *mock.grove_version.lock().unwrap() = version.to_string();

    let app = Router::new()
        .route("/api/grove/file/{*rest}", get(get_file))
        .route("/api/tempModule/tempModules", get(list_modules))
        .route("/api/grove/simpleUploadFile", post(upload))
        .route("/groveHotReload/", get(hot_reload))
        .with_state(Arc::clone(&mock));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}", addr), mock)
}

// ============================================================================
// Helpers
// ============================================================================

type TestBridge = ChannelBridge<NativeFs, HttpGroveApi, FileCredentialStore>;

struct Harness {
    workdir: TempDir,
    _config: TempDir,
    bridge: Arc<TestBridge>,
    reload_rx: mpsc::UnboundedReceiver<ReloadEvent>,
}

async fn harness(origin: &str) -> Harness {
    let workdir = TempDir::new().expect("Failed to create temp dir");
    let config = TempDir::new().expect("Failed to create temp dir");

    let credentials = FileCredentialStore::new(config.path().join("credentials.json"));
    credentials.set(origin, API_KEY).await.unwrap();
    let (reload, reload_rx) = ReloadChannels::new(ReloadConfig::default());

    let bridge = Bridge::new(
        NativeFs::new(workdir.path().to_path_buf()),
        HttpGroveApi::new().unwrap(),
        credentials,
        reload,
        BridgeOptions::default(),
    );

    Harness {
        workdir,
        _config: config,
        bridge: Arc::new(bridge),
        reload_rx,
    }
}

fn open_link(origin: &str) -> String {
    format!(
        "grovebook://open?open={}&baseUrl={}",
        urlencoding::encode(REMOTE),
        urlencoding::encode(origin)
    )
}

impl Harness {
    fn root(&self) -> PathBuf {
        self.workdir.path().to_path_buf()
    }
}

async fn wait_for<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timeout waiting for {}", what))
}

fn modified(path: &str) -> FileEvent {
    FileEvent {
        path: path.to_string(),
        kind: FileEventKind::Modified,
    }
}

fn write_local(root: &Path, path: &str, content: &str) {
    std::fs::write(root.join(path), content).expect("Failed to write document");
}

// ============================================================================
// Open / edit / save
// ============================================================================

#[tokio::test]
async fn test_open_edit_save_native() {
    let (origin, mock) = spawn_mock_grove("# Demo\n\nHello.", "2.3.0").await;
    let h = harness(&origin).await;
    let root = h.root();

    let opened = h.bridge.open_link(&open_link(&origin)).await.unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(root.join(&opened.path)).unwrap(), "# Demo\n\nHello.");

    let mut daemon = Daemon::new(Arc::clone(&h.bridge), None);

    // The watcher echo of our own download write uploads nothing
    daemon.on_file_event(modified(&opened.path)).await;
    daemon.drain().await;
    assert!(mock.uploads.lock().unwrap().is_empty());

    write_local(&root, &opened.path, "# Demo\n\nHello, world.");
    daemon.on_file_event(modified(&opened.path)).await;
    daemon.drain().await;

    let uploads = mock.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].data, b"# Demo\n\nHello, world.");
    assert_eq!(uploads[0].file_name, "notebooks/demo");
    assert_eq!(uploads[0].project_id, "abc123");

    let reloads = wait_for("reload request", || {
        let reloads = mock.reloads.lock().unwrap();
        (!reloads.is_empty()).then(|| reloads.clone())
    })
    .await;
    assert_eq!(reloads[0]["event"], "requestReload");
    assert_eq!(reloads[0]["data"]["fileName"], "notebooks/demo");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_open_edit_save_legacy() {
    let payload = r#"{"blocks":[
        {"type":"header","data":{"text":"Demo","level":2}},
        {"type":"codeTool","data":{"value":"return 1","pinCode":true,"dname":"cell-7","codeMode":"javascript2","hide":false}}
    ],"version":"2.22.2"}"#;
    let (origin, mock) = spawn_mock_grove(payload, "1.4.0").await;
    let mut h = harness(&origin).await;
    let root = h.root();

    let opened = h.bridge.open_link(&open_link(&origin)).await.unwrap().unwrap();
    assert!(opened.content.starts_with("## Demo\n\n<!--"));
    assert!(opened.content.contains("```js\nreturn 1\n```"));

    let edited = opened.content.replace("return 1", "return 2");
    write_local(&root, &opened.path, &edited);

    let outcome = h.bridge.save(&opened.path, false).await.unwrap();
    assert!(matches!(
        outcome,
        SaveOutcome::Uploaded {
            format: UploadFormat::LegacyJson,
            reload_requested: true
        }
    ));

    let uploads = mock.uploads.lock().unwrap().clone();
    let document = Document::from_payload(std::str::from_utf8(&uploads[0].data).unwrap()).unwrap();
    assert_eq!(document.version, "2.22.2");
    match &document.blocks[1] {
        Block::Code(code) => {
            assert_eq!(code.value, "return 2");
            assert_eq!(code.dname, "cell-7");
            assert!(code.pin_code);
        }
        other => panic!("Expected code block, got {:?}", other),
    }

    // The server's reloadResult comes back on the channel
    match timeout(Duration::from_secs(5), h.reload_rx.recv()).await {
        Ok(Some(ReloadEvent::Notice { notice, .. })) => assert_eq!(notice.failure(), None),
        other => panic!("Expected reload notice, got {:?}", other),
    }

    // Saving the same content again is a no-op
    let outcome = h.bridge.save(&opened.path, false).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Unchanged);
    assert_eq!(mock.uploads.lock().unwrap().len(), 1);
    assert_eq!(mock.sockets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_autosync_uploads_once_after_quiet_period() {
    let (origin, mock) = spawn_mock_grove("v0", "2.0.0").await;
    let h = harness(&origin).await;
    let root = h.root();
    let opened = h.bridge.open_link(&open_link(&origin)).await.unwrap().unwrap();

    let mut daemon = Daemon::new(Arc::clone(&h.bridge), Some(Duration::from_millis(150)));

    write_local(&root, &opened.path, "v1");
    daemon.on_file_event(modified(&opened.path)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_local(&root, &opened.path, "v2");
    daemon.on_file_event(modified(&opened.path)).await;

    let path = timeout(Duration::from_secs(5), daemon.next_expired())
        .await
        .expect("Auto-sync should fire")
        .unwrap();
    assert_eq!(path, opened.path);
    daemon.on_autosync_expired(path);
    daemon.drain().await;

    let uploads = mock.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].data, b"v2");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_deleted_document_cancels_autosync() {
    let (origin, mock) = spawn_mock_grove("v0", "2.0.0").await;
    let h = harness(&origin).await;
    let root = h.root();
    let opened = h.bridge.open_link(&open_link(&origin)).await.unwrap().unwrap();

    let mut daemon = Daemon::new(Arc::clone(&h.bridge), Some(Duration::from_millis(100)));
    write_local(&root, &opened.path, "v1");
    daemon.on_file_event(modified(&opened.path)).await;

    std::fs::remove_file(root.join(&opened.path)).unwrap();
    daemon
        .on_file_event(FileEvent {
            path: opened.path.clone(),
            kind: FileEventKind::Deleted,
        })
        .await;

    assert!(timeout(Duration::from_millis(400), daemon.next_expired()).await.is_err());
    assert!(!h.bridge.is_open(&opened.path));
    assert!(mock.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_key_fails_without_writing() {
    let (origin, _mock) = spawn_mock_grove("text", "2.0.0").await;
    let h = harness(&origin).await;
    h.bridge.credentials().set(&origin, "wrong").await.unwrap();

    let result = h.bridge.open_link(&open_link(&origin)).await;
    assert!(result.is_err());
    assert!(h.bridge.managed_files().await.map(|f| f.is_empty()).unwrap_or(true));
}

// ============================================================================
// File watcher
// ============================================================================

/// Watcher reports grovebook writes and ignores backups.
#[tokio::test]
async fn test_file_watcher_reports_grovebooks_only() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let workdir = temp_dir.path().to_path_buf();
    let origin_dir = workdir.join("http__localhost_3000");
    std::fs::create_dir_all(origin_dir.join("backups")).expect("Failed to create dirs");

    let mut watcher = FileWatcher::new(workdir.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize - FSEvents on macOS needs time
    tokio::time::sleep(Duration::from_millis(500)).await;

    std::fs::write(
        origin_dir.join("backups/%2Fapi%2Fgrove%2Ffile%2Fp%2Fdemo.20260101T000000.000Z.grove.md"),
        "old",
    )
    .expect("Failed to write backup");
    std::fs::write(origin_dir.join("notes.txt"), "ignored").expect("Failed to write file");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let doc = origin_dir.join("%2Fapi%2Fgrove%2Ffile%2Fp%2Fdemo.grove.md");
    std::fs::write(&doc, "# Hello").expect("Failed to write file");

    // Modify again to ensure FSEvents triggers
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&doc, "# Hello World").expect("Failed to modify file");

    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");

    assert_eq!(
        event.path,
        "http__localhost_3000/%2Fapi%2Fgrove%2Ffile%2Fp%2Fdemo.grove.md"
    );
    assert_eq!(event.kind, FileEventKind::Modified);
}
