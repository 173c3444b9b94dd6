//! HTTP/WebSocket action surface (spec §4.9). Grounded directly on
//! `build_router`/`AppState`/`security_headers`/the `{success, ...}` JSON
//! convention from the teacher's own `web.rs`; every session/auth/PAM/JWT
//! handler is replaced with the gateway's actual endpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use tether_protocol::GatewayConfig;

use crate::devices::{ConnectPreferenceService, DeviceTracker, KeepAwakeService, Transport};
use crate::error::GatewayError;
use crate::fsls;
use crate::mux;
use crate::proxy::{Frame, FrameSink, ProxyConfig, Session};
use crate::recorder::{self, load_recording, update_recording_name};
use crate::sync::SyncService;

const MAX_JSON_BODY: usize = 50 * 1024 * 1024;
const MAX_APK_BODY: usize = 512 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    pub sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub device_tracker: Arc<DeviceTracker>,
    pub connect_prefs: Arc<ConnectPreferenceService>,
    pub keep_awake: Arc<KeepAwakeService>,
    pub sync: Arc<SyncService>,
    pub started_at: Instant,
    pub metrics_frames_forwarded: AtomicU64,
    pub metrics_bytes_forwarded: AtomicU64,
    pub metrics_upstream_reconnects: AtomicU64,
    pub metrics_recordings_started: AtomicU64,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let connect_prefs = Arc::new(ConnectPreferenceService::new());
        Arc::new(Self {
            device_tracker: DeviceTracker::new(Arc::clone(&connect_prefs)),
            connect_prefs,
            keep_awake: Arc::new(KeepAwakeService::new()),
            sync: Arc::new(SyncService::new()),
            sessions: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            metrics_frames_forwarded: AtomicU64::new(0),
            metrics_bytes_forwarded: AtomicU64::new(0),
            metrics_upstream_reconnects: AtomicU64::new(0),
            metrics_recordings_started: AtomicU64::new(0),
            config,
        })
    }
}

/// Middleware that adds a defensive header set to every response. Ambient
/// hardening, not authentication, so it is carried despite the no-auth
/// Non-goal.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; connect-src 'self' wss: ws:; img-src 'self' data:",
        ),
    );
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/recordings/start", post(start_recording))
        .route("/api/recordings/stop", post(stop_recording))
        .route("/api/recordings/run", post(run_recording))
        .route("/api/recordings/pause", post(pause_recording))
        .route("/api/recordings/resume", post(resume_recording))
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/update-name", post(update_recording_name_handler))
        .route("/api/recordings/delete", post(delete_recording))
        .route("/api/sync", get(get_sync))
        .route("/api/sync/set", post(set_sync))
        .route("/api/sync/clear", post(clear_sync))
        .route("/api/devices/connect", post(devices_connect))
        .route("/api/device/keep-awake", post(device_keep_awake))
        .route("/api/devices/{id}/logcat", get(device_logcat))
        .route("/api/goog/device/install-uploaded", post(goog_install_uploaded))
        .route("/api/goog/device/send-binary", post(goog_send_binary))
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_upgrade))
        .layer(RequestBodyLimitLayer::new(MAX_JSON_BODY))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let apk_upload = Router::new()
        .route("/api/goog/device/install-apk-binary", post(goog_install_apk_binary))
        .layer(RequestBodyLimitLayer::new(MAX_APK_BODY))
        .layer(CorsLayer::permissive())
        .with_state(state);

    api.merge(apk_upload)
        .layer(axum::middleware::from_fn(security_headers))
}

fn success(value: serde_json::Value) -> axum::response::Response {
    let mut body = json!({ "success": true });
    if let serde_json::Value::Object(map) = value {
        body.as_object_mut().unwrap().extend(map);
    }
    (StatusCode::OK, Json(body)).into_response()
}

async fn session_for(state: &AppState, id: &str) -> Result<Arc<Session>, GatewayError> {
    state
        .sessions
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| GatewayError::NotFound(format!("no session {id}")))
}

#[derive(Deserialize)]
struct SessionBody {
    session: String,
    id: Option<String>,
}

async fn start_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> axum::response::Response {
    match session_for(&state, &body.session).await {
        Ok(session) => match session.start_recording(body.id).await {
            Ok(id) => {
                state.metrics_recordings_started.fetch_add(1, Ordering::Relaxed);
                success(json!({ "id": id }))
            }
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
struct SessionOnlyBody {
    session: String,
}

async fn stop_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionOnlyBody>,
) -> axum::response::Response {
    match session_for(&state, &body.session).await {
        Ok(session) => match session.stop_recording().await {
            Ok(path) => success(json!({ "filePath": path.display().to_string() })),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn run_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> axum::response::Response {
    let Some(id) = body.id else {
        return GatewayError::BadParam("id is required".into()).into_response();
    };
    match session_for(&state, &body.session).await {
        Ok(session) => match session.run_recording(&id).await {
            Ok(()) => success(json!({})),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn pause_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionOnlyBody>,
) -> axum::response::Response {
    match session_for(&state, &body.session).await {
        Ok(session) => match session.pause().await {
            Ok(()) => success(json!({})),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn resume_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionOnlyBody>,
) -> axum::response::Response {
    match session_for(&state, &body.session).await {
        Ok(session) => match session.resume().await {
            Ok(()) => success(json!({})),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn list_recordings(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let dir = PathBuf::from(&state.config.server.recordings_dir);
    let mut entries = Vec::new();
    if let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(recording) = load_recording(&dir, id) {
                entries.push(json!({
                    "id": recording.id,
                    "remote": recording.remote,
                    "createdAt": recording.created_at,
                    "name": recording.name,
                }));
            }
        }
    }
    success(json!({ "recordings": entries }))
}

#[derive(Deserialize)]
struct UpdateNameBody {
    id: String,
    name: String,
}

async fn update_recording_name_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateNameBody>,
) -> axum::response::Response {
    let dir = PathBuf::from(&state.config.server.recordings_dir);
    match update_recording_name(&dir, &body.id, &body.name) {
        Ok(path) => success(json!({ "filePath": path.display().to_string() })),
        Err(err) => GatewayError::NotFound(err.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct DeleteRecordingBody {
    id: String,
}

async fn delete_recording(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteRecordingBody>,
) -> axum::response::Response {
    let dir = PathBuf::from(&state.config.server.recordings_dir);
    let path = dir.join(format!("{}.json", body.id));
    match tokio::fs::remove_file(&path).await {
        Ok(()) => success(json!({})),
        Err(err) => GatewayError::NotFound(err.to_string()).into_response(),
    }
}

async fn get_sync(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let mapping: HashMap<String, Vec<String>> = state
        .sync
        .current_mapping()
        .await
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().collect()))
        .collect();
    success(json!({ "mapping": mapping }))
}

#[derive(Deserialize)]
struct SetSyncBody {
    target: String,
    devices: Vec<String>,
}

async fn set_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetSyncBody>,
) -> axum::response::Response {
    state.sync.set_mapping(&body.target, &body.devices).await;
    success(json!({}))
}

#[derive(Deserialize)]
struct ClearSyncBody {
    target: String,
}

async fn clear_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearSyncBody>,
) -> axum::response::Response {
    state.sync.clear_mapping(&body.target).await;
    success(json!({}))
}

#[derive(Deserialize)]
struct DevicesConnectBody {
    device: String,
    #[serde(rename = "hardwareSerial")]
    hardware_serial: String,
    mode: String,
    ip: Option<String>,
    port: Option<u16>,
    #[serde(rename = "wifiPeerIds", default)]
    wifi_peer_ids: Vec<String>,
}

async fn devices_connect(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DevicesConnectBody>,
) -> axum::response::Response {
    let result = match body.mode.as_str() {
        "usb" => {
            state
                .connect_prefs
                .switch_to_usb(&body.device, &body.hardware_serial, &body.wifi_peer_ids)
                .await
        }
        "wifi" => {
            let Some(ip) = body.ip else {
                return GatewayError::BadParam("ip is required for wifi mode".into()).into_response();
            };
            state
                .connect_prefs
                .switch_to_wifi(&body.device, &body.hardware_serial, &ip, body.port)
                .await
                .map(|_| ())
        }
        other => return GatewayError::BadParam(format!("unknown mode {other}")).into_response(),
    };
    match result {
        Ok(()) => success(json!({})),
        Err(err) => GatewayError::Upstream(err.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct KeepAwakeBody {
    device: String,
    seconds: Option<u64>,
}

async fn device_keep_awake(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeepAwakeBody>,
) -> axum::response::Response {
    let duration = std::time::Duration::from_secs(body.seconds.unwrap_or(300));
    match state.keep_awake.keep_awake(&body.device, duration).await {
        Ok(()) => success(json!({})),
        Err(err) => GatewayError::Upstream(err.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct LogcatQuery {
    lines: Option<u32>,
}

async fn device_logcat(
    AxumPath(id): AxumPath<String>,
    Query(query): Query<LogcatQuery>,
) -> axum::response::Response {
    let lines = query.lines.unwrap_or(200).to_string();
    let output = Command::new("adb")
        .args(["-s", &id, "logcat", "-d", "-t", &lines])
        .output()
        .await;
    match output {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )
            .into_response(),
        Err(err) => GatewayError::Upstream(err.to_string()).into_response(),
    }
}

async fn goog_install_apk_binary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let filename = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("upload.apk");
    let declared_size = headers
        .get("x-file-size")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(declared) = declared_size {
        if declared != body.len() {
            return GatewayError::BadParam(format!(
                "X-File-Size mismatch: declared {declared}, got {}",
                body.len()
            ))
            .into_response();
        }
    }

    let uploads_dir = PathBuf::from(&state.config.server.uploads_dir);
    if let Err(err) = tokio::fs::create_dir_all(&uploads_dir).await {
        return GatewayError::Io(err).into_response();
    }
    let sanitized = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.apk")
        .to_string();
    let dest = uploads_dir.join(&sanitized);
    match tokio::fs::write(&dest, &body).await {
        Ok(()) => success(json!({ "filePath": dest.display().to_string() })),
        Err(err) => GatewayError::Io(err).into_response(),
    }
}

#[derive(Deserialize)]
struct InstallUploadedBody {
    udid: String,
    #[serde(rename = "filePath")]
    file_path: String,
}

async fn goog_install_uploaded(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallUploadedBody>,
) -> axum::response::Response {
    let uploads_dir = PathBuf::from(&state.config.server.uploads_dir);
    let requested = PathBuf::from(&body.file_path);
    let Ok(resolved) = requested.canonicalize() else {
        return GatewayError::NotFound(body.file_path).into_response();
    };
    let Ok(uploads_resolved) = uploads_dir.canonicalize() else {
        return GatewayError::Io(std::io::Error::other("uploads dir missing")).into_response();
    };
    if !resolved.starts_with(&uploads_resolved) {
        return GatewayError::BadParam("filePath must resolve under the uploads directory".into())
            .into_response();
    }

    match resolved.extension().and_then(|e| e.to_str()) {
        Some("apk") => match install_apk(&body.udid, &resolved).await {
            Ok(()) => success(json!({})),
            Err(err) => GatewayError::Upstream(err.to_string()).into_response(),
        },
        Some("xapk") | Some("zip") => match install_split_apks(&body.udid, &resolved).await {
            Ok(()) => success(json!({})),
            Err(err) => GatewayError::Upstream(err.to_string()).into_response(),
        },
        _ => GatewayError::BadParam("unsupported file extension".into()).into_response(),
    }
}

async fn install_apk(udid: &str, path: &Path) -> anyhow::Result<()> {
    let remote = format!("/data/local/tmp/{}", path.file_name().unwrap().to_string_lossy());
    let push = Command::new("adb")
        .args(["-s", udid, "push", &path.to_string_lossy(), &remote])
        .output()
        .await?;
    if !push.status.success() {
        anyhow::bail!("adb push failed: {}", String::from_utf8_lossy(&push.stderr));
    }
    let install = Command::new("adb")
        .args(["-s", udid, "shell", "pm", "install", "-r", &remote])
        .output()
        .await?;
    if !install.status.success() {
        anyhow::bail!("pm install failed: {}", String::from_utf8_lossy(&install.stderr));
    }
    Ok(())
}

/// Unzip an XAPK/ZIP bundle to a temp directory and `adb install -r` the
/// contained split APKs, `base*.apk` first then the rest alphabetically.
async fn install_split_apks(udid: &str, path: &Path) -> anyhow::Result<()> {
    let temp_dir = std::env::temp_dir().join(format!("tether-xapk-{}", std::process::id()));
    tokio::fs::create_dir_all(&temp_dir).await?;

    let unzip = Command::new("unzip")
        .args(["-o", &path.to_string_lossy(), "-d"])
        .arg(&temp_dir)
        .output()
        .await?;
    if !unzip.status.success() {
        anyhow::bail!("unzip failed: {}", String::from_utf8_lossy(&unzip.stderr));
    }

    let mut apks = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&temp_dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("apk") {
            apks.push(path);
        }
    }
    apks.sort_by_key(|p| {
        let name = p.file_name().unwrap().to_string_lossy().to_string();
        (!name.starts_with("base"), name)
    });
    if apks.is_empty() {
        anyhow::bail!("no .apk files found in bundle");
    }

    let mut args = vec!["-s".to_string(), udid.to_string(), "install-multiple".to_string(), "-r".to_string()];
    args.extend(apks.iter().map(|p| p.to_string_lossy().into_owned()));
    let install = Command::new("adb").args(&args).output().await?;
    if !install.status.success() {
        anyhow::bail!("adb install-multiple failed: {}", String::from_utf8_lossy(&install.stderr));
    }

    tokio::fs::remove_dir_all(&temp_dir).await.ok();
    Ok(())
}

#[derive(Deserialize)]
struct SendBinaryBody {
    udids: Vec<String>,
    #[serde(default = "default_remote")]
    remote: String,
    #[serde(rename = "dataBase64")]
    data_base64: String,
    #[serde(rename = "timeoutMs", default = "default_send_timeout_ms")]
    timeout_ms: u64,
}

fn default_remote() -> String {
    "tcp:8886".to_string()
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

async fn goog_send_binary(
    Json(body): Json<SendBinaryBody>,
) -> axum::response::Response {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let Ok(data) = BASE64.decode(&body.data_base64) else {
        return GatewayError::BadParam("dataBase64 is not valid base64".into()).into_response();
    };

    let mut results = Vec::new();
    for udid in &body.udids {
        let outcome = send_binary_to_device(udid, &body.remote, &data, body.timeout_ms).await;
        match outcome {
            Ok(()) => results.push(json!({ "udid": udid, "success": true })),
            Err(err) => results.push(json!({ "udid": udid, "success": false, "error": err.to_string() })),
        }
    }

    let all_ok = results.iter().all(|r| r["success"] == json!(true));
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };
    (status, Json(json!({ "success": all_ok, "results": results }))).into_response()
}

async fn send_binary_to_device(udid: &str, remote: &str, data: &[u8], timeout_ms: u64) -> anyhow::Result<()> {
    let port = pick_ephemeral_port().await?;
    let forward = Command::new("adb")
        .args(["-s", udid, "forward", &format!("tcp:{port}"), remote])
        .output()
        .await?;
    if !forward.status.success() {
        anyhow::bail!("adb forward failed: {}", String::from_utf8_lossy(&forward.stderr));
    }

    let result: anyhow::Result<()> = async {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
        use tokio::io::AsyncWriteExt;
        stream.write_all(data).await?;
        stream.shutdown().await?;
        Ok(())
    }
    .await;

    let timeout_result = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), async { result }).await;
    let _ = Command::new("adb")
        .args(["-s", udid, "forward", "--remove", &format!("tcp:{port}")])
        .output()
        .await;

    timeout_result.map_err(|_| anyhow::anyhow!("send-binary timed out"))?
}

/// `adb forward` needs a concrete local port up front. Bind a throwaway
/// listener to let the OS hand out a free one, then drop it immediately;
/// the brief window before `adb forward` rebinds it is an accepted race,
/// same as any "ask the OS, then hand the port to another process" dance.
async fn pick_ephemeral_port() -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

async fn health_check(State(state): State<Arc<AppState>>) -> axum::response::Response {
    success(json!({
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "sessions": state.sessions.read().await.len(),
    }))
}

/// GET /metrics - Prometheus-compatible metrics endpoint.
async fn metrics(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let active_sessions = state.sessions.read().await.len();
    let uptime_secs = state.started_at.elapsed().as_secs();
    let frames_forwarded = state.metrics_frames_forwarded.load(Ordering::Relaxed);
    let bytes_forwarded = state.metrics_bytes_forwarded.load(Ordering::Relaxed);
    let upstream_reconnects = state.metrics_upstream_reconnects.load(Ordering::Relaxed);
    let recordings_started = state.metrics_recordings_started.load(Ordering::Relaxed);

    let body = format!(
        "# HELP tether_active_sessions Number of active proxy sessions\n\
         # TYPE tether_active_sessions gauge\n\
         tether_active_sessions {active_sessions}\n\
         \n\
         # HELP tether_uptime_seconds Server uptime in seconds\n\
         # TYPE tether_uptime_seconds gauge\n\
         tether_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP tether_frames_forwarded_total Total frames forwarded between downstream and upstream\n\
         # TYPE tether_frames_forwarded_total counter\n\
         tether_frames_forwarded_total {frames_forwarded}\n\
         \n\
         # HELP tether_bytes_forwarded_total Total bytes forwarded between downstream and upstream\n\
         # TYPE tether_bytes_forwarded_total counter\n\
         tether_bytes_forwarded_total {bytes_forwarded}\n\
         \n\
         # HELP tether_upstream_reconnects_total Total upstream connect retries\n\
         # TYPE tether_upstream_reconnects_total counter\n\
         tether_upstream_reconnects_total {upstream_reconnects}\n\
         \n\
         # HELP tether_recordings_started_total Total recordings started\n\
         # TYPE tether_recordings_started_total counter\n\
         tether_recordings_started_total {recordings_started}\n"
    );

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

struct AxumWsSink {
    sink: AsyncMutex<futures_util::stream::SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl FrameSink for AxumWsSink {
    async fn send_frame(&self, frame: Frame) {
        let message = match frame {
            Frame::Binary(b) => Message::Binary(b.into()),
            Frame::Text(t) => Message::Text(t.into()),
        };
        let _ = self.sink.lock().await.send(message).await;
    }

    async fn close(&self, code: u16, reason: String) {
        let _ = self
            .sink
            .lock()
            .await
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

type TungsteniteWsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TungsteniteSink {
    sink: AsyncMutex<futures_util::stream::SplitSink<TungsteniteWsStream, tokio_tungstenite::tungstenite::Message>>,
}

#[async_trait::async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_frame(&self, frame: Frame) {
        use tokio_tungstenite::tungstenite::Message as TMessage;
        let message = match frame {
            Frame::Binary(b) => TMessage::Binary(b.into()),
            Frame::Text(t) => TMessage::Text(t.into()),
        };
        let _ = self.sink.lock().await.send(message).await;
    }

    async fn close(&self, _code: u16, _reason: String) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[derive(Deserialize)]
struct WsActionQuery {
    action: String,
    session: Option<String>,
    ws: Option<String>,
    udid: Option<String>,
    remote: Option<String>,
    path: Option<String>,
    record: Option<String>,
    replay: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsActionQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    match query.action.as_str() {
        "proxy-ws" => {
            let Some(upstream_url) = query.ws.clone() else {
                return GatewayError::BadParam("ws param is required for proxy-ws".into()).into_response();
            };
            let session_id = query.session.clone().unwrap_or_else(|| upstream_url.clone());
            ws.on_upgrade(move |socket| {
                handle_proxy_socket(state, session_id, upstream_url, query.record, query.replay, socket)
            })
        }
        "proxy-adb" => {
            let (Some(udid), Some(remote)) = (query.udid.clone(), query.remote.clone()) else {
                return GatewayError::BadParam("udid and remote params are required for proxy-adb".into())
                    .into_response();
            };
            ws.on_upgrade(move |socket| {
                handle_proxy_adb_socket(state, udid, remote, query.path, query.record, query.replay, socket)
            })
        }
        "multiplex" => ws.on_upgrade(move |socket| handle_multiplex_socket(state, socket)),
        "devices-list" => ws.on_upgrade(move |socket| handle_devices_list_socket(state, socket)),
        "record-status" => {
            let Some(session_id) = query.session else {
                return GatewayError::BadParam("session query param is required".into()).into_response();
            };
            ws.on_upgrade(move |socket| handle_record_status_socket(state, session_id, socket))
        }
        other => GatewayError::BadParam(format!("unknown action {other}")).into_response(),
    }
}

const UPSTREAM_CONNECT_MAX_ATTEMPTS: usize = 3;
const UPSTREAM_CONNECT_RETRY_GAP: std::time::Duration = std::time::Duration::from_millis(500);
/// Spec §4.3: upstream close/failure propagates downstream with one of
/// these two codes, distinct from the generic `GatewayError` table.
const UPSTREAM_CLOSED_CLEAN: u16 = 4010;
const UPSTREAM_CLOSED_ERROR: u16 = 4011;

/// Dial `upstream_url` over `tokio-tungstenite`, retrying the initial
/// connect up to `UPSTREAM_CONNECT_MAX_ATTEMPTS` times, wire it to
/// `session`, and drain the queue built up while the dial was in flight.
async fn dial_upstream(state: Arc<AppState>, session: Arc<Session>, upstream_url: String) {
    let mut attempt = 0;
    let connection = loop {
        match tokio_tungstenite::connect_async(&upstream_url).await {
            Ok(conn) => break Ok(conn),
            Err(err) if attempt + 1 < UPSTREAM_CONNECT_MAX_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(%err, attempt, "upstream connect failed, retrying");
                state.metrics_upstream_reconnects.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(UPSTREAM_CONNECT_RETRY_GAP).await;
            }
            Err(err) => break Err(err),
        }
    };

    match connection {
        Ok((stream, _response)) => {
            let (sink, mut upstream_rx) = stream.split();
            let upstream = Arc::new(TungsteniteSink { sink: AsyncMutex::new(sink) });
            session.mark_upstream_open(upstream).await;

            while let Some(Ok(message)) = upstream_rx.next().await {
                use tokio_tungstenite::tungstenite::Message as TMessage;
                let frame = match message {
                    TMessage::Binary(b) => Some(Frame::Binary(b.to_vec())),
                    TMessage::Text(t) => Some(Frame::Text(t.to_string())),
                    TMessage::Close(_) => break,
                    _ => None,
                };
                if let Some(frame) = frame {
                    state.metrics_frames_forwarded.fetch_add(1, Ordering::Relaxed);
                    let len = match &frame {
                        Frame::Binary(b) => b.len(),
                        Frame::Text(t) => t.len(),
                    };
                    state.metrics_bytes_forwarded.fetch_add(len as u64, Ordering::Relaxed);
                    session.handle_upstream_frame(frame).await;
                }
            }
            session
                .mark_upstream_closed(UPSTREAM_CLOSED_CLEAN, "upstream closed".into())
                .await;
        }
        Err(err) => {
            session
                .mark_upstream_closed(UPSTREAM_CLOSED_ERROR, err.to_string())
                .await;
        }
    }
}

fn config_for(state: &AppState, session_id: &str, upstream_url: String, record: Option<String>, replay: Option<String>) -> ProxyConfig {
    ProxyConfig {
        session_id: session_id.to_string(),
        upstream_url,
        log_meta: state.config.logging.log_payload,
        record_id: record,
        replay_id: replay,
        recordings_dir: PathBuf::from(&state.config.server.recordings_dir),
    }
}

/// `proxy-ws`: the downstream WebSocket is bridged directly to an
/// already-addressable upstream WebSocket URL.
async fn handle_proxy_socket(
    state: Arc<AppState>,
    session_id: String,
    upstream_url: String,
    record: Option<String>,
    replay: Option<String>,
    socket: WebSocket,
) {
    let config = config_for(&state, &session_id, upstream_url, record, replay);
    run_proxy_session(state, config, socket).await;
}

/// `proxy-adb`: same as `proxy-ws`, except the upstream URL is resolved by
/// first establishing an `adb forward` for the requested device/remote.
async fn handle_proxy_adb_socket(
    state: Arc<AppState>,
    udid: String,
    remote: String,
    path: Option<String>,
    record: Option<String>,
    replay: Option<String>,
    socket: WebSocket,
) {
    let session_id = format!("{udid}:{remote}");
    let local_port = match pick_ephemeral_port().await {
        Ok(port) => port,
        Err(err) => {
            let (sink, _stream) = socket.split();
            let downstream = AxumWsSink { sink: AsyncMutex::new(sink) };
            let gateway_err = GatewayError::CapacityExhausted(err.to_string());
            downstream.close(gateway_err.close_code(), err.to_string()).await;
            return;
        }
    };
    let forward = Command::new("adb")
        .args(["-s", &udid, "forward", &format!("tcp:{local_port}"), &remote])
        .output()
        .await;
    if let Err(err) = forward {
        let (sink, _stream) = socket.split();
        let downstream = AxumWsSink { sink: AsyncMutex::new(sink) };
        let gateway_err = GatewayError::Upstream(err.to_string());
        downstream.close(gateway_err.close_code(), err.to_string()).await;
        return;
    }

    let upstream_url = format!("ws://127.0.0.1:{local_port}{}", path.as_deref().unwrap_or("/"));
    let config = config_for(&state, &session_id, upstream_url, record, replay);
    run_proxy_session(state, config, socket).await;
}

async fn run_proxy_session(state: Arc<AppState>, config: ProxyConfig, socket: WebSocket) {
    let session_id = config.session_id.clone();
    let upstream_url = config.upstream_url.clone();
    let (sink, mut stream) = socket.split();
    let downstream = Arc::new(AxumWsSink { sink: AsyncMutex::new(sink) });

    let session = Session::new(&config, downstream);
    state.sessions.write().await.insert(session_id.clone(), Arc::clone(&session));
    state.sync.register_target(session_id.clone(), session.clone()).await;

    tokio::spawn(dial_upstream(Arc::clone(&state), Arc::clone(&session), upstream_url));

    while let Some(Ok(message)) = stream.next().await {
        let frame = match message {
            Message::Binary(b) => Some(Frame::Binary(b.to_vec())),
            Message::Text(t) => Some(Frame::Text(t.to_string())),
            Message::Close(_) => break,
            _ => None,
        };
        if let Some(frame) = frame {
            if let Frame::Binary(bytes) = &frame {
                state.sync.mirror(&session_id, bytes).await;
            }
            state.metrics_frames_forwarded.fetch_add(1, Ordering::Relaxed);
            let len = match &frame {
                Frame::Binary(b) => b.len(),
                Frame::Text(t) => t.len(),
            };
            state.metrics_bytes_forwarded.fetch_add(len as u64, Ordering::Relaxed);
            session.handle_downstream_frame(frame).await;
        }
    }

    state.sessions.write().await.remove(&session_id);
    state.sync.unregister_target(&session_id).await;
}

/// `multiplex`: root multiplexer channel over the downstream socket. Each
/// peer-announced grandchild channel is dispatched by its 4-byte init tag:
/// `FSLS` opens a file-sync session (`fsls::PushReceiver` for `SEND`); any
/// other tag is treated as a nested ADB proxy channel addressed by
/// `"<udid>|<remote>"` in the remainder of the init payload.
async fn handle_multiplex_socket(state: Arc<AppState>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(AsyncMutex::new(sink));

    let (tx, mut outbound) = tokio::sync::mpsc::unbounded_channel();
    let (root, _root_data_rx, mut announce_rx) = mux::Channel::new_root(tx);

    let forward_sink = Arc::clone(&sink);
    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if forward_sink.lock().await.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    let state_for_announces = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(announce) = announce_rx.recv().await {
            tokio::spawn(dispatch_mux_announce(Arc::clone(&state_for_announces), announce));
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Binary(bytes) = message {
            if let Ok(frame) = tether_protocol::MuxFrame::decode(&bytes) {
                let _ = root.handle_inbound(frame).await;
            }
        }
    }
}

async fn dispatch_mux_announce(state: Arc<AppState>, announce: mux::ChannelAnnounce) {
    if announce.init.len() >= 4 && &announce.init[0..4] == b"FSLS" {
        run_fsls_session(state, announce).await;
    } else {
        run_nested_proxy_channel(state, announce).await;
    }
}

/// Wraps a mux grandchild channel's `RawBinaryData` traffic as an upstream
/// `FrameSink` for a `proxy::Session`, so nested channels reuse the same
/// recorder/player/control-op machinery as a top-level `proxy-adb` socket.
struct MuxChannelSink {
    channel: Arc<mux::Channel>,
}

#[async_trait::async_trait]
impl FrameSink for MuxChannelSink {
    async fn send_frame(&self, frame: Frame) {
        let bytes = match frame {
            Frame::Binary(b) => b,
            Frame::Text(t) => t.into_bytes(),
        };
        let _ = self.channel.send(tether_protocol::FrameType::RawBinaryData, bytes).await;
    }

    async fn close(&self, code: u16, reason: String) {
        let _ = self.channel.close(code, reason).await;
    }
}

async fn run_nested_proxy_channel(state: Arc<AppState>, mut announce: mux::ChannelAnnounce) {
    let init = String::from_utf8_lossy(&announce.init).into_owned();
    let Some((udid, remote)) = init.split_once('|') else {
        let err = GatewayError::BadParam("expected <udid>|<remote> init".into());
        let _ = announce.channel.close(err.close_code(), "expected <udid>|<remote> init".into()).await;
        return;
    };

    let local_port = match pick_ephemeral_port().await {
        Ok(port) => port,
        Err(_) => {
            let err = GatewayError::CapacityExhausted("no local port available".into());
            let _ = announce.channel.close(err.close_code(), "no local port available".into()).await;
            return;
        }
    };
    if Command::new("adb")
        .args(["-s", udid, "forward", &format!("tcp:{local_port}"), remote])
        .output()
        .await
        .is_err()
    {
        let err = GatewayError::Upstream("adb forward failed".into());
        let _ = announce.channel.close(err.close_code(), "adb forward failed".into()).await;
        return;
    }

    let session_id = format!("{udid}:{remote}:{}", announce.channel.id);
    let upstream_url = format!("ws://127.0.0.1:{local_port}/");
    let downstream = Arc::new(MuxChannelSink { channel: Arc::clone(&announce.channel) });
    let config = config_for(&state, &session_id, upstream_url.clone(), None, None);
    let session = Session::new(&config, downstream);
    state.sessions.write().await.insert(session_id.clone(), Arc::clone(&session));

    tokio::spawn(dial_upstream(Arc::clone(&state), Arc::clone(&session), upstream_url));

    while let Some(frame) = announce.data_rx.recv().await {
        if matches!(frame.frame_type, tether_protocol::FrameType::RawBinaryData | tether_protocol::FrameType::RawStringData) {
            state.metrics_frames_forwarded.fetch_add(1, Ordering::Relaxed);
            state.metrics_bytes_forwarded.fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
            session.handle_downstream_frame(Frame::Binary(frame.payload)).await;
        }
    }
    state.sessions.write().await.remove(&session_id);
}

/// An FSLS session is a mux channel that never carries data frames of its
/// own; every LIST/STAT/RECV/SEND operation arrives as a peer-announced
/// grandchild channel, tagged by its own 4-byte init opcode (spec §4.8).
async fn run_fsls_session(state: Arc<AppState>, mut announce: mux::ChannelAnnounce) {
    let base_dir = PathBuf::from(&state.config.server.uploads_dir).join("fsls-incoming");
    while let Some(child) = announce.announce_rx.recv().await {
        tokio::spawn(run_fsls_operation(base_dir.clone(), child));
    }
}

async fn run_fsls_operation(base_dir: PathBuf, mut child: mux::ChannelAnnounce) {
    if child.init.len() < 4 {
        let _ = child
            .channel
            .close(GatewayError::BadParam("FSLS op init too short".into()).close_code(), "bad init".into())
            .await;
        return;
    }
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&child.init[0..4]);
    let op = match fsls::FslsOp::from_tag(&tag) {
        Ok(op) => op,
        Err(err) => {
            let _ = child
                .channel
                .close(GatewayError::BadParam(err.to_string()).close_code(), err.to_string())
                .await;
            return;
        }
    };

    match op {
        fsls::FslsOp::List => run_fsls_list(&base_dir, &child).await,
        fsls::FslsOp::Stat => run_fsls_stat(&base_dir, &child).await,
        fsls::FslsOp::Recv => run_fsls_recv(&base_dir, &child).await,
        fsls::FslsOp::Send => run_fsls_send(&base_dir, &mut child).await,
    }
}

/// Reject absolute escapes (`..`) and confine every LIST/STAT/RECV lookup
/// to the FSLS staging directory rather than the caller-supplied path.
fn resolve_fsls_path(base_dir: &Path, requested: &str) -> Option<PathBuf> {
    let mut resolved = base_dir.to_path_buf();
    for component in Path::new(requested.trim_start_matches('/')).components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

async fn fail_fsls(channel: &Arc<mux::Channel>, msg: &str) {
    let _ = channel
        .send(tether_protocol::FrameType::RawBinaryData, fsls::encode_fail(msg))
        .await;
    let _ = channel
        .close(GatewayError::BadParam(msg.to_string()).close_code(), msg.to_string())
        .await;
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o040755 } else { 0o100644 }
}

fn mtime_secs(metadata: &std::fs::Metadata) -> u32 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

async fn run_fsls_list(base_dir: &Path, child: &mux::ChannelAnnounce) {
    let Ok(path) = fsls::decode_path_body(&child.init[4..]) else {
        fail_fsls(&child.channel, "bad LIST init body").await;
        return;
    };
    let Some(target) = resolve_fsls_path(base_dir, &path) else {
        fail_fsls(&child.channel, "path escapes the FSLS staging directory").await;
        return;
    };
    let mut entries = match tokio::fs::read_dir(&target).await {
        Ok(entries) => entries,
        Err(err) => {
            fail_fsls(&child.channel, &err.to_string()).await;
            return;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                let dent = fsls::DentFrame {
                    mode: unix_mode(&metadata),
                    size: metadata.len() as u32,
                    mtime_s: mtime_secs(&metadata),
                    name: entry.file_name().to_string_lossy().into_owned(),
                };
                if child
                    .channel
                    .send(tether_protocol::FrameType::RawBinaryData, dent.encode())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                fail_fsls(&child.channel, &err.to_string()).await;
                return;
            }
        }
    }
    let _ = child.channel.close(0, String::new()).await;
}

async fn run_fsls_stat(base_dir: &Path, child: &mux::ChannelAnnounce) {
    let Ok(path) = fsls::decode_path_body(&child.init[4..]) else {
        fail_fsls(&child.channel, "bad STAT init body").await;
        return;
    };
    let Some(target) = resolve_fsls_path(base_dir, &path) else {
        fail_fsls(&child.channel, "path escapes the FSLS staging directory").await;
        return;
    };
    match tokio::fs::metadata(&target).await {
        Ok(metadata) => {
            let stat = fsls::StatFrame {
                mode: unix_mode(&metadata),
                size: metadata.len() as u32,
                mtime_s: mtime_secs(&metadata),
            };
            let _ = child
                .channel
                .send(tether_protocol::FrameType::RawBinaryData, stat.encode())
                .await;
            let _ = child.channel.close(0, String::new()).await;
        }
        Err(err) => fail_fsls(&child.channel, &err.to_string()).await,
    }
}

async fn run_fsls_recv(base_dir: &Path, child: &mux::ChannelAnnounce) {
    let Ok(path) = fsls::decode_path_body(&child.init[4..]) else {
        fail_fsls(&child.channel, "bad RECV init body").await;
        return;
    };
    let Some(target) = resolve_fsls_path(base_dir, &path) else {
        fail_fsls(&child.channel, "path escapes the FSLS staging directory").await;
        return;
    };
    let mut file = match tokio::fs::File::open(&target).await {
        Ok(file) => file,
        Err(err) => {
            fail_fsls(&child.channel, &err.to_string()).await;
            return;
        }
    };
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        use tokio::io::AsyncReadExt;
        match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if child
                    .channel
                    .send(tether_protocol::FrameType::RawBinaryData, buf[..n].to_vec())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                fail_fsls(&child.channel, &err.to_string()).await;
                return;
            }
        }
    }
    let _ = child
        .channel
        .send(tether_protocol::FrameType::RawBinaryData, b"DONE".to_vec())
        .await;
    let _ = child.channel.close(0, String::new()).await;
}

async fn run_fsls_send(base_dir: &Path, child: &mut mux::ChannelAnnounce) {
    let mut receiver = fsls::PushReceiver::new(base_dir.to_path_buf());
    while let Some(frame) = child.data_rx.recv().await {
        if !matches!(frame.frame_type, tether_protocol::FrameType::RawBinaryData) {
            continue;
        }
        let Ok((id, push_frame)) = fsls::PushFrame::decode(&frame.payload) else {
            continue;
        };
        let is_finish = matches!(push_frame, fsls::PushFrame::Finish);
        match fsls::with_ack_timeout(is_finish, receiver.handle(id, push_frame)).await {
            Ok(Ok(ack_bytes)) => {
                let _ = child
                    .channel
                    .send(tether_protocol::FrameType::RawBinaryData, ack_bytes)
                    .await;
            }
            Ok(Err(err)) => {
                fail_fsls(&child.channel, &err.to_string()).await;
                return;
            }
            Err(err) => {
                fail_fsls(&child.channel, &err.to_string()).await;
                return;
            }
        }
    }
    let _ = child.channel.close(0, String::new()).await;
}

async fn handle_devices_list_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, _stream) = socket.split();
    let (snapshot, mut updates) = state.device_tracker.subscribe().await;
    if let Ok(text) = serde_json::to_string(&snapshot_json(&state, &snapshot).await) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    state.device_tracker.trigger_refresh().await;
    while let Ok(records) = updates.recv().await {
        if let Ok(text) = serde_json::to_string(&snapshot_json(&state, &records).await) {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    }
}

/// A tracker record's `recording_state` reflects the last coalesced ADB
/// poll, which knows nothing about live proxy sessions. Overlay the real
/// state from `AppState.sessions` here, matched by the `"<device-id>:..."`
/// session-id convention `handle_proxy_adb_socket`/`dispatch_mux_announce`
/// use.
async fn live_recording_state(
    state: &AppState,
    device_id: &str,
) -> crate::devices::RecordingState {
    use crate::devices::RecordingState;
    let prefix = format!("{device_id}:");
    let sessions = state.sessions.read().await;
    for (session_id, session) in sessions.iter() {
        if session_id == device_id || session_id.starts_with(&prefix) {
            return match session.state_name().await {
                "record" => RecordingState::Record,
                "run" => RecordingState::Run,
                "pause" => RecordingState::Pause,
                _ => RecordingState::Stop,
            };
        }
    }
    RecordingState::Stop
}

async fn snapshot_json(state: &AppState, records: &[crate::devices::DeviceRecord]) -> serde_json::Value {
    let mut devices = Vec::with_capacity(records.len());
    for r in records {
        let recording_state = live_recording_state(state, &r.id).await;
        devices.push(json!({
            "id": r.id,
            "transport": match r.transport { Transport::Usb => "usb", Transport::Wifi => "wifi" },
            "ipv4": r.ipv4,
            "hardwareSerial": r.hardware_serial,
            "recordingState": match recording_state {
                crate::devices::RecordingState::Stop => "stop",
                crate::devices::RecordingState::Record => "record",
                crate::devices::RecordingState::Run => "run",
                crate::devices::RecordingState::Pause => "pause",
            },
            "lastSeenMs": r.last_seen_ms.to_string(),
        }));
    }
    json!({ "devices": devices })
}

async fn handle_record_status_socket(state: Arc<AppState>, session_id: String, socket: WebSocket) {
    let (mut sink, _stream) = socket.split();
    let Some(session) = state.sessions.read().await.get(&session_id).cloned() else {
        let _ = sink
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1000,
                reason: "no such session".into(),
            })))
            .await;
        return;
    };
    let mut updates = session.subscribe_status();
    while let Ok(snapshot) = updates.recv().await {
        if let Ok(text) = serde_json::to_string(&snapshot) {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        AppState::new(GatewayConfig::default())
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_state();
        state.metrics_frames_forwarded.fetch_add(5, Ordering::Relaxed);
        state.metrics_recordings_started.fetch_add(1, Ordering::Relaxed);
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("tether_frames_forwarded_total 5"));
        assert!(text.contains("tether_recordings_started_total 1"));
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn start_recording_unknown_session_errors() {
        let app = build_router(test_state());
        let body = json!({ "session": "missing" }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/recordings/start")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_set_then_get_roundtrips() {
        let app = build_router(test_state());
        let body = json!({ "target": "deviceA", "devices": ["deviceB"] }).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync/set")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["mapping"]["deviceA"], json!(["deviceB"]));
    }
}
