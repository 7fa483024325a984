use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    scanner::{ScanHandle, Scanner},
    types::{Protocol, ScanEvent, ScanRequest},
};

pub const SCAN_ID_HEADER: &str = "x-scan-id";
/// Cookie carrying the id of the caller's most recent scan.
pub const SCAN_COOKIE: &str = "portwatch_scan";
pub const INVALID_TARGET_RESPONSE: &str = "Invalid target hostname or IP address.";

#[derive(Clone)]
pub struct AppState {
    scanner: Scanner,
    sessions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>, // one token per running scan
}

impl AppState {
    pub fn new(scanner: Scanner) -> Self {
        Self {
            scanner,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn register(&self, id: Uuid, token: CancellationToken) {
        if let Ok(mut s) = self.sessions.lock() {
            s.insert(id, token);
        }
    }

    fn deregister(&self, id: &Uuid) {
        if let Ok(mut s) = self.sessions.lock() {
            s.remove(id);
        }
    }

    /// Cancel the session registered under `id`. False when it is not running.
    fn cancel(&self, id: &Uuid) -> bool {
        let Ok(sessions) = self.sessions.lock() else {
            return false;
        };
        match sessions.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub active_scans: usize,
    pub concurrency: usize,
    pub os_detection: bool,
}

/// Port fields arrive as numbers from the UI but are also accepted as numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn value(&self) -> Option<u32> {
        let n = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s.trim().parse::<u64>().ok()?,
        };
        u32::try_from(n).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    pub target: String,
    pub start_port: PortValue,
    pub end_port: PortValue,
    pub scan_type: String,
}

#[derive(Debug, Deserialize)]
pub struct CommonScanBody {
    pub target: String,
    pub scan_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub scan_id: Option<Uuid>,
}

/// API routes plus a static file fallback rooted at `ui_dir`.
pub fn router(state: AppState, ui_dir: &Path) -> Router {
    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);

    Router::new()
        .route("/scan", post(post_scan))
        .route("/scan_common", post(post_scan_common))
        .route("/cancel_scan", post(post_cancel))
        .route("/api/status", get(get_status))
        .with_state(state)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(config: &ServerConfig, scanner: Scanner) -> Result<()> {
    let app = router(AppState::new(scanner), &config.ui_dir);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, ui_dir = %config.ui_dir.display(), "serving");
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let cfg = app.scanner.config();
    let out = Status {
        active_scans: app.active_sessions(),
        concurrency: cfg.concurrency,
        os_detection: cfg.os_detection,
    };
    (StatusCode::OK, Json(out))
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanBody>) -> Response {
    if !is_valid_target(&req.target) {
        return bad_request(INVALID_TARGET_RESPONSE);
    }
    let protocol = match req.scan_type.parse::<Protocol>() {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let (Some(start), Some(end)) = (req.start_port.value(), req.end_port.value()) else {
        return bad_request("start_port and end_port must be integers");
    };
    match ScanRequest::new(req.target.trim(), start, end, protocol) {
        Ok(request) => start_stream(&app, request),
        Err(e) => bad_request(&e.to_string()),
    }
}

async fn post_scan_common(State(app): State<AppState>, Json(req): Json<CommonScanBody>) -> Response {
    if !is_valid_target(&req.target) {
        return bad_request(INVALID_TARGET_RESPONSE);
    }
    let protocol = match req.scan_type.parse::<Protocol>() {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    match ScanRequest::common(req.target.trim(), protocol) {
        Ok(request) => start_stream(&app, request),
        Err(e) => bad_request(&e.to_string()),
    }
}

/// Cancels the scan named by `scan_id` in the body, else the one in the caller's
/// scan cookie. Never touches other sessions.
async fn post_cancel(State(app): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        Ok(CancelBody::default())
    } else {
        serde_json::from_slice::<CancelBody>(&body)
    };
    let body = match parsed {
        Ok(b) => b,
        Err(e) => return bad_request(&format!("invalid cancel request: {e}")),
    };

    let Some(id) = body.scan_id.or_else(|| scan_cookie(&headers)) else {
        return bad_request("no scan to cancel: pass scan_id or the scan cookie");
    };
    if !app.cancel(&id) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown scan id"}))).into_response();
    }
    info!(scan_id = %id, "cancel requested");
    (
        StatusCode::OK,
        Json(json!({"status": "Scan cancelled", "scan_id": id})),
    )
        .into_response()
}

fn scan_cookie(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SCAN_COOKIE)
        .and_then(|(_, value)| value.trim().parse().ok())
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

fn start_stream(app: &AppState, request: ScanRequest) -> Response {
    let id = Uuid::new_v4();
    let handle = app.scanner.start(request);
    app.register(id, handle.cancel_token());
    debug!(scan_id = %id, "scan session registered");

    let stream = event_stream(app.clone(), id, handle);
    (
        [
            (HeaderName::from_static(SCAN_ID_HEADER), id.to_string()),
            (
                header::SET_COOKIE,
                format!("{SCAN_COOKIE}={id}; Path=/; HttpOnly; SameSite=Strict"),
            ),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// Lives as long as the response body. Dropping it cancels the scan and
/// removes it from the registry, which covers both normal end and client disconnect.
struct SessionGuard {
    app: AppState,
    id: Uuid,
    _cancel: DropGuard,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.app.deregister(&self.id);
        debug!(scan_id = %self.id, "scan session closed");
    }
}

fn event_stream(
    app: AppState,
    id: Uuid,
    handle: ScanHandle,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (rx, cancel) = handle.into_parts();
    let guard = SessionGuard {
        app,
        id,
        _cancel: cancel.drop_guard(),
    };
    stream::unfold(
        (rx, guard),
        |(mut rx, guard): (mpsc::Receiver<ScanEvent>, SessionGuard)| async move {
            let ev = rx.recv().await?;
            let event = Event::default().json_data(&ev).unwrap_or_else(|e| {
                warn!(error = %e, "failed to encode scan event");
                Event::default().data(r#"{"complete":true,"error":"internal encoding error"}"#)
            });
            Some((Ok::<_, Infallible>(event), (rx, guard)))
        },
    )
}

const LABEL_PATTERN: &str = r"^[A-Za-z0-9-]{1,63}$";

fn label_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LABEL_PATTERN).ok()).as_ref()
}

/// Accept a dotted-quad IPv4 literal or a syntactically valid hostname.
pub fn is_valid_target(target: &str) -> bool {
    let t = target.trim();
    t.parse::<Ipv4Addr>().is_ok() || is_valid_hostname(t)
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        label_re().is_some_and(|re| re.is_match(label))
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
