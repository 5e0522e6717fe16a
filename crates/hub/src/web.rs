use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::db::{Db, HistoryRange};
use crate::device::{DeviceKind, DeviceStatus};
use crate::feed::{self, ChangeFeed, FeedEvent};
use crate::names::{status_key, status_str_key, value_key};
use crate::store::{SharedStore, Store, Value};

const MAX_HISTORY_ROWS: i64 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub db: Option<Db>,
    pub feed: ChangeFeed,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/keys", get(api_keys))
        .route("/api/values", get(api_get_values).put(api_put_values))
        .route("/api/settings", get(api_settings))
        .route("/api/devices", get(api_devices))
        .route("/api/history", get(api_history))
        .route("/ws", get(ws_feed))
        .with_state(state)
}

// -- Keys -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KeysQuery {
    #[serde(default)]
    prefix: String,
}

#[derive(Debug, Serialize)]
struct KeyInfo {
    key: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn api_keys(State(state): State<AppState>, Query(q): Query<KeysQuery>) -> impl IntoResponse {
    let keys: Vec<KeyInfo> = state
        .store
        .keys_by_prefix(&q.prefix)
        .into_iter()
        .map(|key| KeyInfo {
            kind: state.store.type_name(&key),
            key,
        })
        .collect();
    Json(keys)
}

// -- Settings ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SettingView {
    key: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    description: &'static str,
    default: serde_json::Value,
    value: serde_json::Value,
}

async fn api_settings(State(state): State<AppState>) -> impl IntoResponse {
    let settings: Vec<SettingView> = Config::default()
        .settings()
        .into_iter()
        .map(|s| SettingView {
            key: s.key,
            kind: s.value.kind().name(),
            description: s.description,
            default: s.value.to_json(),
            value: state
                .store
                .get_value(s.key)
                .map_or(serde_json::Value::Null, |v| v.to_json()),
        })
        .collect();
    Json(settings)
}

// -- Values -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ValuesQuery {
    /// Comma-separated key list. Without it, every key under `prefix`.
    keys: Option<String>,
    #[serde(default)]
    prefix: String,
}

#[derive(Debug, Serialize)]
struct TypedValue {
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
}

impl From<&Value> for TypedValue {
    fn from(v: &Value) -> Self {
        Self {
            kind: v.kind().name().to_string(),
            value: v.to_json(),
        }
    }
}

async fn api_get_values(
    State(state): State<AppState>,
    Query(q): Query<ValuesQuery>,
) -> impl IntoResponse {
    let Some(keys) = q.keys else {
        let values: BTreeMap<String, TypedValue> = state
            .store
            .snapshot(&q.prefix)
            .into_iter()
            .map(|(key, v)| (key, TypedValue::from(&v)))
            .collect();
        return Json(values);
    };

    let values: BTreeMap<String, TypedValue> = keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|key| {
            let typed = match state.store.get_value(key) {
                Some(v) => TypedValue::from(&v),
                None => TypedValue {
                    kind: "not_found".to_string(),
                    value: serde_json::Value::Null,
                },
            };
            (key.to_string(), typed)
        })
        .collect();
    Json(values)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteResult {
    Updated,
    Unchanged,
    /// The JSON did not fit the key's recorded type, or the setting would
    /// not validate.
    Rejected,
    /// No such key; new keys cannot be created over HTTP.
    Unknown,
}

/// Write each field of `body` into the store, converting it to the type the
/// key already holds. Settings are validated before they are written.
pub fn write_values(
    store: &Store,
    body: &serde_json::Map<String, serde_json::Value>,
) -> BTreeMap<String, WriteResult> {
    body.iter()
        .map(|(key, json)| {
            let result = match store.kind(key) {
                None => WriteResult::Unknown,
                Some(kind) => match Value::from_json(kind, json) {
                    None => WriteResult::Rejected,
                    Some(value) => {
                        if let Err(e) = config::check_setting(store, key, &value) {
                            warn!(key = %key, error = %format!("{e:#}"), "web: setting rejected");
                            WriteResult::Rejected
                        } else if store.set_value(key, value) {
                            WriteResult::Updated
                        } else {
                            WriteResult::Unchanged
                        }
                    }
                },
            };
            (key.clone(), result)
        })
        .collect()
}

async fn api_put_values(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Map<String, serde_json::Value>>,
) -> impl IntoResponse {
    let results = write_values(&state.store, &body);
    info!(fields = results.len(), "web: values written");
    Json(results)
}

// -- Devices ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DeviceView {
    device: &'static str,
    value: serde_json::Value,
    status: Option<DeviceStatus>,
    status_str: Option<String>,
}

async fn api_devices(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.store;
    let devices: Vec<DeviceView> = DeviceKind::ALL
        .into_iter()
        .map(|d| DeviceView {
            device: d.name(),
            value: store
                .get_value(&value_key(d.name()))
                .map_or(serde_json::Value::Null, |v| v.to_json()),
            status: store.get(&status_key(d.name())),
            status_str: store.get(&status_str_key(d.name())),
        })
        .collect();
    Json(devices)
}

// -- History ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    key: String,
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<i64>,
}

async fn api_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let Some(db) = &state.db else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "history is not recorded" })),
        )
            .into_response();
    };

    let range = HistoryRange {
        from: q.from,
        to: q.to,
        limit: q
            .limit
            .unwrap_or(HistoryRange::default().limit)
            .clamp(1, MAX_HISTORY_ROWS),
    };
    match db.query_history(&q.key, range).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(key = %q.key, error = %format!("{e:#}"), "web: history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "history query failed" })),
            )
                .into_response()
        }
    }
}

// -- Feed -------------------------------------------------------------------

async fn ws_feed(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_changes(socket, state))
}

/// Send the current snapshot, then every change as it happens. Each text
/// frame is a JSON array of events.
async fn stream_changes(mut socket: WebSocket, state: AppState) {
    let mut rx = state.feed.subscribe();
    let snapshot = feed::snapshot(&state.store);
    info!(keys = snapshot.len(), "web: feed client connected");
    if let Err(e) = send_events(&mut socket, &snapshot).await {
        debug!(error = %format!("{e:#}"), "web: feed snapshot not sent");
        return;
    }

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        match event {
            Ok(event) => {
                if send_events(&mut socket, &[event]).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "web: feed client lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    info!("web: feed client disconnected");
}

async fn send_events(socket: &mut WebSocket, events: &[FeedEvent]) -> Result<()> {
    let text = serde_json::to_string(events).context("failed to encode feed events")?;
    socket
        .send(Message::Text(text.into()))
        .await
        .context("failed to send feed frame")
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::PumpMode;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store: SharedStore = Arc::new(Store::new());
        store.set("pump.config.enabled", true);
        store.set("pump.config.mode", PumpMode::EbbNormal);
        store.set("pump.config.onTime", Duration::from_secs(15));
        store.set("lamp.config.onTime", 480_i64);
        store.set("pump.telem.status", DeviceStatus::Working);
        store.set("pump.telem.statusStr", "Works fine".to_string());
        let feed = ChangeFeed::attach(&store, 16);
        AppState {
            store,
            db: None,
            feed,
        }
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        // Rejections from the extractors come back as plain text.
        let json = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_req(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // -- Keys ---------------------------------------------------------------

    #[tokio::test]
    async fn keys_by_prefix_with_types() {
        let (status, json) = call(router(state()), get_req("/api/keys?prefix=pump.config.")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!([
                { "key": "pump.config.enabled", "type": "bool" },
                { "key": "pump.config.mode", "type": "pump_mode" },
                { "key": "pump.config.onTime", "type": "duration" },
            ])
        );
    }

    #[tokio::test]
    async fn keys_without_prefix_lists_everything() {
        let (_, json) = call(router(state()), get_req("/api/keys")).await;
        assert_eq!(json.as_array().unwrap().len(), 6);
    }

    // -- Values -------------------------------------------------------------

    #[tokio::test]
    async fn get_values_is_typed() {
        let (status, json) = call(
            router(state()),
            get_req("/api/values?keys=pump.config.onTime,lamp.config.onTime,nope"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pump.config.onTime"]["type"], "duration");
        assert_eq!(json["pump.config.onTime"]["value"], 15);
        assert_eq!(json["lamp.config.onTime"]["value"], 480);
        assert_eq!(json["nope"]["type"], "not_found");
        assert!(json["nope"]["value"].is_null());
    }

    #[tokio::test]
    async fn get_values_without_keys_snapshots_prefix() {
        let (status, json) = call(router(state()), get_req("/api/values?prefix=pump.telem.")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({
                "pump.telem.status": { "type": "device_status", "value": "Working" },
                "pump.telem.statusStr": { "type": "string", "value": "Works fine" },
            })
        );
    }

    #[tokio::test]
    async fn put_values_reports_each_key() {
        let st = state();
        let store = Arc::clone(&st.store);
        let body = serde_json::json!({
            "pump.config.mode": "ebb_swing",
            "pump.config.enabled": true,
            "lamp.config.onTime": "eight",
            "heater.config.enabled": true,
        });

        let (status, json) = call(router(st), put_req("/api/values", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pump.config.mode"], "updated");
        assert_eq!(json["pump.config.enabled"], "unchanged");
        assert_eq!(json["lamp.config.onTime"], "rejected");
        assert_eq!(json["heater.config.enabled"], "unknown");

        assert_eq!(
            store.get::<PumpMode>("pump.config.mode"),
            Some(PumpMode::EbbSwing)
        );
        assert_eq!(store.get::<i64>("lamp.config.onTime"), Some(480));
        assert!(!store.has("heater.config.enabled"));
    }

    #[tokio::test]
    async fn put_rejects_non_object_body() {
        let (status, _) = call(
            router(state()),
            put_req("/api/values", serde_json::json!([1, 2])),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn put_rejects_settings_that_fail_validation() {
        let st = state();
        let store = Arc::clone(&st.store);
        store.set("pump.config.validTime", Duration::from_secs(50));
        let body = serde_json::json!({
            "pump.config.validTime": 0,
            "pump.config.onTime": 0,
            "lamp.config.onTime": 1440,
        });

        let (status, json) = call(router(st), put_req("/api/values", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pump.config.validTime"], "rejected");
        assert_eq!(json["pump.config.onTime"], "rejected");
        assert_eq!(json["lamp.config.onTime"], "rejected");

        assert_eq!(
            store.get::<Duration>("pump.config.validTime"),
            Some(Duration::from_secs(50))
        );
        assert_eq!(
            store.get::<Duration>("pump.config.onTime"),
            Some(Duration::from_secs(15))
        );
        assert_eq!(store.get::<i64>("lamp.config.onTime"), Some(480));
    }

    #[tokio::test]
    async fn put_accepts_valid_settings() {
        let st = state();
        let store = Arc::clone(&st.store);
        let body = serde_json::json!({ "pump.config.onTime": 20, "lamp.config.onTime": 480 });

        let (_, json) = call(router(st), put_req("/api/values", body)).await;
        assert_eq!(json["pump.config.onTime"], "updated");
        assert_eq!(json["lamp.config.onTime"], "unchanged");
        assert_eq!(
            store.get::<Duration>("pump.config.onTime"),
            Some(Duration::from_secs(20))
        );
    }

    // -- Settings -----------------------------------------------------------

    #[tokio::test]
    async fn settings_show_schema_defaults_and_values() {
        let (status, json) = call(router(state()), get_req("/api/settings")).await;
        assert_eq!(status, StatusCode::OK);

        let settings = json.as_array().unwrap();
        assert_eq!(settings.len(), Config::default().settings().len());

        let on_time = settings
            .iter()
            .find(|s| s["key"] == "pump.config.onTime")
            .unwrap();
        assert_eq!(on_time["type"], "duration");
        assert_eq!(on_time["default"], 15);
        assert_eq!(on_time["value"], 15);

        let mac = settings
            .iter()
            .find(|s| s["key"] == "bridge.config.mac")
            .unwrap();
        assert_eq!(mac["default"], "E8:31:CD:D6:D1:B4");
        assert!(mac["value"].is_null());
    }

    // -- Devices ------------------------------------------------------------

    #[tokio::test]
    async fn devices_lists_every_device() {
        let (status, json) = call(router(state()), get_req("/api/devices")).await;
        assert_eq!(status, StatusCode::OK);

        let devices = json.as_array().unwrap();
        assert_eq!(devices.len(), DeviceKind::ALL.len());
        let pump = devices.iter().find(|d| d["device"] == "pump").unwrap();
        assert_eq!(pump["status"], "Working");
        assert_eq!(pump["status_str"], "Works fine");
        assert!(pump["value"].is_null());
    }

    // -- Feed ---------------------------------------------------------------

    #[tokio::test]
    async fn feed_needs_a_websocket_upgrade() {
        let (status, _) = call(router(state()), get_req("/ws")).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn feed_follows_writes_made_over_http() {
        let st = state();
        let mut rx = st.feed.subscribe();
        let body = serde_json::json!({ "pump.config.mode": "dripping" });

        call(router(st), put_req("/api/values", body)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "pump.config.mode");
        assert_eq!(event.kind, "pump_mode");
        assert_eq!(event.value, "dripping");
    }

    #[test]
    fn feed_snapshot_covers_the_test_state() {
        let st = state();
        let keys: Vec<String> = feed::snapshot(&st.store)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys.len(), 6);
        assert_eq!(keys.first().map(String::as_str), Some("lamp.config.onTime"));
    }

    // -- History ------------------------------------------------------------

    #[tokio::test]
    async fn history_without_db_is_unavailable() {
        let (status, _) = call(
            router(state()),
            get_req("/api/history?key=pump.telem.value"),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn history_with_db_returns_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.insert_sample(10, "pump.telem.value", &Value::Bool(true))
            .await
            .unwrap();
        let mut st = state();
        st.db = Some(db);

        let req = get_req("/api/history?key=pump.telem.value&limit=10");
        let (status, json) = call(router(st), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["ts"], 10);
        assert_eq!(json[0]["type"], "bool");
        assert_eq!(json[0]["value"], true);
    }
}
