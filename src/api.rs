//! HTTP operator surface.
//!
//! The endpoints mirror what the circulation frontend already speaks:
//! query-parameter GETs, MAC-keyed JSON tag maps, and an `events/`
//! Server-Sent-Events stream with `addTag`/`removeTag` messages.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::reader::{Mode, Reader};
use crate::tag::{InventoryMap, Tag, Uid};
use crate::transport::{CounterSnapshot, ReaderInfo, AFI_ALARM_OFF, AFI_ALARM_ON};

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<Reader>,
}

type ApiError = (StatusCode, String);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scan", get(scan_once))
        .route("/start", get(start_scan))
        .route("/stop", get(stop_scan))
        .route("/write", get(write_all))
        .route("/writetagbarcode", get(write_tag_barcode))
        .route("/alarmOn", get(alarm_on))
        .route("/alarmOff", get(alarm_off))
        .route("/events/", get(events))
        .route("/.status", get(status))
}

// ── Scan control ────────────────────────────────────────────────────────────

async fn scan_once(State(state): State<AppState>) -> Json<InventoryMap> {
    Json(state.reader.read_once().await)
}

async fn start_scan(State(state): State<AppState>) -> StatusCode {
    state.reader.set_mode(Mode::Scan);
    StatusCode::OK
}

async fn stop_scan(State(state): State<AppState>) -> StatusCode {
    state.reader.set_mode(Mode::Idle);
    StatusCode::OK
}

// ── Write operations ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WriteQuery {
    barcode: Option<String>,
}

async fn write_all(
    State(state): State<AppState>,
    Query(query): Query<WriteQuery>,
) -> Result<Json<InventoryMap>, ApiError> {
    let barcode = query
        .barcode
        .filter(|b| !b.is_empty())
        .ok_or_else(|| bad_request("Url Param 'barcode' is missing"))?;
    if state.reader.inventory_is_empty() {
        return Err(bad_request("Inventory empty"));
    }
    state
        .reader
        .write_barcode_all(&barcode)
        .await
        .map(Json)
        .map_err(|e| bad_request(format!("Error writing inventory: {e}")))
}

#[derive(Deserialize)]
struct WriteTagQuery {
    tagid: Option<String>,
    barcode: Option<String>,
}

async fn write_tag_barcode(
    State(state): State<AppState>,
    Query(query): Query<WriteTagQuery>,
) -> Result<Json<Tag>, ApiError> {
    let tagid = query
        .tagid
        .filter(|t| !t.is_empty())
        .ok_or_else(|| bad_request("Url Param 'tagid' is missing"))?;
    let barcode = query
        .barcode
        .filter(|b| !b.is_empty())
        .ok_or_else(|| bad_request("Url Param 'barcode' is missing"))?;
    let uid: Uid = tagid
        .parse()
        .map_err(|_| bad_request("Url Param 'tagid' is not a tag id"))?;
    if state.reader.inventory_is_empty() {
        return Err(bad_request("Inventory empty"));
    }
    match state.reader.write_tag_barcode(uid, &barcode).await {
        Ok(Some(tag)) => Ok(Json(tag)),
        Ok(None) => Err(bad_request("Tag not in inventory")),
        Err(e) => Err(bad_request(format!("Error writing tag: {e}"))),
    }
}

// ── Anti-theft AFI ──────────────────────────────────────────────────────────

async fn alarm_on(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    set_alarm(&state, AFI_ALARM_ON).await
}

async fn alarm_off(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    set_alarm(&state, AFI_ALARM_OFF).await
}

async fn set_alarm(state: &AppState, afi: u8) -> Result<&'static str, ApiError> {
    if state.reader.inventory_is_empty() {
        return Err(bad_request("Inventory empty"));
    }
    state.reader.set_afi_all(afi).await.map_err(|(uid, e)| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed setting alarm on {uid}: {e}"),
        )
    })?;
    Ok("OK")
}

// ── Event stream ────────────────────────────────────────────────────────────

async fn events(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let subscription = state.reader.clone().subscribe().await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Busy, only one event stream at a time".to_string(),
        )
    })?;
    let stream = subscription
        .map(|msg| Ok::<Event, Infallible>(Event::default().event(msg.event).data(msg.data)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServerStatus {
    uptime: String,
    reader: ReaderStatus,
    last_inventory: InventoryMap,
    client: Option<String>,
    mode: String,
}

#[derive(Serialize)]
struct ReaderStatus {
    #[serde(flatten)]
    info: ReaderInfo,
    #[serde(flatten)]
    counters: CounterSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<ServerStatus> {
    let reader = &state.reader;
    Json(ServerStatus {
        uptime: format!("{:?}", reader.uptime()),
        reader: ReaderStatus {
            info: reader.info.clone(),
            counters: reader.counters.snapshot(),
        },
        last_inventory: reader.snapshot(),
        client: local_ip(),
        mode: reader.mode().as_str().to_string(),
    })
}

/// Outbound address as seen by a dummy UDP socket; nothing is sent.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
