//! Route handlers.

use std::collections::BTreeSet;
use std::io;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use tvrelay_core::playlist::{self, Playlist};
use tvrelay_core::{RelayRequest, UpstreamHeaders};

use crate::relay::RelayError;
use crate::session::{SessionError, SessionInfo};
use crate::upstream::UpstreamError;

use super::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/x-mpegURL";
const EPG_CONTENT_TYPE: &str = "application/xml";

/// Response header carrying the relay session id.
pub const SESSION_HEADER: &str = "x-relay-session";

/// Query parameters accepted by the stream routes.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Raw upstream URL. Only honoured by `GET /stream`.
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl StreamQuery {
    fn headers(&self) -> UpstreamHeaders {
        UpstreamHeaders {
            user_agent: self.user_agent.clone(),
            referer: self.referer.clone(),
            origin: self.origin.clone(),
        }
    }
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

/// `GET /playlist.m3u`: filtered playlist, entries optionally rewritten to
/// stream through this relay.
pub async fn playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, UpstreamError> {
    let raw = state.upstream.playlist().await?;
    let mut playlist = Playlist::parse(&raw);
    playlist.retain(&state.filter);

    if state.rewrite_urls {
        if let Some(base) = public_base(&state, &headers) {
            playlist.rewrite_urls(&base);
        } else {
            debug!("No public base URL or Host header, leaving playlist URLs as-is");
        }
    }

    Ok(([(CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], playlist.render()).into_response())
}

/// `GET /epg.xml`
pub async fn epg(State(state): State<AppState>) -> Result<Response, UpstreamError> {
    let body = state.upstream.epg().await?;
    Ok(([(CONTENT_TYPE, EPG_CONTENT_TYPE)], body).into_response())
}

/// `GET /groups`
pub async fn groups(
    State(state): State<AppState>,
) -> Result<Json<BTreeSet<String>>, UpstreamError> {
    let raw = state.upstream.playlist().await?;
    Ok(Json(playlist::group_titles(&raw)))
}

/// `GET /stream`: the configured default source, or `?url=`.
pub async fn stream_default(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, RelayError> {
    let request = match query.url.as_deref() {
        Some(url) => RelayRequest::url(url),
        None => RelayRequest::default_source(),
    };
    start_stream(&state, request.with_headers(query.headers())).await
}

/// `GET /stream/{channel}`
pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, RelayError> {
    let request = RelayRequest::channel(channel).with_headers(query.headers());
    start_stream(&state, request).await
}

/// `GET /sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.relay.registry().list())
}

/// `DELETE /sessions/{id}`
pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, SessionError> {
    state.relay.registry().stop(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Open a relay session and hand its output to a streaming body.
///
/// The status code is decided once the first chunk is available; after that
/// the copy loop runs in its own task and ends when the body is dropped.
async fn start_stream(state: &AppState, request: RelayRequest) -> Result<Response, RelayError> {
    let session = state.relay.open(&request).await?;
    let session_id = session.id();

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
    tokio::spawn(async move {
        let outcome = session.pump(tx).await;
        debug!(session_id = %outcome.session_id, end = ?outcome.end, "Stream task finished");
    });

    let mut response = Body::from_stream(ReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, state.content_type.clone());
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    Ok(response)
}

/// Base URL for rewritten playlist entries: the configured public URL, or
/// `http://{Host}` of the incoming request.
fn public_base(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if let Some(base) = state.public_base_url.as_deref().filter(|b| !b.is_empty()) {
        return Some(base.to_string());
    }
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("http://{host}"))
}
