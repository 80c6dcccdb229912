#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! HTTP tests against the axum router.
//!
//! A local axum server plays the upstream playlist/EPG provider and
//! `/bin/sh` scripts stand in for the transcoder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, Response, StatusCode};
use axum::routing::get;
use tokio_stream::StreamExt;
use tower::ServiceExt;

use tvrelay_core::Config;
use tvrelay_daemon::relay::StreamRelay;
use tvrelay_daemon::server::routes::SESSION_HEADER;
use tvrelay_daemon::server::{AppState, build_router};
use tvrelay_daemon::session::SessionRegistry;
use tvrelay_daemon::upstream::UpstreamClient;

const PLAYLIST: &str = r#"#EXTM3U url-tvg="http://epg/guide.xml"
#EXTINF:-1 tvg-id="bbc1.uk" group-title="UK",BBC One
http://src/bbc1.ts
#EXTINF:-1 tvg-id="cnn.us" group-title="US",CNN
http://src/cnn.ts
#EXTINF:-1 tvg-id="itv.uk" group-title="UK",ITV
http://src/itv.ts
"#;

const EPG: &str = r#"<?xml version="1.0" encoding="UTF-8"?><tv><channel id="bbc1.uk"/></tv>"#;

/// Serve the fake provider on an ephemeral port.
async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/list.m3u", get(|| async { PLAYLIST }))
        .route("/guide.xml", get(|| async { EPG }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn base_config(script: &str) -> Config {
    let mut config = Config::default();
    config.transcode.program = "sh".into();
    config.transcode.args = vec!["-c".into(), script.into(), "relay".into(), "{url}".into()];
    config.transcode.terminate_timeout_secs = 2;
    config
        .channels
        .insert("X".into(), "http://src/X.ts".into());
    config
}

fn app(config: &Config) -> (Router, SessionRegistry) {
    config.validate().unwrap();
    let registry = SessionRegistry::new(config.transcode.max_sessions);
    let relay = Arc::new(StreamRelay::from_config(config, registry.clone()).unwrap());
    let upstream = Arc::new(UpstreamClient::new(config).unwrap());
    (
        build_router(AppState::new(config, relay, upstream)),
        registry,
    )
}

async fn send(app: &Router, method: Method, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "relay.local:5000")
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(resp: Response<Body>) -> String {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&body).into_owned()
}

async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
    let resp = send(app, Method::GET, uri).await;
    let status = resp.status();
    (status, body_text(resp).await)
}

// =========================================================================
// Playlist / EPG / groups
// =========================================================================

#[tokio::test]
async fn health_is_ok() {
    let (app, _) = app(&base_config("exit 0"));
    assert_eq!(get_text(&app, "/health").await, (StatusCode::OK, "ok".into()));
}

#[tokio::test]
async fn playlist_is_filtered_and_rewritten() {
    let upstream = spawn_upstream().await;
    let mut config = base_config("exit 0");
    config.sources.m3u_url = Some(format!("http://{upstream}/list.m3u"));
    config.playlist.include_groups = vec!["UK".into()];
    config.playlist.rewrite_urls = true;
    let (app, _) = app(&config);

    let resp = send(&app, Method::GET, "/playlist.m3u").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-mpegURL");
    let text = body_text(resp).await;

    assert!(text.starts_with("#EXTM3U url-tvg="));
    assert!(text.contains("BBC One"));
    assert!(text.contains("ITV"));
    assert!(!text.contains("CNN"), "US group should be filtered out");
    assert!(text.contains("http://relay.local:5000/stream?url=http%3A%2F%2Fsrc%2Fbbc1.ts"));
}

#[tokio::test]
async fn playlist_rewrite_prefers_public_base_url() {
    let upstream = spawn_upstream().await;
    let mut config = base_config("exit 0");
    config.sources.m3u_url = Some(format!("http://{upstream}/list.m3u"));
    config.playlist.rewrite_urls = true;
    config.server.public_base_url = Some("https://tv.example".into());
    let (app, _) = app(&config);

    let (status, text) = get_text(&app, "/playlist.m3u").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("https://tv.example/stream?url="));
    assert!(!text.contains("relay.local"));
}

#[tokio::test]
async fn epg_is_passed_through() {
    let upstream = spawn_upstream().await;
    let mut config = base_config("exit 0");
    config.sources.epg_url = Some(format!("http://{upstream}/guide.xml"));
    let (app, _) = app(&config);

    let resp = send(&app, Method::GET, "/epg.xml").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/xml");
    assert_eq!(body_text(resp).await, EPG);
}

#[tokio::test]
async fn groups_are_listed_as_json() {
    let upstream = spawn_upstream().await;
    let mut config = base_config("exit 0");
    config.sources.m3u_url = Some(format!("http://{upstream}/list.m3u"));
    let (app, _) = app(&config);

    let (status, text) = get_text(&app, "/groups").await;
    assert_eq!(status, StatusCode::OK);
    let groups: Vec<String> = serde_json::from_str(&text).unwrap();
    assert_eq!(groups, ["UK", "US"]);
}

#[tokio::test]
async fn unconfigured_sources_are_not_found() {
    let (app, _) = app(&base_config("exit 0"));
    assert_eq!(get_text(&app, "/playlist.m3u").await.0, StatusCode::NOT_FOUND);
    assert_eq!(get_text(&app, "/epg.xml").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let mut config = base_config("exit 0");
    // Nothing listens on port 9 of localhost.
    config.sources.epg_url = Some("http://127.0.0.1:9/guide.xml".into());
    config.cache.fetch_timeout_secs = 2;
    let (app, _) = app(&config);
    assert_eq!(get_text(&app, "/epg.xml").await.0, StatusCode::BAD_GATEWAY);
}

// =========================================================================
// Streaming
// =========================================================================

#[tokio::test]
async fn channel_stream_returns_transcoder_output() {
    let (app, registry) = app(&base_config("printf hello; printf ' %s' \"$1\""));

    let resp = send(&app, Method::GET, "/stream/X").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "video/mp2t");
    assert_eq!(resp.headers()["cache-control"], "no-store");
    assert!(resp.headers().contains_key(SESSION_HEADER));

    assert_eq!(body_text(resp).await, "hello http://src/X.ts");
    assert!(registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn raw_url_stream_is_relayed() {
    let (app, _) = app(&base_config(r#"printf '%s' "$1""#));
    let (status, text) = get_text(&app, "/stream?url=http%3A%2F%2Fcdn%2Flive.m3u8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "http://cdn/live.m3u8");
}

#[tokio::test]
async fn resolution_errors_are_bad_request() {
    let (app, registry) = app(&base_config("exit 0"));
    assert_eq!(get_text(&app, "/stream/nope").await.0, StatusCode::BAD_REQUEST);
    assert_eq!(
        get_text(&app, "/stream?url=file%3A%2F%2F%2Fetc%2Fpasswd").await.0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get_text(&app, "/stream/X?origin=http%3A%2F%2Fa%0D%0AX-Injected%3A%201").await.0,
        StatusCode::BAD_REQUEST
    );
    // No default source configured.
    assert_eq!(get_text(&app, "/stream").await.0, StatusCode::BAD_REQUEST);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn failing_transcoder_is_bad_gateway() {
    let (app, _) = app(&base_config("echo 'connection refused' >&2; exit 1"));
    let (status, text) = get_text(&app, "/stream/X").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(text.contains("without producing output"), "body: {text}");
}

#[tokio::test]
async fn missing_transcoder_is_server_error() {
    let mut config = base_config("exit 0");
    config.transcode.program = "/nonexistent/transcoder".into();
    let (app, _) = app(&config);
    assert_eq!(
        get_text(&app, "/stream/X").await.0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

// =========================================================================
// Sessions
// =========================================================================

#[tokio::test]
async fn sessions_are_listed_limited_and_stoppable() {
    let mut config = base_config("printf one; exec sleep 30");
    config.transcode.max_sessions = 1;
    let (app, registry) = app(&config);

    let first = send(&app, Method::GET, "/stream/X").await;
    assert_eq!(first.status(), StatusCode::OK);
    let id = first.headers()[SESSION_HEADER].to_str().unwrap().to_string();
    let mut body = first.into_body().into_data_stream();
    assert_eq!(body.next().await.unwrap().unwrap(), "one");

    let (status, text) = get_text(&app, "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let sessions: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["id"], id.as_str());
    assert_eq!(sessions[0]["label"], "channel:X");
    assert_eq!(sessions[0]["state"], "streaming");
    assert_eq!(sessions[0]["bytes_sent"], 3);

    assert_eq!(
        get_text(&app, "/stream/X").await.0,
        StatusCode::SERVICE_UNAVAILABLE
    );

    let stop = send(&app, Method::DELETE, &format!("/sessions/{id}")).await;
    assert_eq!(stop.status(), StatusCode::NO_CONTENT);

    // The body ends once the session has been torn down.
    let rest = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap();
    assert!(rest.is_none());
    assert!(registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn dropped_response_ends_session() {
    let (app, registry) = app(&base_config("printf one; exec sleep 30"));

    let resp = send(&app, Method::GET, "/stream/X").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(registry.active_count(), 1);

    drop(resp);
    assert!(registry.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn stopping_unknown_session_is_not_found() {
    let (app, _) = app(&base_config("exit 0"));
    let uri = format!("/sessions/{}", uuid::Uuid::new_v4());
    assert_eq!(
        send(&app, Method::DELETE, &uri).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        send(&app, Method::DELETE, "/sessions/not-a-uuid").await.status(),
        StatusCode::BAD_REQUEST
    );
}
