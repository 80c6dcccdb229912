//! HTTP surface of the daemon.
//!
//! | Route                    | Handler                        |
//! |--------------------------|--------------------------------|
//! | `GET /playlist.m3u`      | filtered upstream playlist     |
//! | `GET /epg.xml`           | EPG passthrough                |
//! | `GET /groups`            | playlist group titles          |
//! | `GET /stream`            | default source or `?url=`      |
//! | `GET /stream/{channel}`  | named channel                  |
//! | `GET /sessions`          | live relay sessions            |
//! | `DELETE /sessions/{id}`  | stop one session               |
//! | `GET /health`            | liveness                       |

mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{delete, get};
use tower_http::trace::TraceLayer;

use tvrelay_core::Config;
use tvrelay_core::playlist::FilterRules;

use crate::relay::StreamRelay;
use crate::upstream::UpstreamClient;

const DEFAULT_CONTENT_TYPE: &str = "video/mp2t";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<StreamRelay>,
    pub upstream: Arc<UpstreamClient>,
    pub filter: Arc<FilterRules>,
    /// Rewrite playlist entries to point at this relay.
    pub rewrite_urls: bool,
    pub public_base_url: Option<String>,
    /// Content type of relayed streams.
    pub content_type: HeaderValue,
}

impl AppState {
    pub fn new(config: &Config, relay: Arc<StreamRelay>, upstream: Arc<UpstreamClient>) -> Self {
        let content_type = HeaderValue::from_str(&config.transcode.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        Self {
            relay,
            upstream,
            filter: Arc::new(FilterRules::from(&config.playlist)),
            rewrite_urls: config.playlist.rewrite_urls,
            public_base_url: config.server.public_base_url.clone(),
            content_type,
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/playlist.m3u", get(routes::playlist))
        .route("/epg.xml", get(routes::epg))
        .route("/groups", get(routes::groups))
        .route("/stream", get(routes::stream_default))
        .route("/stream/{channel}", get(routes::stream_channel))
        .route("/sessions", get(routes::list_sessions))
        .route("/sessions/{id}", delete(routes::stop_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
