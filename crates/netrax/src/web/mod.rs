//! Web server module: axum HTTP + WebSocket for browser access.
//!
//! - `GET /` - landing page with links
//! - `GET /video_feed` - MJPEG stream of the latest frame
//! - `GET /api/status` - server status
//! - `WS /ws` - periodic stats and gesture events

pub mod mjpeg;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Policy;
use crate::hub::BroadcastHub;
use crate::producer::ProducerMonitor;
use crate::state::SharedState;

use self::mjpeg::StreamEncoder;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html><body>
<h3>netrax capture server</h3>
<ul>
  <li><a href="/video_feed">/video_feed</a> - MJPEG stream for browser</li>
  <li>WebSocket endpoint: <code>/ws</code> (stats and gesture events)</li>
  <li><a href="/api/status">/api/status</a> - server status</li>
</ul>
</body></html>
"#;

/// Everything request handlers need
#[derive(Debug, Clone)]
pub struct WebContext {
    pub state: SharedState,
    pub hub: BroadcastHub,
    pub policy: Policy,
    pub producer: ProducerMonitor,
    /// Ends open streams and WebSocket connections
    pub cancel: CancellationToken,
}

/// Shared state for the web server
struct WebState {
    ctx: WebContext,
    start_time: Instant,
}

/// Build the router with every endpoint
pub fn router(ctx: WebContext) -> Router {
    let state = Arc::new(WebState {
        ctx,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener. Returns once `ctx.cancel` fires and
/// open connections have drained.
pub async fn serve(listener: TcpListener, ctx: WebContext) -> Result<()> {
    let cancel = ctx.cancel.clone();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

/// GET / - landing page
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed - one encoder per viewer
async fn video_feed(State(state): State<Arc<WebState>>) -> Response {
    let ctx = &state.ctx;
    StreamEncoder::new(ctx.state.clone(), &ctx.policy, ctx.cancel.clone()).into_response()
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let ctx = state.ctx.clone();
    ws.on_upgrade(move |socket| {
        ws::handle_ws(
            socket,
            ctx.state,
            ctx.hub,
            ctx.policy.stats_interval,
            ctx.cancel,
        )
    })
}

/// GET /api/status - server status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let hub = state.ctx.hub.stats();
    let producer = &state.ctx.producer;

    Json(serde_json::json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "subscribers": hub.subscribers,
        "events_published": hub.events_published,
        "events_delivered": hub.events_delivered,
        "subscribers_dropped": hub.subscribers_dropped,
        "producer_state": producer.state().as_str(),
        "adapter": producer.adapter_name(),
    }))
}
