use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::detector::MotionSample;
use crate::engine::RankingEngine;
use crate::player::ServerLookup;

/// Web API server - ranking, markers and playback state for the map front end
pub struct WebServer {
    engine: Arc<RankingEngine>,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<RankingEngine>,
}

#[derive(Deserialize)]
struct MarkerQuery {
    zoom: Option<u8>,
}

/// Body of a media server lookup reply; no servers means it timed out
#[derive(Deserialize)]
struct ServerInfoBody {
    play: Option<String>,
    publish: Option<String>,
}

impl WebServer {
    pub fn new(engine: Arc<RankingEngine>, config: Arc<Config>) -> Self {
        Self { engine, config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.config.web.enabled {
            info!("Web API disabled");
            return Ok(());
        }

        let app = router(self.engine.clone());

        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        info!("🌐 Web API listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn router(engine: Arc<RankingEngine>) -> Router {
    Router::new()
        .route("/api/stats", get(api_stats))
        .route("/api/ranking", get(api_ranking))
        .route("/api/markers", get(api_markers))
        .route("/api/session", get(api_session))
        .route("/api/player", get(api_player))
        .route("/api/player/server-info", post(api_server_info))
        .route("/api/capture/:name/ready", post(api_capture_ready))
        .route("/api/capture/:name/publish", post(api_capture_publish))
        .route("/api/locate/:stream", get(api_locate))
        .route("/api/motion/:stream", post(api_motion))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

/// Stats API
async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.get_stats())
}

/// Latest ranking: top3, best mix, per-stream and per-mix weights
async fn api_ranking(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let snapshot = state.engine.latest().ok_or(StatusCode::NO_CONTENT)?;
    Ok(Json(serde_json::json!(snapshot)))
}

/// Marker board at the given zoom (defaults to street level)
async fn api_markers(
    State(state): State<AppState>,
    Query(params): Query<MarkerQuery>,
) -> Json<serde_json::Value> {
    let zoom = params.zoom.unwrap_or(18);
    Json(serde_json::json!({
        "zoom": zoom,
        "markers": state.engine.marker_view(zoom),
    }))
}

async fn api_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.engine.session_labels()))
}

async fn api_player(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.player_stats())
}

async fn api_server_info(
    State(state): State<AppState>,
    Json(body): Json<ServerInfoBody>,
) -> Json<serde_json::Value> {
    let lookup = match (body.play, body.publish) {
        (Some(play), Some(publish)) => ServerLookup::Found { play, publish },
        _ => ServerLookup::Timeout,
    };
    let replayed = state.engine.server_info(lookup);
    Json(serde_json::json!({ "replayed": replayed }))
}

/// The page's capture element has its publish entry point wired
async fn api_capture_ready(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    state.engine.capture(&name).mark_ready();
    Json(serde_json::json!({ "name": name, "ready": true }))
}

/// Publish a capture element, waiting up to the retry budget for it to be ready
async fn api_capture_publish(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let target = state
        .engine
        .publish_capture(&name)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(serde_json::json!({ "name": name, "target": target })))
}

/// Where to pan for a go-to-stream click
async fn api_locate(
    State(state): State<AppState>,
    Path(stream): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let (lat, lng) = state.engine.locate(&stream).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!({ "stream": stream, "lat": lat, "lng": lng })))
}

/// Motion vector sample for the local detector bank
async fn api_motion(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(sample): Json<MotionSample>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let history = state.engine.feed_motion(&stream, sample).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!({ "stream": stream, "history": history })))
}
