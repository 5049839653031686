pub mod drivers;
pub mod location;
pub mod rides;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::AppError;
use crate::models::driver::GeoPoint;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(rides::router())
        .merge(location::router())
        .merge(drivers::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Coordinates as clients send them; either `lat`/`lng` or
/// `latitude`/`longitude`, validated before any lookup.
#[derive(Debug, Default, Deserialize)]
pub struct PointBody {
    #[serde(alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(alias = "longitude")]
    pub lng: Option<f64>,
}

impl PointBody {
    pub fn validate(&self, what: &str) -> Result<GeoPoint, AppError> {
        let (Some(lat), Some(lng)) = (self.lat, self.lng) else {
            return Err(AppError::BadRequest(format!("{what} latitude and longitude are required")));
        };

        let point = GeoPoint { lat, lng };
        if !point.is_valid() {
            return Err(AppError::BadRequest(format!("invalid {what} coordinates")));
        }
        Ok(point)
    }
}

pub fn required_point(body: Option<&PointBody>, what: &str) -> Result<GeoPoint, AppError> {
    body.ok_or_else(|| AppError::BadRequest(format!("{what} location is required")))?
        .validate(what)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.len().await,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
