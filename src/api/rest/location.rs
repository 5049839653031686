use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::rest::PointBody;
use crate::error::AppError;
use crate::geo::cell::{encode, FINE_PRECISION};
use crate::models::driver::LocationRecord;
use crate::models::user::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/location/update", post(update_location))
        .route("/api/location/current", get(current_location))
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    #[serde(flatten)]
    pub point: PointBody,
    pub address: Option<String>,
}

#[derive(Serialize)]
pub struct UpdateLocationResponse {
    pub message: &'static str,
    pub location: LocationRecord,
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<UpdateLocationResponse>, AppError> {
    let point = payload.point.validate("location")?;
    let geohash = encode(&point, FINE_PRECISION)?;
    let address = payload
        .address
        .filter(|address| !address.trim().is_empty())
        .unwrap_or_else(|| format!("{:.6}, {:.6}", point.lat, point.lng));

    if user.role == Role::Driver {
        state
            .repos
            .drivers
            .ensure_profile(user.id, &user.display_name())
            .await?;
    }

    let location = state
        .repos
        .locations(user.role)
        .upsert(user.id, point, address, geohash)
        .await?;

    debug!(user_id = %user.id, role = ?user.role, geohash = %location.geohash, "location updated");
    Ok(Json(UpdateLocationResponse {
        message: "location updated successfully",
        location,
    }))
}

async fn current_location(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<LocationRecord>, AppError> {
    let location = state
        .repos
        .locations(user.role)
        .current(user.id)
        .await?
        .ok_or_else(|| AppError::NotFound("no location data found".to_string()))?;

    Ok(Json(location))
}
