use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::dispatcher::{pending_offers, PendingOffer};
use crate::error::AppError;
use crate::models::driver::DriverProfile;
use crate::models::user::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/driver/pending-rides", get(pending_rides))
        .route("/api/driver/availability", put(update_availability))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRidesResponse {
    pub pending_rides: Vec<PendingOffer>,
    pub count: usize,
}

async fn pending_rides(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<PendingRidesResponse>, AppError> {
    user.require(Role::Driver, "view pending rides")?;
    let pending_rides = pending_offers(&state, &user).await;

    Ok(Json(PendingRidesResponse {
        count: pending_rides.len(),
        pending_rides,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRequest {
    pub is_available: bool,
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<DriverProfile>, AppError> {
    user.require(Role::Driver, "change availability")?;

    state
        .repos
        .drivers
        .ensure_profile(user.id, &user.display_name())
        .await?;
    let profile = state
        .repos
        .drivers
        .set_availability(user.id, payload.is_available)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {} not found", user.id)))?;

    tracing::info!(driver_id = %user.id, is_available = profile.is_available, "availability updated");
    Ok(Json(profile))
}
