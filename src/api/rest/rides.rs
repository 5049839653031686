use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::rest::{required_point, PointBody};
use crate::engine::discovery::find_candidates;
use crate::engine::dispatcher::{
    self, AcceptedRide, RequestedRide, RideRequest, RideStatusView,
};
use crate::error::AppError;
use crate::models::driver::CandidateDriver;
use crate::models::ride::{RideRecord, RideStatus, StatusTransition, Waypoint};
use crate::models::user::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/rides/find-drivers", post(find_drivers))
        .route("/api/rides/request", post(request_ride))
        .route("/api/rides/active", get(active_ride))
        .route("/api/rides/history", get(ride_history))
        .route("/api/rides/:ride_id/accept", post(accept_ride))
        .route("/api/rides/:ride_id/reject", post(reject_ride))
        .route("/api/rides/:ride_id/cancel", post(cancel_ride))
        .route("/api/rides/:ride_id/start", post(start_ride))
        .route("/api/rides/:ride_id/complete", post(complete_ride))
        .route("/api/rides/:ride_id/status", get(ride_status))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindDriversRequest {
    pub pickup_location: Option<PointBody>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindDriversResponse {
    pub drivers: Vec<CandidateDriver>,
    pub total_found: usize,
    pub search_radius: f64,
    pub geohash: String,
}

async fn find_drivers(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<FindDriversRequest>,
) -> Result<Json<FindDriversResponse>, AppError> {
    user.require(Role::Consumer, "search for drivers")?;
    let pickup = required_point(payload.pickup_location.as_ref(), "pickup")?;

    let discovery = find_candidates(
        state.repos.drivers.as_ref(),
        &state.settings,
        &state.metrics,
        &pickup,
    )
    .await?;

    Ok(Json(FindDriversResponse {
        total_found: discovery.drivers.len(),
        drivers: discovery.drivers,
        search_radius: state.settings.search_radius_km,
        geohash: discovery.area.primary,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideRequest {
    pub pickup_location: Option<PointBody>,
    pub drop_location: Option<PointBody>,
    #[serde(default)]
    pub pickup_address: String,
    #[serde(default)]
    pub drop_address: String,
    #[serde(default)]
    pub driver_queue: Vec<CandidateDriver>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideResponse {
    pub ride_id: Uuid,
    pub ride: RequestedRide,
}

async fn request_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<CreateRideResponse>), AppError> {
    user.require(Role::Consumer, "request rides")?;

    let pickup = required_point(payload.pickup_location.as_ref(), "pickup")?;
    let drop = required_point(payload.drop_location.as_ref(), "drop")?;

    let ride = dispatcher::request_ride(
        &state,
        &user,
        RideRequest {
            pickup: Waypoint {
                point: pickup,
                address: payload.pickup_address,
            },
            drop: Waypoint {
                point: drop,
                address: payload.drop_address,
            },
            driver_queue: payload.driver_queue,
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRideResponse {
            ride_id: ride.id,
            ride,
        }),
    ))
}

#[derive(Serialize)]
pub struct AcceptRideResponse {
    pub message: &'static str,
    pub ride: AcceptedRide,
}

async fn accept_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<AcceptRideResponse>, AppError> {
    user.require(Role::Driver, "accept rides")?;
    let ride = dispatcher::accept_ride(&state, &user, ride_id).await?;

    Ok(Json(AcceptRideResponse {
        message: "ride accepted successfully",
        ride,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideMessage {
    pub message: &'static str,
    pub ride_id: Uuid,
}

async fn reject_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideMessage>, AppError> {
    user.require(Role::Driver, "reject rides")?;
    dispatcher::reject_ride(&state, &user, ride_id).await?;

    Ok(Json(RideMessage {
        message: "ride rejected, moving to next driver",
        ride_id,
    }))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideRecord>, AppError> {
    user.require(Role::Consumer, "cancel rides")?;
    let ride = dispatcher::cancel_ride(&state, &user, ride_id).await?;
    Ok(Json(ride))
}

async fn start_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideMessage>, AppError> {
    user.require(Role::Driver, "start rides")?;

    state
        .repos
        .rides
        .update_status(ride_id, StatusTransition::start(user.id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found or cannot be started")))?;

    tracing::info!(ride_id = %ride_id, driver_id = %user.id, "ride started");
    Ok(Json(RideMessage {
        message: "ride started successfully",
        ride_id,
    }))
}

async fn complete_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideMessage>, AppError> {
    user.require(Role::Driver, "complete rides")?;

    state
        .repos
        .rides
        .update_status(ride_id, StatusTransition::complete(user.id))
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("ride {ride_id} not found or cannot be completed"))
        })?;

    tracing::info!(ride_id = %ride_id, driver_id = %user.id, "ride completed");
    Ok(Json(RideMessage {
        message: "ride completed successfully",
        ride_id,
    }))
}

async fn ride_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideStatusView>, AppError> {
    Ok(Json(dispatcher::ride_status(&state, &user, ride_id).await?))
}

#[derive(Serialize)]
pub struct ActiveRideResponse {
    pub ride: Option<RideRecord>,
}

async fn active_ride(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<ActiveRideResponse>, AppError> {
    let rides = state
        .repos
        .rides
        .find_by_participant(
            user.role,
            user.id,
            &[RideStatus::Accepted, RideStatus::InProgress],
        )
        .await?;

    Ok(Json(ActiveRideResponse {
        ride: rides.into_iter().next(),
    }))
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub rides: Vec<RideRecord>,
    pub pagination: Pagination,
}

async fn ride_history(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).clamp(1, 100);

    let completed = state
        .repos
        .rides
        .find_by_participant(user.role, user.id, &[RideStatus::Completed])
        .await?;
    let total = completed.len();

    let rides = completed
        .into_iter()
        .skip((page - 1) * limit)
        .take(limit)
        .collect();

    Ok(Json(HistoryResponse {
        rides,
        pagination: Pagination { page, limit, total },
    }))
}
