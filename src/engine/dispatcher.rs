//! Drives dispatch sessions: ride creation, sequential offers guarded by a
//! timeout, rollover, acceptance and cancellation.
//!
//! Every mutation takes the ride's session lock first. The ride store's
//! conditional update is what finally decides a race between acceptors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::registry::SessionHandle;
use crate::engine::session::{DispatchSession, OfferView, Rollover, SessionStatus};
use crate::error::AppError;
use crate::geo::{haversine_km, round_km};
use crate::models::driver::{CandidateDriver, GeoPoint};
use crate::models::event::DispatchEvent;
use crate::models::ride::{NewRide, RideRecord, RideStatus, StatusTransition, Waypoint};
use crate::models::user::{AuthUser, Role};
use crate::state::AppState;

const BASE_FARE: f64 = 50.0;
const FARE_PER_KM: f64 = 15.0;
const ASSUMED_SPEED_KMH: f64 = 25.0;

pub fn fare_for(distance_km: f64) -> i64 {
    (BASE_FARE + distance_km * FARE_PER_KM).round() as i64
}

pub fn eta_minutes(distance_km: f64) -> i64 {
    (distance_km / ASSUMED_SPEED_KMH * 60.0).round() as i64
}

#[derive(Debug, Clone)]
pub struct RideRequest {
    pub pickup: Waypoint,
    pub drop: Waypoint,
    pub driver_queue: Vec<CandidateDriver>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedRide {
    pub id: Uuid,
    pub pickup_location: GeoPoint,
    pub drop_location: GeoPoint,
    pub pickup_address: String,
    pub drop_address: String,
    pub distance: f64,
    pub fare: i64,
    pub status: SessionStatus,
    pub current_driver: CandidateDriver,
    pub queue_position: usize,
    pub total_drivers: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedRide {
    pub ride_id: Uuid,
    pub driver_location: GeoPoint,
    pub driver_address: String,
    pub pickup_location: GeoPoint,
    pub drop_location: GeoPoint,
    pub pickup_address: String,
    pub drop_address: String,
    pub distance_to_pickup: f64,
    pub total_distance: f64,
    pub fare: i64,
    pub eta_to_pickup: i64,
    pub status: SessionStatus,
}

/// A status reported either by a live session or, once retired, by the
/// ride record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ReportedStatus {
    Session(SessionStatus),
    Ride(RideStatus),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusView {
    pub ride_id: Uuid,
    pub status: ReportedStatus,
    pub current_driver: Option<OfferView>,
    pub accepted_driver_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOffer {
    pub ride_id: Uuid,
    pub pickup_location: GeoPoint,
    pub drop_location: GeoPoint,
    pub pickup_address: String,
    pub drop_address: String,
    pub distance_to_pickup: f64,
    pub total_distance: f64,
    pub fare: i64,
    pub queue_position: usize,
    pub created_at: DateTime<Utc>,
}

/// Creates the ride record and its dispatch session, then offers the ride
/// to the first queued driver.
pub async fn request_ride(
    state: &Arc<AppState>,
    consumer: &AuthUser,
    request: RideRequest,
) -> Result<RequestedRide, AppError> {
    if !request.pickup.point.is_valid() || !request.drop.point.is_valid() {
        return Err(AppError::BadRequest("invalid pickup or drop coordinates".to_string()));
    }
    if request.driver_queue.is_empty() {
        return Err(AppError::BadRequest("driver queue cannot be empty".to_string()));
    }

    let distance_km = haversine_km(&request.pickup.point, &request.drop.point);
    let ride = state
        .repos
        .rides
        .create(NewRide {
            consumer_id: consumer.id,
            pickup: request.pickup,
            drop: request.drop,
            distance_km,
            fare: fare_for(distance_km),
        })
        .await?;

    let session = DispatchSession::new(&ride, request.driver_queue)?;
    let first = session.queue()[0].clone();
    let total_drivers = session.queue().len();
    let handle: SessionHandle = Arc::new(tokio::sync::Mutex::new(session));

    {
        let mut session = handle.lock().await;
        state.sessions.put(ride.id, handle.clone()).await;
        offer_current(state, &mut session);
    }
    state.metrics.sessions_active.inc();

    info!(
        ride_id = %ride.id,
        consumer_id = %consumer.id,
        fare = ride.fare,
        total_drivers,
        "ride requested"
    );

    Ok(RequestedRide {
        id: ride.id,
        pickup_location: ride.pickup.point,
        drop_location: ride.drop.point,
        pickup_address: ride.pickup.address,
        drop_address: ride.drop.address,
        distance: round_km(distance_km),
        fare: ride.fare,
        status: SessionStatus::Searching,
        current_driver: first,
        queue_position: 1,
        total_drivers,
    })
}

/// Arms the acceptance timer for the candidate now at `current_index`.
fn offer_current(state: &Arc<AppState>, session: &mut DispatchSession) {
    let Some(offer) = session.offer_view() else {
        return;
    };

    let ride_id = session.ride_id;
    let index = session.current_index();
    let timeout = state.settings.offer_timeout;
    let timer_state = state.clone();

    let timer = tokio::spawn(async move {
        sleep(timeout).await;
        on_offer_timeout(&timer_state, ride_id, index).await;
    });
    session.arm_timer(timer.abort_handle());

    info!(
        ride_id = %ride_id,
        driver_id = %offer.id,
        queue_position = offer.queue_position,
        total_drivers = offer.total_drivers,
        "ride offered"
    );
    state.publish(DispatchEvent::Offered {
        ride_id,
        driver_id: offer.id,
        queue_position: offer.queue_position,
        total_drivers: offer.total_drivers,
    });
}

async fn on_offer_timeout(state: &Arc<AppState>, ride_id: Uuid, index: usize) {
    let Some(handle) = state.sessions.get(ride_id).await else {
        return;
    };

    let mut session = handle.lock().await;
    if !session.is_offering(index) {
        debug!(ride_id = %ride_id, index, "stale offer timer ignored");
        return;
    }

    session.release_timer();
    state.metrics.record_offer("timed_out");
    warn!(
        ride_id = %ride_id,
        driver_id = ?session.current_offer().map(|c| c.id),
        "driver did not respond in time"
    );

    rollover(state, &mut session).await;
}

/// Moves the offer to the next candidate, or closes the session when the
/// queue is exhausted.
///
/// A failed record write after the session has advanced is logged, not
/// returned; the stale-ride sweeper cancels a ride left `pending` that way.
async fn rollover(state: &Arc<AppState>, session: &mut DispatchSession) {
    match session.advance() {
        Rollover::Offered(_) => offer_current(state, session),
        Rollover::Exhausted => {
            let ride_id = session.ride_id;
            warn!(ride_id = %ride_id, "all drivers exhausted");

            state.metrics.sessions_active.dec();
            state.metrics.record_outcome("no_drivers");
            state.publish(DispatchEvent::Exhausted { ride_id });
            schedule_retirement(state, ride_id);

            match state
                .repos
                .rides
                .update_status(ride_id, StatusTransition::cancel_from(RideStatus::Pending))
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(ride_id = %ride_id, "ride left pending before exhaustion was recorded");
                }
                Err(err) => {
                    error!(
                        ride_id = %ride_id,
                        error = %err,
                        "failed to cancel exhausted ride, leaving it for the sweeper"
                    );
                }
            }
        }
    }
}

/// Removes a finished session once status pollers have had time to see it.
fn schedule_retirement(state: &Arc<AppState>, ride_id: Uuid) {
    let retention = state.settings.session_retention;
    let state = state.clone();

    tokio::spawn(async move {
        sleep(retention).await;
        if state.sessions.remove(ride_id).await.is_some() {
            debug!(ride_id = %ride_id, "dispatch session retired");
        }
    });
}

/// Looks up a live session; a missing session with a surviving ride record
/// means the ride already left dispatch.
async fn live_session(state: &AppState, ride_id: Uuid) -> Result<SessionHandle, AppError> {
    if let Some(handle) = state.sessions.get(ride_id).await {
        return Ok(handle);
    }

    match state.repos.rides.get(ride_id).await? {
        Some(_) => Err(AppError::Conflict(format!(
            "ride {ride_id} is no longer available"
        ))),
        None => Err(AppError::NotFound(format!(
            "ride request {ride_id} not found or expired"
        ))),
    }
}

pub async fn accept_ride(
    state: &Arc<AppState>,
    driver: &AuthUser,
    ride_id: Uuid,
) -> Result<AcceptedRide, AppError> {
    let handle = live_session(state, ride_id).await?;

    let (candidate, mut accepted) = {
        let mut session = handle.lock().await;
        let candidate = session.check_offeree(driver.id)?.clone();

        let updated = state
            .repos
            .rides
            .update_status(ride_id, StatusTransition::accept(driver.id))
            .await?;
        if updated.is_none() {
            return Err(AppError::Conflict(format!("ride {ride_id} was already accepted")));
        }

        session.mark_accepted(driver.id);

        let accepted = AcceptedRide {
            ride_id,
            driver_location: candidate.location.point,
            driver_address: candidate.location.address.clone(),
            pickup_location: session.pickup.point,
            drop_location: session.drop.point,
            pickup_address: session.pickup.address.clone(),
            drop_address: session.drop.address.clone(),
            distance_to_pickup: round_km(candidate.distance_from_pickup),
            total_distance: round_km(session.distance_km),
            fare: session.fare,
            eta_to_pickup: eta_minutes(candidate.distance_from_pickup),
            status: SessionStatus::Accepted,
        };
        (candidate, accepted)
    };

    state.metrics.sessions_active.dec();
    state.metrics.record_offer("accepted");
    state.metrics.record_outcome("accepted");
    state.publish(DispatchEvent::Accepted {
        ride_id,
        driver_id: driver.id,
    });
    schedule_retirement(state, ride_id);

    info!(
        ride_id = %ride_id,
        driver_id = %driver.id,
        distance_to_pickup = candidate.distance_from_pickup,
        "ride accepted"
    );

    // The ride is already committed to this driver; a failed lookup keeps
    // the location the driver was discovered at.
    match state.repos.locations(Role::Driver).current(driver.id).await {
        Ok(Some(latest)) => {
            accepted.driver_location = latest.location;
            accepted.driver_address = latest.address;
        }
        Ok(None) => {}
        Err(err) => {
            warn!(
                ride_id = %ride_id,
                driver_id = %driver.id,
                error = %err,
                "driver location lookup failed, using discovery location"
            );
        }
    }

    Ok(accepted)
}

/// Declines the offer and immediately offers the ride to the next driver.
pub async fn reject_ride(
    state: &Arc<AppState>,
    driver: &AuthUser,
    ride_id: Uuid,
) -> Result<(), AppError> {
    let handle = state
        .sessions
        .get(ride_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("ride request {ride_id} not found")))?;

    let mut session = handle.lock().await;
    session.check_offeree(driver.id)?;

    session.cancel_timer();
    state.metrics.record_offer("rejected");
    info!(ride_id = %ride_id, driver_id = %driver.id, "ride rejected");

    rollover(state, &mut session).await;
    Ok(())
}

/// Rider-initiated cancellation. Stops the offer sequence wherever it is
/// and cancels the ride record if it has not started.
pub async fn cancel_ride(
    state: &Arc<AppState>,
    consumer: &AuthUser,
    ride_id: Uuid,
) -> Result<RideRecord, AppError> {
    let ride = state
        .repos
        .rides
        .get(ride_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;

    if ride.consumer_id != consumer.id {
        return Err(AppError::Forbidden(format!("ride {ride_id} belongs to another rider")));
    }
    if !matches!(ride.status, RideStatus::Pending | RideStatus::Accepted) {
        return Err(AppError::Conflict(format!("ride {ride_id} can no longer be cancelled")));
    }

    let handle = state.sessions.get(ride_id).await;
    let mut session = match &handle {
        Some(handle) => Some(handle.lock().await),
        None => None,
    };

    let cancelled = state
        .repos
        .rides
        .update_status(ride_id, StatusTransition::cancel_from(ride.status))
        .await?
        .ok_or_else(|| AppError::Conflict(format!("ride {ride_id} changed state, retry")))?;

    if let Some(session) = session.as_mut() {
        if session.status() == SessionStatus::Searching {
            state.metrics.sessions_active.dec();
        }
        session.mark_cancelled();
        schedule_retirement(state, ride_id);
    }
    drop(session);

    state.metrics.record_outcome("cancelled");
    state.publish(DispatchEvent::Cancelled { ride_id });
    info!(ride_id = %ride_id, consumer_id = %consumer.id, "ride cancelled by rider");

    Ok(cancelled)
}

pub async fn ride_status(
    state: &Arc<AppState>,
    caller: &AuthUser,
    ride_id: Uuid,
) -> Result<RideStatusView, AppError> {
    if let Some(handle) = state.sessions.get(ride_id).await {
        let session = handle.lock().await;
        if caller.role == Role::Consumer && session.consumer_id != caller.id {
            return Err(AppError::Forbidden(format!("ride {ride_id} belongs to another rider")));
        }

        return Ok(RideStatusView {
            ride_id,
            status: ReportedStatus::Session(session.status()),
            current_driver: session.offer_view(),
            accepted_driver_id: session.accepted_driver_id(),
        });
    }

    let ride = state
        .repos
        .rides
        .get(ride_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;

    if caller.role == Role::Consumer && ride.consumer_id != caller.id {
        return Err(AppError::Forbidden(format!("ride {ride_id} belongs to another rider")));
    }

    Ok(RideStatusView {
        ride_id,
        status: ReportedStatus::Ride(ride.status),
        current_driver: None,
        accepted_driver_id: ride.driver_id,
    })
}

/// Rides currently offered to `driver`.
pub async fn pending_offers(state: &Arc<AppState>, driver: &AuthUser) -> Vec<PendingOffer> {
    let mut offers = Vec::new();

    for (ride_id, handle) in state.sessions.snapshot().await {
        let session = handle.lock().await;
        let Some(candidate) = session.current_offer() else {
            continue;
        };
        if candidate.id != driver.id {
            continue;
        }

        offers.push(PendingOffer {
            ride_id,
            pickup_location: session.pickup.point,
            drop_location: session.drop.point,
            pickup_address: session.pickup.address.clone(),
            drop_address: session.drop.address.clone(),
            distance_to_pickup: round_km(candidate.distance_from_pickup),
            total_distance: round_km(session.distance_km),
            fare: session.fare,
            queue_position: session.current_index() + 1,
            created_at: session.created_at,
        });
    }

    offers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    offers
}
