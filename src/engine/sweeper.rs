use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::engine::session::SessionStatus;
use crate::error::AppError;
use crate::models::ride::{RideStatus, StatusTransition};
use crate::state::AppState;

/// Periodically cancels rides stranded in `pending` or `accepted`, e.g. after
/// a restart dropped their dispatch sessions.
pub async fn run_stale_ride_sweeper(state: Arc<AppState>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "stale ride sweeper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match sweep_stale_rides(&state).await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "stale rides cancelled"),
            Err(err) => error!(error = %err, "stale ride sweep failed"),
        }
    }
}

pub async fn sweep_stale_rides(state: &AppState) -> Result<usize, AppError> {
    let cutoff = Utc::now() - state.settings.stale_ride_after;
    let stale = state
        .repos
        .rides
        .find_stale(&[RideStatus::Pending, RideStatus::Accepted], cutoff)
        .await?;

    let mut swept = 0;
    for ride in stale {
        if ride.status == RideStatus::Pending {
            if let Some(handle) = state.sessions.get(ride.id).await {
                if handle.lock().await.status() == SessionStatus::Searching {
                    continue;
                }
            }
        }

        let cancelled = state
            .repos
            .rides
            .update_status(ride.id, StatusTransition::cancel_from(ride.status))
            .await?;

        if cancelled.is_some() {
            swept += 1;
            state.metrics.record_outcome("swept");
            warn!(ride_id = %ride.id, status = ?ride.status, "stale ride force-cancelled");
        }
    }

    Ok(swept)
}
