//! Per-ride offer state machine.
//!
//! A session offers the ride to exactly one queued candidate at a time.
//! `current_index` only moves forward, one position per rollover, and the
//! session leaves `Searching` at most once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::CandidateDriver;
use crate::models::ride::{RideRecord, Waypoint};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Searching,
    Accepted,
    NoDrivers,
    Cancelled,
}

/// Result of moving the offer past the current candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollover {
    /// The candidate at this index is now offered.
    Offered(usize),
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferView {
    pub id: Uuid,
    pub name: String,
    pub queue_position: usize,
    pub total_drivers: usize,
}

#[derive(Debug)]
pub struct DispatchSession {
    pub ride_id: Uuid,
    pub consumer_id: Uuid,
    pub pickup: Waypoint,
    pub drop: Waypoint,
    pub fare: i64,
    pub distance_km: f64,
    pub created_at: DateTime<Utc>,
    queue: Vec<CandidateDriver>,
    current_index: usize,
    status: SessionStatus,
    accepted_driver_id: Option<Uuid>,
    timer: Option<AbortHandle>,
}

impl DispatchSession {
    /// Builds a searching session offering `queue[0]`. Repeated driver ids
    /// keep their first position only.
    pub fn new(ride: &RideRecord, queue: Vec<CandidateDriver>) -> Result<Self, AppError> {
        let queue = dedup_queue(queue);
        if queue.is_empty() {
            return Err(AppError::BadRequest(
                "driver queue must contain at least one driver".to_string(),
            ));
        }

        Ok(Self {
            ride_id: ride.id,
            consumer_id: ride.consumer_id,
            pickup: ride.pickup.clone(),
            drop: ride.drop.clone(),
            fare: ride.fare,
            distance_km: ride.distance_km,
            created_at: Utc::now(),
            queue,
            current_index: 0,
            status: SessionStatus::Searching,
            accepted_driver_id: None,
            timer: None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn queue(&self) -> &[CandidateDriver] {
        &self.queue
    }

    pub fn accepted_driver_id(&self) -> Option<Uuid> {
        self.accepted_driver_id
    }

    /// The candidate currently holding the offer, if still searching.
    pub fn current_offer(&self) -> Option<&CandidateDriver> {
        match self.status {
            SessionStatus::Searching => self.queue.get(self.current_index),
            _ => None,
        }
    }

    /// True while the offer made at `index` is still the live one.
    pub fn is_offering(&self, index: usize) -> bool {
        self.status == SessionStatus::Searching && self.current_index == index
    }

    /// Only the current offeree of a searching session may respond.
    pub fn check_offeree(&self, driver_id: Uuid) -> Result<&CandidateDriver, AppError> {
        if self.status != SessionStatus::Searching {
            return Err(AppError::Conflict(format!(
                "ride {} is no longer available",
                self.ride_id
            )));
        }

        match self.queue.get(self.current_index) {
            Some(candidate) if candidate.id == driver_id => Ok(candidate),
            _ => Err(AppError::NotOfferee(self.ride_id.to_string())),
        }
    }

    pub fn offer_view(&self) -> Option<OfferView> {
        self.current_offer().map(|candidate| OfferView {
            id: candidate.id,
            name: candidate.full_name.clone(),
            queue_position: self.current_index + 1,
            total_drivers: self.queue.len(),
        })
    }

    /// Replaces the pending timer, aborting the old one.
    pub fn arm_timer(&mut self, timer: AbortHandle) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Forgets the timer without aborting it. Used by the timer task itself.
    pub fn release_timer(&mut self) {
        self.timer = None;
    }

    pub fn mark_accepted(&mut self, driver_id: Uuid) {
        self.cancel_timer();
        self.status = SessionStatus::Accepted;
        self.accepted_driver_id = Some(driver_id);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancel_timer();
        self.status = SessionStatus::Cancelled;
    }

    /// Advances past the current candidate. The caller owns the timer
    /// bookkeeping for the offer being abandoned.
    pub fn advance(&mut self) -> Rollover {
        if self.status != SessionStatus::Searching {
            return Rollover::Exhausted;
        }

        self.current_index += 1;
        if self.current_index >= self.queue.len() {
            self.status = SessionStatus::NoDrivers;
            Rollover::Exhausted
        } else {
            Rollover::Offered(self.current_index)
        }
    }
}

impl Drop for DispatchSession {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

fn dedup_queue(queue: Vec<CandidateDriver>) -> Vec<CandidateDriver> {
    let mut seen = HashSet::new();
    queue
        .into_iter()
        .filter(|candidate| seen.insert(candidate.id))
        .collect()
}
