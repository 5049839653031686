use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

/// Timestamp column stamped by a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideTimestamp {
    AcceptedAt,
    StartedAt,
    CompletedAt,
    CancelledAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    #[serde(flatten)]
    pub point: GeoPoint,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct NewRide {
    pub consumer_id: Uuid,
    pub pickup: Waypoint,
    pub drop: Waypoint,
    pub distance_km: f64,
    pub fare: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRecord {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: Waypoint,
    pub drop: Waypoint,
    pub distance_km: f64,
    pub fare: i64,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl RideRecord {
    pub fn stamp(&mut self, field: RideTimestamp, at: DateTime<Utc>) {
        match field {
            RideTimestamp::AcceptedAt => self.accepted_at = Some(at),
            RideTimestamp::StartedAt => self.started_at = Some(at),
            RideTimestamp::CompletedAt => self.completed_at = Some(at),
            RideTimestamp::CancelledAt => self.cancelled_at = Some(at),
        }
    }
}

/// Conditional status change. `from` guards against racing writers and
/// `driver_id`, when set, must match (or, on accept, is assigned).
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub from: Option<RideStatus>,
    pub to: RideStatus,
    pub stamp: RideTimestamp,
    pub driver_id: Option<Uuid>,
}

impl StatusTransition {
    pub fn accept(driver_id: Uuid) -> Self {
        Self {
            from: Some(RideStatus::Pending),
            to: RideStatus::Accepted,
            stamp: RideTimestamp::AcceptedAt,
            driver_id: Some(driver_id),
        }
    }

    pub fn cancel_from(from: RideStatus) -> Self {
        Self {
            from: Some(from),
            to: RideStatus::Cancelled,
            stamp: RideTimestamp::CancelledAt,
            driver_id: None,
        }
    }

    pub fn start(driver_id: Uuid) -> Self {
        Self {
            from: Some(RideStatus::Accepted),
            to: RideStatus::InProgress,
            stamp: RideTimestamp::StartedAt,
            driver_id: Some(driver_id),
        }
    }

    pub fn complete(driver_id: Uuid) -> Self {
        Self {
            from: Some(RideStatus::InProgress),
            to: RideStatus::Completed,
            stamp: RideTimestamp::CompletedAt,
            driver_id: Some(driver_id),
        }
    }
}
