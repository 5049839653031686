use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::driver::{DriverProfile, GeoPoint, LocationRecord};
use crate::models::ride::{NewRide, RideRecord, RideStatus, StatusTransition};
use crate::models::user::Role;
use crate::store::{
    DriverDirectory, DriverMatch, LocationStore, RideStore, StoreResult,
};

#[derive(Default)]
pub struct MemoryRideStore {
    rides: DashMap<Uuid, RideRecord>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn create(&self, ride: NewRide) -> StoreResult<RideRecord> {
        let record = RideRecord {
            id: Uuid::new_v4(),
            consumer_id: ride.consumer_id,
            driver_id: None,
            pickup: ride.pickup,
            drop: ride.drop,
            distance_km: ride.distance_km,
            fare: ride.fare,
            status: RideStatus::Pending,
            created_at: Utc::now(),
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        };

        self.rides.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        ride_id: Uuid,
        transition: StatusTransition,
    ) -> StoreResult<Option<RideRecord>> {
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };

        if let Some(from) = transition.from {
            if ride.status != from {
                return Ok(None);
            }
        }

        if let Some(driver_id) = transition.driver_id {
            if transition.to == RideStatus::Accepted {
                ride.driver_id = Some(driver_id);
            } else if ride.driver_id != Some(driver_id) {
                return Ok(None);
            }
        }

        ride.status = transition.to;
        ride.stamp(transition.stamp, Utc::now());

        Ok(Some(ride.clone()))
    }

    async fn get(&self, ride_id: Uuid) -> StoreResult<Option<RideRecord>> {
        Ok(self.rides.get(&ride_id).map(|entry| entry.value().clone()))
    }

    async fn find_by_participant(
        &self,
        role: Role,
        user_id: Uuid,
        statuses: &[RideStatus],
    ) -> StoreResult<Vec<RideRecord>> {
        let mut rides: Vec<RideRecord> = self
            .rides
            .iter()
            .filter(|entry| {
                let ride = entry.value();
                let participant = match role {
                    Role::Consumer => ride.consumer_id == user_id,
                    Role::Driver => ride.driver_id == Some(user_id),
                };
                participant && statuses.contains(&ride.status)
            })
            .map(|entry| entry.value().clone())
            .collect();

        rides.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rides)
    }

    async fn find_stale(
        &self,
        statuses: &[RideStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<RideRecord>> {
        Ok(self
            .rides
            .iter()
            .filter(|entry| {
                let ride = entry.value();
                let since = match ride.status {
                    RideStatus::Accepted => ride.accepted_at.unwrap_or(ride.created_at),
                    RideStatus::InProgress => ride.started_at.unwrap_or(ride.created_at),
                    _ => ride.created_at,
                };
                statuses.contains(&ride.status) && since < older_than
            })
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryLocationStore {
    locations: DashMap<Uuid, LocationRecord>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<LocationRecord> {
        self.locations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn upsert(
        &self,
        user_id: Uuid,
        location: GeoPoint,
        address: String,
        geohash: String,
    ) -> StoreResult<LocationRecord> {
        let now = Utc::now();
        let mut entry = self
            .locations
            .entry(user_id)
            .or_insert_with(|| LocationRecord {
                user_id,
                location,
                address: address.clone(),
                geohash: geohash.clone(),
                updated_at: now - Duration::microseconds(1),
            });

        let previous = entry.updated_at;
        entry.location = location;
        entry.address = address;
        entry.geohash = geohash;
        entry.updated_at = if now > previous {
            now
        } else {
            previous + Duration::microseconds(1)
        };

        Ok(entry.clone())
    }

    async fn current(&self, user_id: Uuid) -> StoreResult<Option<LocationRecord>> {
        Ok(self
            .locations
            .get(&user_id)
            .map(|entry| entry.value().clone()))
    }
}

pub struct MemoryDriverDirectory {
    profiles: DashMap<Uuid, DriverProfile>,
    locations: Arc<MemoryLocationStore>,
}

impl MemoryDriverDirectory {
    pub fn new(locations: Arc<MemoryLocationStore>) -> Self {
        Self {
            profiles: DashMap::new(),
            locations,
        }
    }
}

#[async_trait]
impl DriverDirectory for MemoryDriverDirectory {
    async fn ensure_profile(&self, driver_id: Uuid, full_name: &str) -> StoreResult<DriverProfile> {
        let profile = self
            .profiles
            .entry(driver_id)
            .or_insert_with(|| DriverProfile {
                id: driver_id,
                full_name: full_name.to_string(),
                phone: None,
                scooter_model: None,
                is_available: true,
            });

        Ok(profile.clone())
    }

    async fn set_availability(
        &self,
        driver_id: Uuid,
        is_available: bool,
    ) -> StoreResult<Option<DriverProfile>> {
        Ok(self.profiles.get_mut(&driver_id).map(|mut profile| {
            profile.is_available = is_available;
            profile.clone()
        }))
    }

    async fn find_available(
        &self,
        cell_prefixes: &[String],
        fresh_since: DateTime<Utc>,
    ) -> StoreResult<Vec<DriverMatch>> {
        let matches = self
            .locations
            .snapshot()
            .into_iter()
            .filter(|location| {
                location.updated_at >= fresh_since
                    && cell_prefixes
                        .iter()
                        .any(|prefix| location.geohash.starts_with(prefix.as_str()))
            })
            .filter_map(|location| {
                let profile = self.profiles.get(&location.user_id)?;
                profile.is_available.then(|| DriverMatch {
                    profile: profile.clone(),
                    location,
                })
            })
            .collect();

        Ok(matches)
    }
}
