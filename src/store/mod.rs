//! Repository seams for everything the dispatch engine persists.
//!
//! The engine only sees these traits; [`memory`] provides the in-process
//! implementations used by the binary and the tests.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::driver::{DriverProfile, GeoPoint, LocationRecord};
use crate::models::ride::{NewRide, RideRecord, RideStatus, StatusTransition};
use crate::models::user::Role;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RideStore: Send + Sync {
    /// Persists a new ride in `pending`; the store assigns the id.
    async fn create(&self, ride: NewRide) -> StoreResult<RideRecord>;

    /// Applies `transition` only if its guards hold. `Ok(None)` means the
    /// guard rejected the update and nothing changed.
    async fn update_status(
        &self,
        ride_id: Uuid,
        transition: StatusTransition,
    ) -> StoreResult<Option<RideRecord>>;

    async fn get(&self, ride_id: Uuid) -> StoreResult<Option<RideRecord>>;

    /// Rides the user took part in with one of `statuses`, newest first.
    async fn find_by_participant(
        &self,
        role: Role,
        user_id: Uuid,
        statuses: &[RideStatus],
    ) -> StoreResult<Vec<RideRecord>>;

    /// Rides sitting in one of `statuses` since before `older_than`.
    async fn find_stale(
        &self,
        statuses: &[RideStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<RideRecord>>;
}

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Inserts or replaces the user's row. `updated_at` strictly increases.
    async fn upsert(
        &self,
        user_id: Uuid,
        location: GeoPoint,
        address: String,
        geohash: String,
    ) -> StoreResult<LocationRecord>;

    async fn current(&self, user_id: Uuid) -> StoreResult<Option<LocationRecord>>;
}

/// An available driver joined with their last known location.
#[derive(Debug, Clone)]
pub struct DriverMatch {
    pub profile: DriverProfile,
    pub location: LocationRecord,
}

#[async_trait]
pub trait DriverDirectory: Send + Sync {
    /// Returns the existing profile, creating an available one if absent.
    async fn ensure_profile(&self, driver_id: Uuid, full_name: &str) -> StoreResult<DriverProfile>;

    async fn set_availability(
        &self,
        driver_id: Uuid,
        is_available: bool,
    ) -> StoreResult<Option<DriverProfile>>;

    /// Available drivers whose cell starts with any of `cell_prefixes` and
    /// whose location was reported at or after `fresh_since`.
    async fn find_available(
        &self,
        cell_prefixes: &[String],
        fresh_since: DateTime<Utc>,
    ) -> StoreResult<Vec<DriverMatch>>;
}

#[derive(Clone)]
pub struct Repositories {
    pub rides: Arc<dyn RideStore>,
    pub drivers: Arc<dyn DriverDirectory>,
    consumer_locations: Arc<dyn LocationStore>,
    driver_locations: Arc<dyn LocationStore>,
}

impl Repositories {
    pub fn new(
        rides: Arc<dyn RideStore>,
        drivers: Arc<dyn DriverDirectory>,
        consumer_locations: Arc<dyn LocationStore>,
        driver_locations: Arc<dyn LocationStore>,
    ) -> Self {
        Self {
            rides,
            drivers,
            consumer_locations,
            driver_locations,
        }
    }

    pub fn in_memory() -> Self {
        let driver_locations = Arc::new(memory::MemoryLocationStore::new());

        Self {
            rides: Arc::new(memory::MemoryRideStore::new()),
            drivers: Arc::new(memory::MemoryDriverDirectory::new(driver_locations.clone())),
            consumer_locations: Arc::new(memory::MemoryLocationStore::new()),
            driver_locations,
        }
    }

    pub fn locations(&self, role: Role) -> &Arc<dyn LocationStore> {
        match role {
            Role::Consumer => &self.consumer_locations,
            Role::Driver => &self.driver_locations,
        }
    }
}
