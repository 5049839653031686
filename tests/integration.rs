use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use scooter_dispatch::api::rest::router;
use scooter_dispatch::config::DispatchSettings;
use scooter_dispatch::engine::dispatcher;
use scooter_dispatch::engine::registry::InMemorySessionRegistry;
use scooter_dispatch::engine::session::SessionStatus;
use scooter_dispatch::engine::sweeper::sweep_stale_rides;
use scooter_dispatch::error::AppError;
use scooter_dispatch::models::driver::{DriverProfile, GeoPoint, LocationRecord};
use scooter_dispatch::models::event::DispatchEvent;
use scooter_dispatch::models::ride::{
    NewRide, RideRecord, RideStatus, StatusTransition, Waypoint,
};
use scooter_dispatch::models::user::{AuthUser, Role};
use scooter_dispatch::state::AppState;
use scooter_dispatch::store::memory::{
    MemoryDriverDirectory, MemoryLocationStore, MemoryRideStore,
};
use scooter_dispatch::store::{
    DriverDirectory, DriverMatch, LocationStore, Repositories, RideStore, StoreError,
    StoreResult,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "integration-secret";
const PICKUP: (f64, f64) = (19.0760, 72.8777);
const DROP: (f64, f64) = (19.1136, 72.8697);
const KM_PER_DEGREE_LAT: f64 = 111.195;
const CONSUMER: u128 = 100;

struct Harness {
    app: axum::Router,
    state: Arc<AppState>,
}

impl Harness {
    fn new() -> Self {
        Self::with_state(AppState::in_memory(DispatchSettings::default(), SECRET))
    }

    fn with_state(state: AppState) -> Self {
        let state = Arc::new(state);
        Self {
            app: router(state.clone()),
            state,
        }
    }

    fn token(&self, seed: u128, role: Role) -> String {
        self.state
            .tokens
            .issue(
                Uuid::from_u128(seed),
                role,
                Some(format!("user-{seed}")),
                chrono::Duration::hours(1),
            )
            .unwrap()
    }

    fn consumer(&self) -> String {
        self.token(CONSUMER, Role::Consumer)
    }

    fn driver(&self, seed: u128) -> String {
        self.token(seed, Role::Driver)
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Reports a driver location `km_north` of the pickup point.
    async fn seed_driver(&self, seed: u128, km_north: f64) -> Uuid {
        let (status, _) = self
            .send(
                "POST",
                "/api/location/update",
                Some(&self.driver(seed)),
                Some(json!({
                    "latitude": PICKUP.0 + km_north / KM_PER_DEGREE_LAT,
                    "longitude": PICKUP.1
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        Uuid::from_u128(seed)
    }

    async fn discover(&self) -> Value {
        let (status, body) = self
            .send(
                "POST",
                "/api/rides/find-drivers",
                Some(&self.consumer()),
                Some(json!({ "pickupLocation": { "lat": PICKUP.0, "lng": PICKUP.1 } })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    async fn request_ride(&self, queue: Value) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/api/rides/request",
            Some(&self.consumer()),
            Some(json!({
                "pickupLocation": { "lat": PICKUP.0, "lng": PICKUP.1 },
                "dropLocation": { "lat": DROP.0, "lng": DROP.1 },
                "pickupAddress": "Chhatrapati Shivaji Terminus",
                "dropAddress": "Andheri West",
                "driverQueue": queue
            })),
        )
        .await
    }

    /// Seeds drivers `seeds` at increasing distances, discovers them and
    /// requests a ride with the discovered queue.
    async fn dispatch(&self, seeds: &[u128]) -> Uuid {
        for (i, seed) in seeds.iter().enumerate() {
            self.seed_driver(*seed, 0.3 * (i as f64 + 1.0)).await;
        }
        let found = self.discover().await;
        assert_eq!(found["totalFound"], seeds.len());

        let (status, body) = self.request_ride(found["drivers"].clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        body["rideId"].as_str().unwrap().parse().unwrap()
    }

    async fn status(&self, ride_id: Uuid) -> Value {
        let (status, body) = self
            .send(
                "GET",
                &format!("/api/rides/{ride_id}/status"),
                Some(&self.consumer()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    async fn respond(&self, ride_id: Uuid, seed: u128, action: &str) -> (StatusCode, Value) {
        self.send(
            "POST",
            &format!("/api/rides/{ride_id}/{action}"),
            Some(&self.driver(seed)),
            None,
        )
        .await
    }
}

fn id(seed: u128) -> String {
    Uuid::from_u128(seed).to_string()
}

#[tokio::test]
async fn health_returns_ok() {
    let h = Harness::new();
    let (status, body) = h.send("GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let h = Harness::new();
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.contains("text/plain"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("dispatch_sessions_active"));
}

#[tokio::test]
async fn missing_or_bad_token_returns_401() {
    let h = Harness::new();
    let body = json!({ "pickupLocation": { "lat": PICKUP.0, "lng": PICKUP.1 } });

    let (status, _) = h
        .send("POST", "/api/rides/find-drivers", None, Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h
        .send("POST", "/api/rides/find-drivers", Some("not-a-jwt"), Some(body))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn find_drivers_is_consumer_only() {
    let h = Harness::new();
    let (status, body) = h
        .send(
            "POST",
            "/api/rides/find-drivers",
            Some(&h.driver(1)),
            Some(json!({ "pickupLocation": { "lat": PICKUP.0, "lng": PICKUP.1 } })),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("consumer"));
}

#[tokio::test]
async fn find_drivers_without_pickup_returns_400() {
    let h = Harness::new();

    let (status, _) = h
        .send("POST", "/api/rides/find-drivers", Some(&h.consumer()), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .send(
            "POST",
            "/api/rides/find-drivers",
            Some(&h.consumer()),
            Some(json!({ "pickupLocation": { "lat": 95.0, "lng": 72.0 } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn location_update_tags_fine_geohash() {
    let h = Harness::new();

    let (status, body) = h
        .send(
            "POST",
            "/api/location/update",
            Some(&h.consumer()),
            Some(json!({ "latitude": PICKUP.0, "longitude": PICKUP.1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["geohash"], "te7ud2");
    assert_eq!(body["location"]["address"], "19.076000, 72.877700");

    let (status, body) = h
        .send("GET", "/api/location/current", Some(&h.consumer()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["geohash"], "te7ud2");

    let (status, _) = h
        .send("GET", "/api/location/current", Some(&h.driver(1)), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn location_update_rejects_invalid_coordinates() {
    let h = Harness::new();

    let (status, _) = h
        .send(
            "POST",
            "/api/location/update",
            Some(&h.driver(1)),
            Some(json!({ "latitude": 19.0, "longitude": 181.0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .send(
            "POST",
            "/api/location/update",
            Some(&h.driver(1)),
            Some(json!({ "address": "somewhere" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn discovery_excludes_drivers_beyond_radius_and_unavailable() {
    let h = Harness::new();
    h.seed_driver(1, 1.0).await;
    h.seed_driver(2, 0.5).await;
    h.seed_driver(3, 15.0).await;
    h.seed_driver(4, 0.2).await;

    let (status, _) = h
        .send(
            "PUT",
            "/api/driver/availability",
            Some(&h.driver(4)),
            Some(json!({ "isAvailable": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let body = h.discover().await;
    let drivers = body["drivers"].as_array().unwrap();

    assert_eq!(body["totalFound"], 2);
    assert_eq!(body["searchRadius"], 10.0);
    assert_eq!(body["geohash"], "te7ud2");
    assert_eq!(drivers[0]["id"], id(2));
    assert_eq!(drivers[1]["id"], id(1));
    assert!(drivers
        .iter()
        .all(|d| d["distanceFromPickup"].as_f64().unwrap() <= 10.0));
    assert!(drivers[0]["priority"].as_u64().unwrap() <= drivers[1]["priority"].as_u64().unwrap());
}

#[tokio::test]
async fn request_with_empty_queue_returns_400() {
    let h = Harness::new();
    let (status, _) = h.request_ride(json!([])).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.state.sessions.len().await, 0);
}

#[tokio::test]
async fn request_ride_offers_first_driver() {
    let h = Harness::new();
    h.seed_driver(1, 0.3).await;
    h.seed_driver(2, 0.6).await;
    let found = h.discover().await;

    let (status, body) = h.request_ride(found["drivers"].clone()).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ride"]["status"], "searching");
    assert_eq!(body["ride"]["currentDriver"]["id"], id(1));
    assert_eq!(body["ride"]["queuePosition"], 1);
    assert_eq!(body["ride"]["totalDrivers"], 2);
    assert!(body["ride"]["fare"].as_i64().unwrap() > 50);

    let ride_id = body["rideId"].as_str().unwrap();
    let (_, pending) = h
        .send("GET", "/api/driver/pending-rides", Some(&h.driver(1)), None)
        .await;
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["pendingRides"][0]["rideId"], ride_id);

    let (_, pending) = h
        .send("GET", "/api/driver/pending-rides", Some(&h.driver(2)), None)
        .await;
    assert_eq!(pending["count"], 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_reject_and_accept_walk_the_queue() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2, 3]).await;

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "searching");
    assert_eq!(status["currentDriver"]["id"], id(1));

    // D1 never answers.
    tokio::time::sleep(Duration::from_secs(121)).await;
    let status = h.status(ride_id).await;
    assert_eq!(status["currentDriver"]["id"], id(2));
    assert_eq!(status["currentDriver"]["queuePosition"], 2);
    assert_eq!(status["currentDriver"]["totalDrivers"], 3);

    let (code, _) = h.respond(ride_id, 2, "reject").await;
    assert_eq!(code, StatusCode::OK);
    let status = h.status(ride_id).await;
    assert_eq!(status["currentDriver"]["id"], id(3));
    assert_eq!(status["currentDriver"]["queuePosition"], 3);

    let (code, body) = h.respond(ride_id, 3, "accept").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["ride"]["status"], "accepted");
    assert!(body["ride"]["etaToPickup"].as_i64().unwrap() >= 1);

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "accepted");
    assert_eq!(status["acceptedDriverId"], id(3));
    assert!(status["currentDriver"].is_null());

    let (code, _) = h.respond(ride_id, 3, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);
    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);

    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.driver_id, Some(Uuid::from_u128(3)));
    assert!(ride.accepted_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn retired_session_falls_back_to_ride_record() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1]).await;

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::OK);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(h.state.sessions.get(ride_id).await.is_none());

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "accepted");
    assert_eq!(status["acceptedDriverId"], id(1));

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn timeout_after_acceptance_is_a_no_op() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2]).await;

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::OK);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "accepted");

    tokio::time::sleep(Duration::from_secs(300)).await;
    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.driver_id, Some(Uuid::from_u128(1)));
}

#[tokio::test(start_paused = true)]
async fn exhausted_queue_cancels_ride_without_repeating_offers() {
    let h = Harness::new();
    let mut events = h.state.dispatch_events_tx.subscribe();
    let ride_id = h.dispatch(&[1, 2, 3]).await;

    let (code, _) = h.respond(ride_id, 1, "reject").await;
    assert_eq!(code, StatusCode::OK);
    tokio::time::sleep(Duration::from_secs(121)).await;
    let (code, _) = h.respond(ride_id, 3, "reject").await;
    assert_eq!(code, StatusCode::OK);

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "no_drivers");
    assert!(status["currentDriver"].is_null());

    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert!(ride.cancelled_at.is_some());
    assert!(ride.driver_id.is_none());

    let (code, _) = h.respond(ride_id, 3, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);

    let mut offered = Vec::new();
    let mut exhausted = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            DispatchEvent::Offered { driver_id, .. } => offered.push(driver_id),
            DispatchEvent::Exhausted { .. } => exhausted += 1,
            _ => {}
        }
    }
    assert_eq!(
        offered,
        vec![Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)]
    );
    assert_eq!(exhausted, 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "cancelled");
}

#[tokio::test]
async fn only_current_offeree_may_respond() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2]).await;

    let (code, _) = h.respond(ride_id, 2, "accept").await;
    assert_eq!(code, StatusCode::FORBIDDEN);
    let (code, _) = h.respond(ride_id, 2, "reject").await;
    assert_eq!(code, StatusCode::FORBIDDEN);

    let (code, _) = h
        .send(
            "POST",
            &format!("/api/rides/{ride_id}/accept"),
            Some(&h.consumer()),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::FORBIDDEN);

    let status = h.status(ride_id).await;
    assert_eq!(status["currentDriver"]["id"], id(1));
}

#[tokio::test]
async fn unknown_ride_returns_404() {
    let h = Harness::new();
    let ride_id = Uuid::new_v4();

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    let (code, _) = h.respond(ride_id, 1, "reject").await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = h
        .send(
            "GET",
            &format!("/api/rides/{ride_id}/status"),
            Some(&h.consumer()),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_have_a_single_winner() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2, 3]).await;

    let attempts = [1u128, 1, 1, 2, 3, 1]
        .into_iter()
        .map(|seed| {
            let state = h.state.clone();
            tokio::spawn(async move {
                let driver = AuthUser {
                    id: Uuid::from_u128(seed),
                    role: Role::Driver,
                    name: None,
                };
                dispatcher::accept_ride(&state, &driver, ride_id).await
            })
        })
        .collect::<Vec<_>>();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(ride) => {
                winners += 1;
                assert_eq!(ride.ride_id, ride_id);
            }
            Err(AppError::Conflict(_)) | Err(AppError::NotOfferee(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners, 1);
    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.driver_id, Some(Uuid::from_u128(1)));
    assert_eq!(ride.status, RideStatus::Accepted);
}

#[tokio::test]
async fn rider_can_cancel_a_searching_ride() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2]).await;

    let (code, _) = h
        .send(
            "POST",
            &format!("/api/rides/{ride_id}/cancel"),
            Some(&h.token(CONSUMER + 1, Role::Consumer)),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::FORBIDDEN);

    let (code, body) = h
        .send(
            "POST",
            &format!("/api/rides/{ride_id}/cancel"),
            Some(&h.consumer()),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "cancelled");

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);

    let (code, _) = h
        .send(
            "POST",
            &format!("/api/rides/{ride_id}/cancel"),
            Some(&h.consumer()),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::CONFLICT);
}

#[tokio::test]
async fn accepted_ride_runs_to_completion() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1]).await;
    h.respond(ride_id, 1, "accept").await;

    let (_, active) = h
        .send("GET", "/api/rides/active", Some(&h.consumer()), None)
        .await;
    assert_eq!(active["ride"]["id"], ride_id.to_string());
    assert_eq!(active["ride"]["status"], "accepted");

    let (code, _) = h.respond(ride_id, 2, "start").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    let (code, _) = h.respond(ride_id, 1, "complete").await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = h.respond(ride_id, 1, "start").await;
    assert_eq!(code, StatusCode::OK);
    let (code, _) = h.respond(ride_id, 1, "complete").await;
    assert_eq!(code, StatusCode::OK);

    let (_, active) = h
        .send("GET", "/api/rides/active", Some(&h.driver(1)), None)
        .await;
    assert!(active["ride"].is_null());

    let (_, history) = h
        .send("GET", "/api/rides/history?page=1&limit=5", Some(&h.driver(1)), None)
        .await;
    assert_eq!(history["pagination"]["total"], 1);
    assert_eq!(history["rides"][0]["id"], ride_id.to_string());
    assert!(history["rides"][0]["completedAt"].is_string());
}

fn orphan_ride(consumer: u128) -> NewRide {
    let waypoint = |(lat, lng): (f64, f64)| Waypoint {
        point: GeoPoint { lat, lng },
        address: String::new(),
    };
    NewRide {
        consumer_id: Uuid::from_u128(consumer),
        pickup: waypoint(PICKUP),
        drop: waypoint(DROP),
        distance_km: 4.2,
        fare: 113,
    }
}

#[tokio::test]
async fn sweeper_cancels_orphaned_rides_but_not_live_ones() {
    let settings = DispatchSettings {
        stale_ride_after: chrono::Duration::zero(),
        ..DispatchSettings::default()
    };
    let h = Harness::with_state(AppState::in_memory(settings, SECRET));

    let live = h.dispatch(&[1]).await;
    let orphan = h.state.repos.rides.create(orphan_ride(CONSUMER)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let swept = sweep_stale_rides(&h.state).await.unwrap();
    assert_eq!(swept, 1);

    let orphan = h.state.repos.rides.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, RideStatus::Cancelled);

    let live = h.state.repos.rides.get(live).await.unwrap().unwrap();
    assert_eq!(live.status, RideStatus::Pending);
}

struct UnavailableDrivers;

#[async_trait]
impl DriverDirectory for UnavailableDrivers {
    async fn ensure_profile(&self, _id: Uuid, _name: &str) -> StoreResult<DriverProfile> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set_availability(&self, _id: Uuid, _available: bool) -> StoreResult<Option<DriverProfile>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn find_available(
        &self,
        _prefixes: &[String],
        _fresh_since: DateTime<Utc>,
    ) -> StoreResult<Vec<DriverMatch>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn store_outage_surfaces_as_503() {
    let repos = Repositories::new(
        Arc::new(MemoryRideStore::new()),
        Arc::new(UnavailableDrivers),
        Arc::new(MemoryLocationStore::new()),
        Arc::new(MemoryLocationStore::new()),
    );
    let h = Harness::with_state(AppState::new(
        repos,
        Arc::new(InMemorySessionRegistry::new()),
        DispatchSettings::default(),
        SECRET,
        16,
    ));

    let (status, body) = h
        .send(
            "POST",
            "/api/rides/find-drivers",
            Some(&h.consumer()),
            Some(json!({ "pickupLocation": { "lat": PICKUP.0, "lng": PICKUP.1 } })),
        )
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn store_rejected_accept_leaves_session_searching() {
    let h = Harness::new();
    let ride_id = h.dispatch(&[1, 2]).await;

    let taken = h
        .state
        .repos
        .rides
        .update_status(ride_id, StatusTransition::accept(Uuid::from_u128(9)))
        .await
        .unwrap();
    assert!(taken.is_some());

    let (code, _) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::CONFLICT);

    let driver = AuthUser {
        id: Uuid::from_u128(1),
        role: Role::Driver,
        name: None,
    };
    let err = dispatcher::accept_ride(&h.state, &driver, ride_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let handle = h.state.sessions.get(ride_id).await.unwrap();
    {
        let session = handle.lock().await;
        assert_eq!(session.status(), SessionStatus::Searching);
        assert_eq!(session.current_index(), 0);
        assert!(session.accepted_driver_id().is_none());
    }

    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.driver_id, Some(Uuid::from_u128(9)));
    assert_eq!(h.state.metrics.sessions_active.get(), 1);
}

#[tokio::test]
async fn active_session_gauge_counts_only_searching_sessions() {
    let h = Harness::new();

    let accepted = h.dispatch(&[1]).await;
    assert_eq!(h.state.metrics.sessions_active.get(), 1);

    let (code, _) = h.respond(accepted, 1, "accept").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(h.state.metrics.sessions_active.get(), 0);
    assert_eq!(h.state.sessions.len().await, 1);

    let cancelled = h.dispatch(&[1]).await;
    assert_eq!(h.state.metrics.sessions_active.get(), 1);
    let (code, _) = h
        .send(
            "POST",
            &format!("/api/rides/{cancelled}/cancel"),
            Some(&h.consumer()),
            None,
        )
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(h.state.metrics.sessions_active.get(), 0);

    let exhausted = h.dispatch(&[1]).await;
    let (code, _) = h.respond(exhausted, 1, "reject").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(h.state.metrics.sessions_active.get(), 0);
}

struct UnreachableLocations;

#[async_trait]
impl LocationStore for UnreachableLocations {
    async fn upsert(
        &self,
        _user_id: Uuid,
        _location: GeoPoint,
        _address: String,
        _geohash: String,
    ) -> StoreResult<LocationRecord> {
        Err(StoreError::Unavailable("location store down".into()))
    }

    async fn current(&self, _user_id: Uuid) -> StoreResult<Option<LocationRecord>> {
        Err(StoreError::Unavailable("location store down".into()))
    }
}

#[tokio::test]
async fn accept_survives_driver_location_outage() {
    let repos = Repositories::new(
        Arc::new(MemoryRideStore::new()),
        Arc::new(MemoryDriverDirectory::new(Arc::new(MemoryLocationStore::new()))),
        Arc::new(MemoryLocationStore::new()),
        Arc::new(UnreachableLocations),
    );
    let h = Harness::with_state(AppState::new(
        repos,
        Arc::new(InMemorySessionRegistry::new()),
        DispatchSettings::default(),
        SECRET,
        16,
    ));

    let (status, body) = h
        .request_ride(json!([{
            "id": id(1),
            "fullName": "user-1",
            "location": { "lat": 19.0796, "lng": 72.8777, "address": "Dadar" },
            "distanceFromPickup": 0.4,
            "priority": 1
        }]))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let ride_id: Uuid = body["rideId"].as_str().unwrap().parse().unwrap();

    let (code, body) = h.respond(ride_id, 1, "accept").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["ride"]["driverLocation"]["lat"], 19.0796);
    assert_eq!(body["ride"]["driverAddress"], "Dadar");

    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.driver_id, Some(Uuid::from_u128(1)));
}

/// Ride store whose status updates can be switched off.
struct FlakyRides {
    inner: MemoryRideStore,
    fail_updates: AtomicBool,
}

#[async_trait]
impl RideStore for FlakyRides {
    async fn create(&self, ride: NewRide) -> StoreResult<RideRecord> {
        self.inner.create(ride).await
    }

    async fn update_status(
        &self,
        ride_id: Uuid,
        transition: StatusTransition,
    ) -> StoreResult<Option<RideRecord>> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write timeout".into()));
        }
        self.inner.update_status(ride_id, transition).await
    }

    async fn get(&self, ride_id: Uuid) -> StoreResult<Option<RideRecord>> {
        self.inner.get(ride_id).await
    }

    async fn find_by_participant(
        &self,
        role: Role,
        user_id: Uuid,
        statuses: &[RideStatus],
    ) -> StoreResult<Vec<RideRecord>> {
        self.inner.find_by_participant(role, user_id, statuses).await
    }

    async fn find_stale(
        &self,
        statuses: &[RideStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<RideRecord>> {
        self.inner.find_stale(statuses, older_than).await
    }
}

#[tokio::test]
async fn exhaustion_write_failure_still_answers_the_reject() {
    let rides = Arc::new(FlakyRides {
        inner: MemoryRideStore::new(),
        fail_updates: AtomicBool::new(false),
    });
    let driver_locations = Arc::new(MemoryLocationStore::new());
    let repos = Repositories::new(
        rides.clone(),
        Arc::new(MemoryDriverDirectory::new(driver_locations.clone())),
        Arc::new(MemoryLocationStore::new()),
        driver_locations,
    );
    let settings = DispatchSettings {
        stale_ride_after: chrono::Duration::zero(),
        ..DispatchSettings::default()
    };
    let h = Harness::with_state(AppState::new(
        repos,
        Arc::new(InMemorySessionRegistry::new()),
        settings,
        SECRET,
        16,
    ));

    let ride_id = h.dispatch(&[1]).await;
    rides.fail_updates.store(true, Ordering::SeqCst);

    let (code, _) = h.respond(ride_id, 1, "reject").await;
    assert_eq!(code, StatusCode::OK);

    let status = h.status(ride_id).await;
    assert_eq!(status["status"], "no_drivers");
    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Pending);

    rides.fail_updates.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sweep_stale_rides(&h.state).await.unwrap(), 1);

    let ride = h.state.repos.rides.get(ride_id).await.unwrap().unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
}
