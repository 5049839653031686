use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::DispatchSettings;
use crate::error::AppError;
use crate::geo::cell::SearchArea;
use crate::geo::{haversine_km, round_km};
use crate::models::driver::{CandidateDriver, CandidateLocation, GeoPoint};
use crate::observability::metrics::Metrics;
use crate::store::{DriverDirectory, DriverMatch};

#[derive(Debug, Clone)]
pub struct Discovery {
    pub drivers: Vec<CandidateDriver>,
    pub area: SearchArea,
}

/// Finds the nearest available drivers around `pickup`, best first.
pub async fn find_candidates(
    drivers: &dyn DriverDirectory,
    settings: &DispatchSettings,
    metrics: &Metrics,
    pickup: &GeoPoint,
) -> Result<Discovery, AppError> {
    if !pickup.is_valid() {
        return Err(AppError::BadRequest("invalid pickup coordinates".to_string()));
    }

    let start = Instant::now();
    let area = SearchArea::around(pickup)?;
    let fresh_since = Utc::now() - settings.location_freshness;

    debug!(primary = %area.primary, coarse = %area.coarse, "searching driver cells");
    let matches = drivers.find_available(&area.prefixes(), fresh_since).await?;
    let matched = matches.len();

    let ranked = rank_candidates(
        pickup,
        &area,
        matches,
        settings.search_radius_km,
        settings.max_candidates,
    );

    metrics
        .discovery_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    info!(
        geohash = %area.primary,
        matched,
        returned = ranked.len(),
        "driver discovery finished"
    );

    Ok(Discovery {
        drivers: ranked,
        area,
    })
}

/// Orders matches by (priority, distance), dropping duplicates and anything
/// outside `radius_km`. The cell match is only a pre-filter.
pub fn rank_candidates(
    pickup: &GeoPoint,
    area: &SearchArea,
    matches: Vec<DriverMatch>,
    radius_km: f64,
    limit: usize,
) -> Vec<CandidateDriver> {
    let mut seen = HashSet::new();

    let mut candidates: Vec<(f64, CandidateDriver)> = matches
        .into_iter()
        .filter(|m| seen.insert(m.profile.id))
        .filter_map(|m| {
            let distance = haversine_km(pickup, &m.location.location);
            if distance > radius_km {
                return None;
            }

            let candidate = CandidateDriver {
                id: m.profile.id,
                full_name: m.profile.full_name,
                phone: m.profile.phone,
                scooter_model: m.profile.scooter_model,
                location: CandidateLocation {
                    point: m.location.location,
                    address: m.location.address,
                },
                distance_from_pickup: round_km(distance),
                last_seen: Some(m.location.updated_at),
                priority: area.priority_of(&m.location.geohash),
                geohash: m.location.geohash,
            };
            Some((distance, candidate))
        })
        .collect();

    candidates.sort_by(|(a_dist, a), (b_dist, b)| {
        a.priority
            .cmp(&b.priority)
            .then(a_dist.total_cmp(b_dist))
            .then(a.id.cmp(&b.id))
    });
    candidates.truncate(limit);

    candidates.into_iter().map(|(_, candidate)| candidate).collect()
}
