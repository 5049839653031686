//! Geohash cells used to bound driver searches.
//!
//! Locations are tagged at [`FINE_PRECISION`] (~1.2 km cells). Searches
//! expand over the [`COARSE_PRECISION`] (~4.9 km) cell containing the
//! pickup plus its eight neighbours.

use geohash::Coord;

use crate::error::AppError;
use crate::models::driver::GeoPoint;

pub const FINE_PRECISION: usize = 6;
pub const COARSE_PRECISION: usize = 5;

pub fn encode(point: &GeoPoint, precision: usize) -> Result<String, AppError> {
    geohash::encode(
        Coord {
            x: point.lng,
            y: point.lat,
        },
        precision,
    )
    .map_err(|err| AppError::BadRequest(format!("cannot encode {point:?}: {err}")))
}

/// The eight cells surrounding `cell`, at the same precision.
pub fn neighbors(cell: &str) -> Result<Vec<String>, AppError> {
    let ring = geohash::neighbors(cell)
        .map_err(|err| AppError::Internal(format!("invalid geohash {cell}: {err}")))?;

    Ok(vec![
        ring.n, ring.ne, ring.e, ring.se, ring.s, ring.sw, ring.w, ring.nw,
    ])
}

/// Cells a discovery query scans for one pickup point.
#[derive(Debug, Clone)]
pub struct SearchArea {
    pub primary: String,
    pub coarse: String,
    pub ring: Vec<String>,
}

impl SearchArea {
    pub fn around(pickup: &GeoPoint) -> Result<Self, AppError> {
        let primary = encode(pickup, FINE_PRECISION)?;
        let coarse = encode(pickup, COARSE_PRECISION)?;
        let ring = neighbors(&coarse)?;

        Ok(Self {
            primary,
            coarse,
            ring,
        })
    }

    /// Prefixes a stored cell may start with to be considered a match.
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::with_capacity(self.ring.len() + 2);
        prefixes.push(self.primary.clone());
        prefixes.push(self.coarse.clone());
        prefixes.extend(self.ring.iter().cloned());
        prefixes
    }

    /// 1 for the pickup's own fine cell, 2 for anything matched by expansion.
    pub fn priority_of(&self, cell: &str) -> u8 {
        if cell.starts_with(self.primary.as_str()) {
            1
        } else {
            2
        }
    }
}
