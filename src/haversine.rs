//! Haversine travel estimator (fallback when OSRM unavailable).
//!
//! Uses great-circle distance and an assumed average speed.
//! Less accurate than OSRM (ignores roads) but always available.

use rayon::prelude::*;

use crate::estimate::{DistanceEstimator, EstimateError, Leg, TravelMatrix};
use crate::model::Location;

/// Average driving speed assumption for time estimation.
const DEFAULT_SPEED_KMH: f64 = 40.0;

/// Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine-based travel estimator.
///
/// Estimates travel time using straight-line distance and an assumed speed.
#[derive(Debug, Clone)]
pub struct HaversineEstimator {
    /// Assumed average driving speed in km/h.
    pub speed_kmh: f64,
}

impl Default for HaversineEstimator {
    fn default() -> Self {
        Self {
            speed_kmh: DEFAULT_SPEED_KMH,
        }
    }
}

impl HaversineEstimator {
    pub fn new(speed_kmh: f64) -> Self {
        Self { speed_kmh }
    }

    /// Calculate haversine distance between two points in kilometers.
    fn haversine_km(from: &Location, to: &Location) -> f64 {
        let lat1_rad = from.lat.to_radians();
        let lat2_rad = to.lat.to_radians();
        let delta_lat = (to.lat - from.lat).to_radians();
        let delta_lng = (to.lng - from.lng).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_KM * c
    }

    fn leg_between(&self, from: &Location, to: &Location) -> Leg {
        let km = Self::haversine_km(from, to);
        let hours = km / self.speed_kmh;
        Leg {
            distance_km: km,
            duration_secs: (hours * 3600.0).round() as i32,
        }
    }
}

impl DistanceEstimator for HaversineEstimator {
    fn matrix(&self, locations: &[Location]) -> Result<TravelMatrix, EstimateError> {
        let legs: Vec<Vec<Leg>> = locations
            .par_iter()
            .map(|from| {
                locations
                    .iter()
                    .map(|to| {
                        if from == to {
                            Leg::ZERO
                        } else {
                            self.leg_between(from, to)
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(TravelMatrix::new(locations.to_vec(), legs))
    }

    fn leg(&self, from: &Location, to: &Location) -> Result<Leg, EstimateError> {
        Ok(self.leg_between(from, to))
    }
}
