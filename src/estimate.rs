//! Pluggable travel distance/time estimation.
//!
//! Both the optimizer and live tracking price stop-to-stop movement through
//! the [`DistanceEstimator`] trait, so the same plan is costed identically
//! during construction, improvement and execution monitoring.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::Location;

/// Travel cost between two points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leg {
    pub distance_km: f64,
    pub duration_secs: i32,
}

impl Leg {
    pub const ZERO: Leg = Leg {
        distance_km: 0.0,
        duration_secs: 0,
    };
}

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("travel matrix request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("estimator returned a malformed matrix: got {rows} rows, expected {expected}")]
    MalformedMatrix { rows: usize, expected: usize },

    #[error("location ({lat:.6}, {lng:.6}) is not covered by the travel matrix")]
    UnknownLocation { lat: f64, lng: f64 },
}

/// A full pairwise travel matrix over a set of locations.
///
/// Lookup is keyed by coordinates rounded to six decimals, which is below
/// GPS accuracy and keeps duplicate points collapsed.
#[derive(Debug, Clone)]
pub struct TravelMatrix {
    locations: Vec<Location>,
    index: HashMap<String, usize>,
    legs: Vec<Vec<Leg>>,
}

impl TravelMatrix {
    pub fn new(locations: Vec<Location>, legs: Vec<Vec<Leg>>) -> Self {
        let index = locations
            .iter()
            .enumerate()
            .map(|(i, loc)| (location_key(loc), i))
            .collect();
        Self {
            locations,
            index,
            legs,
        }
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn index_of(&self, location: &Location) -> Result<usize, EstimateError> {
        self.index
            .get(&location_key(location))
            .copied()
            .ok_or(EstimateError::UnknownLocation {
                lat: location.lat,
                lng: location.lng,
            })
    }

    pub fn leg(&self, from: &Location, to: &Location) -> Result<Leg, EstimateError> {
        let i = self.index_of(from)?;
        let j = self.index_of(to)?;
        Ok(self.legs[i][j])
    }

    pub fn leg_by_index(&self, from: usize, to: usize) -> Leg {
        self.legs[from][to]
    }
}

/// Maps location sets to pairwise travel distance and duration.
pub trait DistanceEstimator {
    /// Builds a full travel matrix over the given (deduplicated) locations.
    fn matrix(&self, locations: &[Location]) -> Result<TravelMatrix, EstimateError>;

    /// Travel cost for a single pair of points.
    fn leg(&self, from: &Location, to: &Location) -> Result<Leg, EstimateError> {
        let matrix = self.matrix(&[*from, *to])?;
        matrix.leg(from, to)
    }
}

/// Removes duplicate coordinates while preserving first-seen order.
pub fn dedupe_locations(locations: Vec<Location>) -> Vec<Location> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut unique = Vec::new();
    for location in locations {
        let key = location_key(&location);
        if seen.contains_key(&key) {
            continue;
        }
        seen.insert(key, unique.len());
        unique.push(location);
    }
    unique
}

fn location_key(location: &Location) -> String {
    format!("{:.6},{:.6}", location.lat, location.lng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_preserves_order() {
        let locations = vec![
            Location::new(25.0330, 121.5654),
            Location::new(25.0478, 121.5319),
            Location::new(25.0330, 121.5654),
        ];
        let unique = dedupe_locations(locations);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].lat, 25.0330);
        assert_eq!(unique[1].lat, 25.0478);
    }

    #[test]
    fn matrix_lookup_by_location() {
        let locations = vec![Location::new(0.0, 0.0), Location::new(1.0, 1.0)];
        let legs = vec![
            vec![
                Leg::ZERO,
                Leg {
                    distance_km: 5.0,
                    duration_secs: 450,
                },
            ],
            vec![
                Leg {
                    distance_km: 5.0,
                    duration_secs: 450,
                },
                Leg::ZERO,
            ],
        ];
        let matrix = TravelMatrix::new(locations.clone(), legs);

        let leg = matrix.leg(&locations[0], &locations[1]).unwrap();
        assert_eq!(leg.duration_secs, 450);

        let err = matrix.leg(&locations[0], &Location::new(9.0, 9.0));
        assert!(matches!(err, Err(EstimateError::UnknownLocation { .. })));
    }
}
