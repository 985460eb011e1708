//! OSRM HTTP adapter for travel matrices.

use serde::Deserialize;
use tracing::warn;

use crate::estimate::{DistanceEstimator, EstimateError, Leg, TravelMatrix};
use crate::model::Location;

#[derive(Debug, Clone)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "car".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsrmEstimator {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
}

impl OsrmEstimator {
    pub fn new(config: OsrmConfig) -> Result<Self, EstimateError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }
}

impl DistanceEstimator for OsrmEstimator {
    fn matrix(&self, locations: &[Location]) -> Result<TravelMatrix, EstimateError> {
        if locations.is_empty() {
            return Ok(TravelMatrix::new(Vec::new(), Vec::new()));
        }

        let coords = locations
            .iter()
            .map(|loc| format!("{:.6},{:.6}", loc.lng, loc.lat))
            .collect::<Vec<_>>()
            .join(";");

        let url = format!(
            "{}/table/v1/{}/{}?annotations=duration,distance",
            self.config.base_url, self.config.profile, coords
        );

        let body = self
            .client
            .get(&url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.json::<OsrmTableResponse>())
            .map_err(|err| {
                warn!(base_url = %self.config.base_url, error = %err, "OSRM table request failed");
                err
            })?;

        let durations = body.durations.unwrap_or_default();
        let distances = body.distances.unwrap_or_default();
        if durations.len() != locations.len() || distances.len() != locations.len() {
            return Err(EstimateError::MalformedMatrix {
                rows: durations.len().min(distances.len()),
                expected: locations.len(),
            });
        }

        let legs = durations
            .into_iter()
            .zip(distances)
            .map(|(duration_row, distance_row)| {
                duration_row
                    .into_iter()
                    .zip(distance_row)
                    .map(|(duration, meters)| Leg {
                        distance_km: meters / 1000.0,
                        duration_secs: duration.round() as i32,
                    })
                    .collect()
            })
            .collect();

        Ok(TravelMatrix::new(locations.to_vec(), legs))
    }
}

#[derive(Debug, Deserialize)]
struct OsrmTableResponse {
    durations: Option<Vec<Vec<f64>>>,
    distances: Option<Vec<Vec<f64>>>,
}
