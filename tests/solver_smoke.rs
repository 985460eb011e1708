//! Smoke test with a synthetic grid estimator.

use delivery_routing::estimate::{DistanceEstimator, EstimateError, Leg, TravelMatrix};
use delivery_routing::model::{Driver, Location, Order, Vehicle, VehicleType};
use delivery_routing::solver::{CancelToken, OptimizationRequest, SolveOptions, solve};

/// Manhattan-distance estimator: one degree is one kilometre, driven at
/// one km/minute. Keeps expected costs easy to reason about.
struct GridEstimator;

impl DistanceEstimator for GridEstimator {
    fn matrix(&self, locations: &[Location]) -> Result<TravelMatrix, EstimateError> {
        let legs = locations
            .iter()
            .map(|from| {
                locations
                    .iter()
                    .map(|to| {
                        let km = (from.lat - to.lat).abs() + (from.lng - to.lng).abs();
                        Leg {
                            distance_km: km,
                            duration_secs: (km * 60.0).round() as i32,
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(TravelMatrix::new(locations.to_vec(), legs))
    }
}

#[test]
fn assigns_grid_orders_across_two_drivers() {
    let orders: Vec<Order> = (1..=6)
        .map(|i| {
            Order::new(
                format!("ORD_{i:03}"),
                Location::new(f64::from(i), if i % 2 == 0 { 1.0 } else { -1.0 }),
            )
            .with_load(10.0, 0.2)
            .with_service_duration(300)
        })
        .collect();

    let request = OptimizationRequest {
        request_id: "OPT_SMOKE".into(),
        service_date: 0,
        departure_time: 8 * 3600,
        warehouse: Location::new(0.0, 0.0),
        orders,
        drivers: vec![Driver::new("DRV_001", "A"), Driver::new("DRV_002", "B")],
        vehicles: vec![
            Vehicle::new("VEH_001", VehicleType::Van, 100.0, 4.0),
            Vehicle::new("VEH_002", VehicleType::Van, 100.0, 4.0),
        ],
        constraints: Default::default(),
    };

    let result = solve(
        &request,
        &GridEstimator,
        &SolveOptions::default(),
        &CancelToken::new(),
    )
    .expect("grid request should solve");

    assert!(result.unassigned.is_empty());
    assert!(!result.routes.is_empty() && result.routes.len() <= 2);

    let placed: usize = result.routes.iter().map(|r| r.stops.len()).sum();
    assert_eq!(placed, 6);
    assert!(result.metrics.total_distance_km > 0.0);
}
