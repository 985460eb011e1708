//! Constraint model: hard/soft rules, route timelines, pure validation.
//!
//! Validation is a pure function of (candidate, constraints, travel
//! estimates), with no hidden state, so the optimizer, merge validation and
//! post-hoc audits all call the same code path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::estimate::{EstimateError, TravelMatrix};
use crate::model::{Driver, Location, Order, Vehicle};

/// Weight applied to lateness within the flexibility span, per minute late.
const LATENESS_PENALTY_PER_MIN: f64 = 1.0;

/// Penalty for a stop whose zone the driver does not cover.
const ZONE_MISMATCH_PENALTY: f64 = 10.0;

/// Optimization goals, weighted in [`ConstraintSet::goals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    MinimizeDistance,
    MaximizeOnTime,
    BalanceRoutes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedGoal {
    pub goal: OptimizationGoal,
    pub weight: f64,
}

impl WeightedGoal {
    pub fn new(goal: OptimizationGoal, weight: f64) -> Self {
        Self { goal, weight }
    }
}

/// Request-scoped, immutable planning limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub max_route_distance_km: f64,
    pub max_route_duration_secs: i32,
    pub max_stops_per_route: usize,
    /// Tolerated lateness against a stop's time window. Lateness within the
    /// flexibility is penalized; beyond it the candidate is infeasible.
    pub time_window_flexibility_secs: i32,
    pub goals: Vec<WeightedGoal>,
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            max_route_distance_km: 100.0,
            max_route_duration_secs: 8 * 3600,
            max_stops_per_route: 15,
            time_window_flexibility_secs: 30 * 60,
            goals: vec![
                WeightedGoal::new(OptimizationGoal::MinimizeDistance, 1.0),
                WeightedGoal::new(OptimizationGoal::MaximizeOnTime, 1.0),
                WeightedGoal::new(OptimizationGoal::BalanceRoutes, 1.0),
            ],
        }
    }
}

impl ConstraintSet {
    pub fn weight_for(&self, goal: OptimizationGoal) -> f64 {
        self.goals
            .iter()
            .find(|g| g.goal == goal)
            .map(|g| g.weight)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintRule {
    CapacityWeight,
    CapacityVolume,
    VehicleTypeRequired,
    MaxStops,
    MaxRouteDistance,
    MaxRouteDuration,
    TimeWindow,
    ZoneEligibility,
}

impl fmt::Display for ConstraintRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintRule::CapacityWeight => "capacity_weight",
            ConstraintRule::CapacityVolume => "capacity_volume",
            ConstraintRule::VehicleTypeRequired => "vehicle_type_required",
            ConstraintRule::MaxStops => "max_stops",
            ConstraintRule::MaxRouteDistance => "max_route_distance",
            ConstraintRule::MaxRouteDuration => "max_route_duration",
            ConstraintRule::TimeWindow => "time_window",
            ConstraintRule::ZoneEligibility => "zone_eligibility",
        };
        f.write_str(name)
    }
}

/// A single broken or penalized rule, naming the offending entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: ConstraintRule,
    pub severity: Severity,
    pub detail: String,
    /// Score penalty contributed when the severity is soft.
    pub penalty: f64,
}

/// Outcome of validating a route candidate.
///
/// Soft violations do not reject a candidate; their penalties feed the
/// optimizer's scoring instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Feasible {
        penalty: f64,
        soft_violations: Vec<Violation>,
    },
    Violated {
        violations: Vec<Violation>,
    },
}

impl ValidationResult {
    pub fn is_feasible(&self) -> bool {
        matches!(self, ValidationResult::Feasible { .. })
    }

    /// Soft penalty of a feasible candidate; zero when violated.
    pub fn penalty(&self) -> f64 {
        match self {
            ValidationResult::Feasible { penalty, .. } => *penalty,
            ValidationResult::Violated { .. } => 0.0,
        }
    }

    /// First hard violation, when the candidate was rejected.
    pub fn first_hard(&self) -> Option<&Violation> {
        match self {
            ValidationResult::Feasible { .. } => None,
            ValidationResult::Violated { violations } => violations
                .iter()
                .find(|v| v.severity == Severity::Hard),
        }
    }
}

/// A route candidate under evaluation: one (driver, vehicle) pair and an
/// ordered list of orders.
#[derive(Debug, Clone)]
pub struct RouteCandidate<'a> {
    pub driver: &'a Driver,
    pub vehicle: &'a Vehicle,
    pub orders: Vec<&'a Order>,
}

/// Planned timing of a stop sequence: arrivals, waits, lateness, totals.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTimeline {
    /// Planned arrival at each stop, in order.
    pub arrivals: Vec<i64>,
    /// Lateness against each stop's window end (zero when windowless or on
    /// time), before flexibility is applied.
    pub lateness_secs: Vec<i64>,
    /// Travel distance of the leg arriving at each stop.
    pub leg_distances_km: Vec<f64>,
    pub total_distance_km: f64,
    /// Departure-to-last-service-end span: travel + waiting + service.
    pub total_duration_secs: i32,
}

/// Computes planned arrivals for an ordered stop sequence.
///
/// Arriving before a window start waits until it opens; lateness against the
/// window end is recorded, not rejected; feasibility is [`validate`]'s job.
pub fn plan_timeline(
    start: &Location,
    departure: i64,
    orders: &[&Order],
    matrix: &TravelMatrix,
) -> Result<RouteTimeline, EstimateError> {
    let mut time = departure;
    let mut prev = *start;
    let mut arrivals = Vec::with_capacity(orders.len());
    let mut lateness_secs = Vec::with_capacity(orders.len());
    let mut leg_distances_km = Vec::with_capacity(orders.len());
    let mut total_distance_km = 0.0;

    for order in orders {
        let leg = matrix.leg(&prev, &order.location)?;
        time += i64::from(leg.duration_secs);
        total_distance_km += leg.distance_km;
        leg_distances_km.push(leg.distance_km);

        let mut lateness = 0;
        if let Some(window) = order.time_window {
            if time < window.start {
                time = window.start;
            }
            if time > window.end {
                lateness = time - window.end;
            }
        }

        arrivals.push(time);
        lateness_secs.push(lateness);
        time += i64::from(order.service_duration_secs);
        prev = order.location;
    }

    Ok(RouteTimeline {
        arrivals,
        lateness_secs,
        leg_distances_km,
        total_distance_km,
        total_duration_secs: (time - departure) as i32,
    })
}

/// Validates a candidate against the constraint set.
///
/// Hard rules (capacity, vehicle class, stop count, route distance/duration,
/// lateness beyond flexibility) reject; soft rules (lateness within
/// flexibility, zone mismatch) accumulate a penalty.
pub fn validate(
    candidate: &RouteCandidate<'_>,
    timeline: &RouteTimeline,
    constraints: &ConstraintSet,
) -> ValidationResult {
    let mut violations = Vec::new();

    let weight: f64 = candidate.orders.iter().map(|o| o.weight_kg).sum();
    if weight > candidate.vehicle.capacity_weight_kg {
        violations.push(Violation {
            rule: ConstraintRule::CapacityWeight,
            severity: Severity::Hard,
            detail: format!(
                "load {:.1}kg exceeds vehicle {} capacity {:.1}kg",
                weight, candidate.vehicle.id, candidate.vehicle.capacity_weight_kg
            ),
            penalty: 0.0,
        });
    }

    let volume: f64 = candidate.orders.iter().map(|o| o.volume_m3).sum();
    if volume > candidate.vehicle.capacity_volume_m3 {
        violations.push(Violation {
            rule: ConstraintRule::CapacityVolume,
            severity: Severity::Hard,
            detail: format!(
                "load {:.2}m3 exceeds vehicle {} capacity {:.2}m3",
                volume, candidate.vehicle.id, candidate.vehicle.capacity_volume_m3
            ),
            penalty: 0.0,
        });
    }

    if !candidate.driver.can_drive(candidate.vehicle.vehicle_type) {
        violations.push(Violation {
            rule: ConstraintRule::VehicleTypeRequired,
            severity: Severity::Hard,
            detail: format!(
                "driver {} is not licensed for {}",
                candidate.driver.id, candidate.vehicle.vehicle_type
            ),
            penalty: 0.0,
        });
    }

    for order in &candidate.orders {
        if let Some(required) = order.required_vehicle_type {
            if required != candidate.vehicle.vehicle_type {
                violations.push(Violation {
                    rule: ConstraintRule::VehicleTypeRequired,
                    severity: Severity::Hard,
                    detail: format!(
                        "order {} requires {}, vehicle {} is {}",
                        order.id, required, candidate.vehicle.id, candidate.vehicle.vehicle_type
                    ),
                    penalty: 0.0,
                });
            }
        }
    }

    if candidate.orders.len() > constraints.max_stops_per_route {
        violations.push(Violation {
            rule: ConstraintRule::MaxStops,
            severity: Severity::Hard,
            detail: format!(
                "{} stops exceeds limit {}",
                candidate.orders.len(),
                constraints.max_stops_per_route
            ),
            penalty: 0.0,
        });
    }

    if timeline.total_distance_km > constraints.max_route_distance_km {
        violations.push(Violation {
            rule: ConstraintRule::MaxRouteDistance,
            severity: Severity::Hard,
            detail: format!(
                "{:.1}km exceeds limit {:.1}km",
                timeline.total_distance_km, constraints.max_route_distance_km
            ),
            penalty: 0.0,
        });
    }

    if timeline.total_duration_secs > constraints.max_route_duration_secs {
        violations.push(Violation {
            rule: ConstraintRule::MaxRouteDuration,
            severity: Severity::Hard,
            detail: format!(
                "{}s exceeds limit {}s",
                timeline.total_duration_secs, constraints.max_route_duration_secs
            ),
            penalty: 0.0,
        });
    }

    for (order, lateness) in candidate.orders.iter().zip(&timeline.lateness_secs) {
        if *lateness == 0 {
            continue;
        }
        if *lateness > i64::from(constraints.time_window_flexibility_secs) {
            violations.push(Violation {
                rule: ConstraintRule::TimeWindow,
                severity: Severity::Hard,
                detail: format!(
                    "order {} would be {}s late, beyond flexibility {}s",
                    order.id, lateness, constraints.time_window_flexibility_secs
                ),
                penalty: 0.0,
            });
        } else {
            violations.push(Violation {
                rule: ConstraintRule::TimeWindow,
                severity: Severity::Soft,
                detail: format!("order {} within flexibility, {}s late", order.id, lateness),
                penalty: (*lateness as f64 / 60.0) * LATENESS_PENALTY_PER_MIN,
            });
        }
    }

    for order in &candidate.orders {
        if let Some(zone) = &order.zone {
            if !candidate.driver.covers_zone(zone) {
                violations.push(Violation {
                    rule: ConstraintRule::ZoneEligibility,
                    severity: Severity::Soft,
                    detail: format!(
                        "driver {} does not cover zone {} (order {})",
                        candidate.driver.id, zone, order.id
                    ),
                    penalty: ZONE_MISMATCH_PENALTY,
                });
            }
        }
    }

    if violations.iter().any(|v| v.severity == Severity::Hard) {
        ValidationResult::Violated { violations }
    } else {
        let penalty = violations.iter().map(|v| v.penalty).sum();
        ValidationResult::Feasible {
            penalty,
            soft_violations: violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haversine::HaversineEstimator;
    use crate::estimate::{DistanceEstimator, dedupe_locations};
    use crate::model::VehicleType;

    fn matrix_for(warehouse: Location, orders: &[&Order]) -> TravelMatrix {
        let mut locations = vec![warehouse];
        locations.extend(orders.iter().map(|o| o.location));
        HaversineEstimator::default()
            .matrix(&dedupe_locations(locations))
            .unwrap()
    }

    #[test]
    fn timeline_waits_for_window_start() {
        let warehouse = Location::new(25.0, 121.5);
        let order = Order::new("O1", Location::new(25.01, 121.5))
            .with_time_window(10_000, 20_000)
            .with_service_duration(600);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);

        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();
        assert_eq!(timeline.arrivals[0], 10_000);
        assert_eq!(timeline.lateness_secs[0], 0);
    }

    #[test]
    fn timeline_records_lateness() {
        let warehouse = Location::new(25.0, 121.5);
        let order = Order::new("O1", Location::new(25.01, 121.5)).with_time_window(0, 10);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);

        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();
        assert!(timeline.lateness_secs[0] > 0);
    }

    #[test]
    fn overweight_load_is_hard_violation() {
        let warehouse = Location::new(25.0, 121.5);
        let order = Order::new("O1", Location::new(25.01, 121.5)).with_load(900.0, 1.0);
        let driver = Driver::new("D1", "Chang");
        let vehicle = Vehicle::new("V1", VehicleType::Van, 500.0, 8.0);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);
        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();

        let candidate = RouteCandidate {
            driver: &driver,
            vehicle: &vehicle,
            orders,
        };
        let result = validate(&candidate, &timeline, &ConstraintSet::default());
        assert!(!result.is_feasible());
        assert_eq!(
            result.first_hard().map(|v| v.rule),
            Some(ConstraintRule::CapacityWeight)
        );
    }

    #[test]
    fn lateness_within_flexibility_is_soft() {
        let warehouse = Location::new(25.0, 121.5);
        // Window closes right away; the ~1.1km leg takes ~100s, well within
        // the default 30min flexibility.
        let order = Order::new("O1", Location::new(25.01, 121.5)).with_time_window(0, 10);
        let driver = Driver::new("D1", "Chang");
        let vehicle = Vehicle::new("V1", VehicleType::Van, 500.0, 8.0);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);
        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();

        let candidate = RouteCandidate {
            driver: &driver,
            vehicle: &vehicle,
            orders,
        };
        let result = validate(&candidate, &timeline, &ConstraintSet::default());
        assert!(result.is_feasible());
        assert!(result.penalty() > 0.0);
    }

    #[test]
    fn required_vehicle_type_is_enforced() {
        let warehouse = Location::new(25.0, 121.5);
        let order = Order::new("O1", Location::new(25.01, 121.5))
            .requiring_vehicle(VehicleType::TemperatureControlled);
        let driver = Driver::new("D1", "Chang");
        let vehicle = Vehicle::new("V1", VehicleType::Van, 500.0, 8.0);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);
        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();

        let candidate = RouteCandidate {
            driver: &driver,
            vehicle: &vehicle,
            orders,
        };
        let result = validate(&candidate, &timeline, &ConstraintSet::default());
        assert_eq!(
            result.first_hard().map(|v| v.rule),
            Some(ConstraintRule::VehicleTypeRequired)
        );
    }

    #[test]
    fn zone_mismatch_is_soft() {
        let warehouse = Location::new(25.0, 121.5);
        let order = Order::new("O1", Location::new(25.01, 121.5)).with_zone("south");
        let driver = Driver::new("D1", "Chang").with_zones(vec!["north".to_string()]);
        let vehicle = Vehicle::new("V1", VehicleType::Van, 500.0, 8.0);
        let orders = vec![&order];
        let matrix = matrix_for(warehouse, &orders);
        let timeline = plan_timeline(&warehouse, 0, &orders, &matrix).unwrap();

        let candidate = RouteCandidate {
            driver: &driver,
            vehicle: &vehicle,
            orders,
        };
        let result = validate(&candidate, &timeline, &ConstraintSet::default());
        assert!(result.is_feasible());
        assert!(result.penalty() >= ZONE_MISMATCH_PENALTY);
    }
}
