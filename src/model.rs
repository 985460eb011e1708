//! Core domain types: orders, stops, routes, drivers, vehicles.
//!
//! Ids are string newtypes matching the surrounding system's identifiers
//! (`ROUTE_001`, `DRV_001`, ...). Times are unix seconds, durations are
//! seconds, distances are kilometres, weights kg, volumes m³.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of an externally created delivery order.
    OrderId
);
string_id!(
    /// Identifier of a route.
    RouteId
);
string_id!(
    /// Identifier of a stop within a route.
    StopId
);
string_id!(
    /// Identifier of a driver.
    DriverId
);
string_id!(
    /// Identifier of a vehicle.
    VehicleId
);
string_id!(
    /// Identifier of an optimization request.
    RequestId
);
string_id!(
    /// Identifier of an optimization result.
    ResultId
);

/// Geographic coordinates (latitude, longitude).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A delivery time window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// End of the window widened by the configured flexibility.
    pub fn end_with_flexibility(&self, flexibility_secs: i32) -> i64 {
        self.end + i64::from(flexibility_secs)
    }
}

/// Vehicle classes the fleet is composed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Van,
    SmallTruck,
    LargeTruck,
    TemperatureControlled,
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleType::Van => "van",
            VehicleType::SmallTruck => "small_truck",
            VehicleType::LargeTruck => "large_truck",
            VehicleType::TemperatureControlled => "temperature_controlled",
        };
        f.write_str(name)
    }
}

/// An external delivery demand. Created by the order system; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub location: Location,
    pub address: String,
    /// Delivery zone code, when the order belongs to a served zone.
    pub zone: Option<String>,
    pub weight_kg: f64,
    pub volume_m3: f64,
    pub packages: u32,
    /// Estimated on-site service time.
    pub service_duration_secs: i32,
    pub time_window: Option<TimeWindow>,
    /// Required vehicle class, e.g. refrigerated goods.
    pub required_vehicle_type: Option<VehicleType>,
    pub signature_required: bool,
    pub photo_required: bool,
}

impl Order {
    pub fn new(id: impl Into<OrderId>, location: Location) -> Self {
        Self {
            id: id.into(),
            location,
            address: String::new(),
            zone: None,
            weight_kg: 0.0,
            volume_m3: 0.0,
            packages: 1,
            service_duration_secs: 15 * 60,
            time_window: None,
            required_vehicle_type: None,
            signature_required: false,
            photo_required: false,
        }
    }

    pub fn with_load(mut self, weight_kg: f64, volume_m3: f64) -> Self {
        self.weight_kg = weight_kg;
        self.volume_m3 = volume_m3;
        self
    }

    pub fn with_time_window(mut self, start: i64, end: i64) -> Self {
        self.time_window = Some(TimeWindow::new(start, end));
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_service_duration(mut self, secs: i32) -> Self {
        self.service_duration_secs = secs;
        self
    }

    pub fn requiring_vehicle(mut self, vehicle_type: VehicleType) -> Self {
        self.required_vehicle_type = Some(vehicle_type);
        self
    }

    pub fn requiring_signature(mut self) -> Self {
        self.signature_required = true;
        self
    }

    pub fn requiring_photo(mut self) -> Self {
        self.photo_required = true;
        self
    }
}

/// Driver availability states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Available,
    OnRoute,
    Unavailable,
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverStatus::Available => "available",
            DriverStatus::OnRoute => "on_route",
            DriverStatus::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// A driver resource with zone and vehicle-class eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub status: DriverStatus,
    /// Zones this driver covers. Empty means no zone preference.
    pub zones: Vec<String>,
    /// Vehicle classes the driver is licensed for. Empty means all classes.
    pub vehicle_types: Vec<VehicleType>,
}

impl Driver {
    pub fn new(id: impl Into<DriverId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: DriverStatus::Available,
            zones: Vec::new(),
            vehicle_types: Vec::new(),
        }
    }

    pub fn with_zones(mut self, zones: Vec<String>) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_vehicle_types(mut self, types: Vec<VehicleType>) -> Self {
        self.vehicle_types = types;
        self
    }

    pub fn with_status(mut self, status: DriverStatus) -> Self {
        self.status = status;
        self
    }

    pub fn can_drive(&self, vehicle_type: VehicleType) -> bool {
        self.vehicle_types.is_empty() || self.vehicle_types.contains(&vehicle_type)
    }

    pub fn covers_zone(&self, zone: &str) -> bool {
        self.zones.is_empty() || self.zones.iter().any(|z| z == zone)
    }
}

/// Vehicle availability states. `Maintenance` is unavailable for planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Available,
    InUse,
    Maintenance,
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleStatus::Available => "available",
            VehicleStatus::InUse => "in_use",
            VehicleStatus::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// A vehicle resource with capacity limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub registration: String,
    pub vehicle_type: VehicleType,
    pub capacity_weight_kg: f64,
    pub capacity_volume_m3: f64,
    pub status: VehicleStatus,
}

impl Vehicle {
    pub fn new(
        id: impl Into<VehicleId>,
        vehicle_type: VehicleType,
        capacity_weight_kg: f64,
        capacity_volume_m3: f64,
    ) -> Self {
        Self {
            id: id.into(),
            registration: String::new(),
            vehicle_type,
            capacity_weight_kg,
            capacity_volume_m3,
            status: VehicleStatus::Available,
        }
    }

    pub fn with_registration(mut self, registration: impl Into<String>) -> Self {
        self.registration = registration.into();
        self
    }

    pub fn with_status(mut self, status: VehicleStatus) -> Self {
        self.status = status;
        self
    }
}

/// Per-stop execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Pending,
    Arrived,
    Completed,
    Skipped,
}

impl StopStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopStatus::Completed | StopStatus::Skipped)
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopStatus::Pending => "pending",
            StopStatus::Arrived => "arrived",
            StopStatus::Completed => "completed",
            StopStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Signature / photo evidence captured when completing a stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProofOfDelivery {
    pub signature_ref: Option<String>,
    pub photo_ref: Option<String>,
    pub notes: Option<String>,
}

impl ProofOfDelivery {
    pub fn signature(reference: impl Into<String>) -> Self {
        Self {
            signature_ref: Some(reference.into()),
            ..Self::default()
        }
    }

    pub fn with_photo(mut self, reference: impl Into<String>) -> Self {
        self.photo_ref = Some(reference.into());
        self
    }
}

/// One order realized inside a route. Owned exclusively by its route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub route_id: RouteId,
    pub order_id: OrderId,
    /// 1-based, dense, unique within the route.
    pub sequence: u32,
    pub status: StopStatus,
    pub location: Location,
    pub address: String,
    pub planned_arrival: i64,
    pub planned_service_secs: i32,
    pub actual_arrival: Option<i64>,
    pub actual_service_secs: Option<i32>,
    pub signature_required: bool,
    pub photo_required: bool,
    pub proof: Option<ProofOfDelivery>,
    pub skip_reason: Option<String>,
}

/// Route execution states. Reassignment does not change the status; it is
/// recorded in the route's [`ReassignmentRecord`] history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl RouteStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RouteStatus::Planned | RouteStatus::InProgress)
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteStatus::Planned => "planned",
            RouteStatus::InProgress => "in_progress",
            RouteStatus::Completed => "completed",
            RouteStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One driver/vehicle rebinding, appended on every reassignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassignmentRecord {
    pub seq: u32,
    pub from_driver: DriverId,
    pub from_vehicle: VehicleId,
    pub to_driver: DriverId,
    pub to_vehicle: VehicleId,
    pub reason: String,
    pub at: i64,
}

/// An ordered sequence of stops bound to one (driver, vehicle) pair for one
/// service date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    /// Human-readable number, `RT-<yyyymmdd>-<nnn>`.
    pub route_number: String,
    pub service_date: i64,
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub status: RouteStatus,
    /// Departure point (warehouse) the plan was built from.
    pub start_location: Location,
    pub stops: Vec<Stop>,
    pub total_distance_km: f64,
    pub total_duration_secs: i32,
    pub completed_stops: u32,
    pub optimization_score: f64,
    pub constraints: crate::constraints::ConstraintSet,
    pub reassignments: Vec<ReassignmentRecord>,
}

impl Route {
    /// The lowest-sequence stop that is not yet completed or skipped.
    pub fn current_stop(&self) -> Option<&Stop> {
        self.stops
            .iter()
            .filter(|s| !s.status.is_terminal())
            .min_by_key(|s| s.sequence)
    }

    pub fn stop(&self, stop_id: &StopId) -> Option<&Stop> {
        self.stops.iter().find(|s| &s.id == stop_id)
    }

    /// Stops not yet completed or skipped, in sequence order.
    pub fn remaining_stops(&self) -> Vec<&Stop> {
        let mut remaining: Vec<&Stop> = self
            .stops
            .iter()
            .filter(|s| !s.status.is_terminal())
            .collect();
        remaining.sort_by_key(|s| s.sequence);
        remaining
    }

    pub fn all_stops_terminal(&self) -> bool {
        self.stops.iter().all(|s| s.status.is_terminal())
    }

    /// Location of the most recent completed stop, if any.
    pub fn last_completed_location(&self) -> Option<Location> {
        self.stops
            .iter()
            .filter(|s| s.status == StopStatus::Completed)
            .max_by_key(|s| s.sequence)
            .map(|s| s.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(seq: u32, status: StopStatus) -> Stop {
        Stop {
            id: StopId::new(format!("S{seq}")),
            route_id: RouteId::from("R1"),
            order_id: OrderId::new(format!("O{seq}")),
            sequence: seq,
            status,
            location: Location::new(25.0, 121.5),
            address: String::new(),
            planned_arrival: 0,
            planned_service_secs: 600,
            actual_arrival: None,
            actual_service_secs: None,
            signature_required: false,
            photo_required: false,
            proof: None,
            skip_reason: None,
        }
    }

    fn route_with(stops: Vec<Stop>) -> Route {
        Route {
            id: RouteId::from("R1"),
            route_number: "RT-20250820-001".to_string(),
            service_date: 0,
            driver_id: DriverId::from("D1"),
            vehicle_id: VehicleId::from("V1"),
            status: RouteStatus::InProgress,
            start_location: Location::new(25.0, 121.5),
            stops,
            total_distance_km: 0.0,
            total_duration_secs: 0,
            completed_stops: 0,
            optimization_score: 0.0,
            constraints: crate::constraints::ConstraintSet::default(),
            reassignments: Vec::new(),
        }
    }

    #[test]
    fn current_stop_is_lowest_non_terminal() {
        let route = route_with(vec![
            stop(1, StopStatus::Completed),
            stop(2, StopStatus::Skipped),
            stop(3, StopStatus::Pending),
            stop(4, StopStatus::Pending),
        ]);
        assert_eq!(route.current_stop().map(|s| s.sequence), Some(3));
    }

    #[test]
    fn remaining_stops_sorted_by_sequence() {
        let route = route_with(vec![
            stop(3, StopStatus::Pending),
            stop(1, StopStatus::Completed),
            stop(2, StopStatus::Arrived),
        ]);
        let seqs: Vec<u32> = route.remaining_stops().iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn driver_vehicle_type_eligibility() {
        let driver = Driver::new("D1", "Chang")
            .with_vehicle_types(vec![VehicleType::Van, VehicleType::SmallTruck]);
        assert!(driver.can_drive(VehicleType::Van));
        assert!(!driver.can_drive(VehicleType::LargeTruck));

        let unrestricted = Driver::new("D2", "Lee");
        assert!(unrestricted.can_drive(VehicleType::LargeTruck));
    }

    #[test]
    fn time_window_flexibility_widens_end() {
        let window = TimeWindow::new(100, 200);
        assert!(window.contains(150));
        assert!(!window.contains(201));
        assert_eq!(window.end_with_flexibility(1800), 2000);
    }
}
