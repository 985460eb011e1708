//! Test fixtures for delivery-routing.
//!
//! Provides realistic test data including:
//! - Real Taipei-area locations (from OpenStreetMap)
//! - Builders for orders, fleets, requests and engines
#![allow(dead_code)]

pub mod taipei_locations;

pub use taipei_locations::*;

use std::sync::Arc;

use delivery_routing::events::BufferSink;
use delivery_routing::haversine::HaversineEstimator;
use delivery_routing::lifecycle::{Engine, EngineConfig};
use delivery_routing::model::{Driver, Order, Vehicle, VehicleType};
use delivery_routing::solver::{
    CancelToken, OptimizationRequest, OptimizationResult, SolveOptions, solve,
};

/// 2025-08-20T00:00:00Z.
pub const SERVICE_DATE: i64 = 1_755_648_000;

/// 08:00 departure on the service date.
pub const DEPARTURE: i64 = SERVICE_DATE + 8 * 3600;

/// An order at a named place with a light default load.
pub fn order(id: &str, place: &Place) -> Order {
    Order::new(id, place.location()).with_load(20.0, 0.5)
}

pub fn drivers(n: usize) -> Vec<Driver> {
    (1..=n)
        .map(|i| Driver::new(format!("DRV_{i:03}"), format!("Driver {i}")))
        .collect()
}

pub fn vans(n: usize) -> Vec<Vehicle> {
    (1..=n)
        .map(|i| {
            Vehicle::new(format!("VEH_{i:03}"), VehicleType::Van, 800.0, 8.0)
                .with_registration(format!("TPE-{:04}", 1000 + i))
        })
        .collect()
}

pub fn request(
    orders: Vec<Order>,
    drivers: Vec<Driver>,
    vehicles: Vec<Vehicle>,
) -> OptimizationRequest {
    OptimizationRequest {
        request_id: "OPT_TEST_001".into(),
        service_date: SERVICE_DATE,
        departure_time: DEPARTURE,
        warehouse: WAREHOUSES[0].location(),
        orders,
        drivers,
        vehicles,
        constraints: Default::default(),
    }
}

/// Solves with the haversine estimator and default options.
pub fn solve_default(request: &OptimizationRequest) -> OptimizationResult {
    solve(
        request,
        &HaversineEstimator::default(),
        &SolveOptions::default(),
        &CancelToken::new(),
    )
    .expect("request should be solvable")
}

/// An engine over the haversine estimator with a buffering event sink.
pub fn engine() -> (Engine, Arc<BufferSink>) {
    let sink = Arc::new(BufferSink::new());
    let engine = Engine::new(
        Arc::new(HaversineEstimator::default()),
        EngineConfig::default(),
    )
    .with_sink(sink.clone());
    (engine, sink)
}

/// Registers fleet and orders, solves, applies, and returns the result and
/// created route ids.
pub fn engine_with_applied_routes(
    orders: Vec<Order>,
    fleet_size: usize,
) -> (
    Engine,
    Arc<BufferSink>,
    OptimizationResult,
    Vec<delivery_routing::model::RouteId>,
) {
    let (engine, sink) = engine();
    let drivers = drivers(fleet_size);
    let vehicles = vans(fleet_size);
    for driver in &drivers {
        engine.register_driver(driver.clone());
    }
    for vehicle in &vehicles {
        engine.register_vehicle(vehicle.clone());
    }
    engine.register_orders(orders.clone());

    let request = request(orders, drivers, vehicles);
    let result = solve_default(&request);
    let route_ids = engine
        .apply_result(&result, DEPARTURE - 3600)
        .expect("result should apply cleanly");
    (engine, sink, result, route_ids)
}
