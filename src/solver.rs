//! Route optimizer: construction + bounded local-search improvement.
//!
//! Construction pairs available drivers with compatible vehicles, seeds the
//! insertion order with a polar-angle sweep around the warehouse, then
//! places each order at its cheapest feasible position. Improvement runs
//! 2-opt segment reversal and cross-route relocation, accepting only moves
//! that keep every touched route feasible and strictly improve the weighted
//! goal score. The whole pipeline is deterministic: identical requests
//! produce identical results.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constraints::{
    ConstraintSet, OptimizationGoal, RouteCandidate, RouteTimeline, ValidationResult,
    plan_timeline, validate,
};
use crate::error::Error;
use crate::estimate::{DistanceEstimator, TravelMatrix, dedupe_locations};
use crate::model::{
    Driver, DriverId, DriverStatus, Location, Order, OrderId, RequestId, ResultId, Vehicle,
    VehicleId, VehicleStatus,
};

const EPS: f64 = 1e-9;

/// Tuning knobs for a single solve run.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Maximum improvement sweeps over the solution.
    pub local_search_iterations: usize,
    /// Wall-clock budget for the improvement phase.
    pub time_budget: Option<Duration>,
    /// Cost-per-kilometre used for the result's cost estimate.
    pub cost_per_km: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            local_search_iterations: 100,
            time_budget: Some(Duration::from_secs(5)),
            cost_per_km: 11.0,
        }
    }
}

/// Cooperative cancellation handle for an in-flight solve.
///
/// Cancelling aborts the solve with [`Error::Cancelled`]; no partial result
/// is returned and no engine state is touched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Snapshot of the planning problem: date, orders, fleet, constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub request_id: RequestId,
    /// Service date at midnight, unix seconds.
    pub service_date: i64,
    /// Planned departure from the warehouse, unix seconds.
    pub departure_time: i64,
    pub warehouse: Location,
    pub orders: Vec<Order>,
    pub drivers: Vec<Driver>,
    pub vehicles: Vec<Vehicle>,
    pub constraints: ConstraintSet,
}

/// Why an order could not be placed on any route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    /// No available driver/vehicle pairs at all.
    FleetExhausted,
    /// No paired vehicle satisfies the order's required vehicle class.
    NoCompatibleVehicle,
    /// The order alone exceeds every paired vehicle's capacity.
    ExceedsVehicleCapacity,
    /// No insertion position satisfies the order's time window.
    NoFeasibleTimeWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedOrder {
    pub order_id: OrderId,
    pub reason: BlockedReason,
}

/// One stop of a proposed route, in visiting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedStop {
    pub order_id: OrderId,
    /// 1-based dense sequence.
    pub sequence: u32,
    pub planned_arrival: i64,
    pub planned_service_secs: i32,
    /// Travel distance of the leg arriving at this stop.
    pub leg_distance_km: f64,
}

/// A route proposal; materialized only when the result is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedRoute {
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub stops: Vec<ProposedStop>,
    pub total_distance_km: f64,
    pub total_duration_secs: i32,
    pub load_weight_kg: f64,
    pub load_volume_m3: f64,
    /// Capacity utilization percentage (max of weight and volume ratios).
    pub utilization_pct: f64,
    /// Per-route objective contribution (distance plus soft penalty); lower
    /// is better.
    pub score: f64,
}

/// Aggregate quality metrics of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub routes_created: usize,
    pub total_distance_km: f64,
    pub total_duration_secs: i64,
    /// Estimated probability of meeting all time windows, 0..=1.
    pub on_time_probability: f64,
    pub cost_estimate: f64,
    /// Distance saved against the naive one-order-per-route baseline.
    pub savings_percentage: f64,
    /// Weighted objective value; lower is better.
    pub optimization_score: f64,
}

/// Immutable outcome of a solve. Applying it materializes routes and
/// consumes the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub result_id: ResultId,
    pub request_id: RequestId,
    pub service_date: i64,
    pub departure_time: i64,
    pub warehouse: Location,
    pub constraints: ConstraintSet,
    pub routes: Vec<ProposedRoute>,
    pub unassigned: Vec<BlockedOrder>,
    pub metrics: ResultMetrics,
}

/// A candidate route during search: fleet pair indices plus order indices
/// into the request.
#[derive(Debug, Clone)]
struct PlanRoute {
    driver_idx: usize,
    vehicle_idx: usize,
    orders: Vec<usize>,
    timeline: RouteTimeline,
    penalty: f64,
}

/// Per-route aggregates feeding the solution score.
#[derive(Debug, Clone, Copy)]
struct RouteEval {
    distance_km: f64,
    penalty: f64,
    stops: usize,
    on_time_sum: f64,
    windowed: usize,
}

#[derive(Debug, Clone, Copy)]
struct SolutionScore {
    score: f64,
    routes: usize,
    distance_km: f64,
}

/// Lexicographic acceptance: weighted score, then fewer routes, then lower
/// total distance.
fn improves(candidate: &SolutionScore, incumbent: &SolutionScore) -> bool {
    if (candidate.score - incumbent.score).abs() > EPS {
        return candidate.score < incumbent.score;
    }
    if candidate.routes != incumbent.routes {
        return candidate.routes < incumbent.routes;
    }
    candidate.distance_km + EPS < incumbent.distance_km
}

/// Solves an optimization request.
///
/// Read-only with respect to any engine state; side effects happen only
/// when the result is applied. Deterministic for identical inputs.
pub fn solve(
    request: &OptimizationRequest,
    estimator: &dyn DistanceEstimator,
    options: &SolveOptions,
    cancel: &CancelToken,
) -> Result<OptimizationResult, Error> {
    let started = Instant::now();
    let pairs = pair_fleet(&request.drivers, &request.vehicles);
    debug!(
        request = %request.request_id,
        orders = request.orders.len(),
        pairs = pairs.len(),
        "constructing routes"
    );

    if pairs.is_empty() {
        return Err(Error::NoFeasibleSolution {
            blocked: request
                .orders
                .iter()
                .map(|o| BlockedOrder {
                    order_id: o.id.clone(),
                    reason: BlockedReason::FleetExhausted,
                })
                .collect(),
        });
    }

    let mut locations = vec![request.warehouse];
    locations.extend(request.orders.iter().map(|o| o.location));
    let matrix = estimator.matrix(&dedupe_locations(locations))?;

    let mut routes: Vec<PlanRoute> = pairs
        .iter()
        .map(|&(driver_idx, vehicle_idx)| PlanRoute {
            driver_idx,
            vehicle_idx,
            orders: Vec::new(),
            timeline: empty_timeline(),
            penalty: 0.0,
        })
        .collect();

    let mut blocked = construct(request, &matrix, &mut routes, cancel)?;

    let baseline_km = naive_baseline_km(request, &matrix)?;

    improve(request, &matrix, &mut routes, baseline_km, options, cancel)?;

    routes.retain(|r| !r.orders.is_empty());
    if routes.is_empty() {
        // Every order was blocked; an empty "success" would hide that.
        if !request.orders.is_empty() {
            return Err(Error::NoFeasibleSolution { blocked });
        }
    }

    blocked.sort_by(|a, b| a.order_id.cmp(&b.order_id));
    let result = finish(request, routes, blocked, baseline_km, options);
    info!(
        request = %request.request_id,
        routes = result.metrics.routes_created,
        unassigned = result.unassigned.len(),
        distance_km = result.metrics.total_distance_km,
        savings_pct = result.metrics.savings_percentage,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "optimization finished"
    );
    Ok(result)
}

/// Pairs each available driver with the first unused compatible available
/// vehicle, in declaration order.
fn pair_fleet(drivers: &[Driver], vehicles: &[Vehicle]) -> Vec<(usize, usize)> {
    let mut used = HashSet::new();
    let mut pairs = Vec::new();
    for (di, driver) in drivers.iter().enumerate() {
        if driver.status != DriverStatus::Available {
            continue;
        }
        let vehicle = vehicles.iter().enumerate().find(|(vi, v)| {
            !used.contains(vi)
                && v.status == VehicleStatus::Available
                && driver.can_drive(v.vehicle_type)
        });
        if let Some((vi, _)) = vehicle {
            used.insert(vi);
            pairs.push((di, vi));
        }
    }
    pairs
}

fn empty_timeline() -> RouteTimeline {
    RouteTimeline {
        arrivals: Vec::new(),
        lateness_secs: Vec::new(),
        leg_distances_km: Vec::new(),
        total_distance_km: 0.0,
        total_duration_secs: 0,
    }
}

/// Evaluates one ordered candidate; `None` when any hard constraint fails.
fn evaluate_route(
    request: &OptimizationRequest,
    driver_idx: usize,
    vehicle_idx: usize,
    order_idxs: &[usize],
    matrix: &TravelMatrix,
) -> Result<Option<(RouteTimeline, f64)>, Error> {
    let orders: Vec<&Order> = order_idxs.iter().map(|&i| &request.orders[i]).collect();
    let timeline = plan_timeline(&request.warehouse, request.departure_time, &orders, matrix)?;
    let candidate = RouteCandidate {
        driver: &request.drivers[driver_idx],
        vehicle: &request.vehicles[vehicle_idx],
        orders,
    };
    match validate(&candidate, &timeline, &request.constraints) {
        ValidationResult::Feasible { penalty, .. } => Ok(Some((timeline, penalty))),
        ValidationResult::Violated { .. } => Ok(None),
    }
}

/// Greedy cheapest feasible insertion over sweep-ordered orders.
fn construct(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    routes: &mut Vec<PlanRoute>,
    cancel: &CancelToken,
) -> Result<Vec<BlockedOrder>, Error> {
    let mut order_idxs: Vec<usize> = (0..request.orders.len()).collect();
    order_idxs.sort_by(|&a, &b| {
        let ka = sweep_key(&request.warehouse, &request.orders[a]);
        let kb = sweep_key(&request.warehouse, &request.orders[b]);
        ka.partial_cmp(&kb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| request.orders[a].id.cmp(&request.orders[b].id))
    });

    let mut blocked = Vec::new();

    for oi in order_idxs {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Best feasible insertion per route, scanned in parallel; the
        // sequential reduce keeps selection deterministic.
        let per_route: Vec<Option<(f64, usize, RouteTimeline, f64)>> = routes
            .par_iter()
            .map(|route| best_insertion(request, matrix, route, oi))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut best: Option<(f64, usize, usize, RouteTimeline, f64)> = None;
        for (ri, found) in per_route.into_iter().enumerate() {
            if let Some((cost, pos, timeline, penalty)) = found {
                let replace = match &best {
                    None => true,
                    Some((best_cost, ..)) => cost + EPS < *best_cost,
                };
                if replace {
                    best = Some((cost, ri, pos, timeline, penalty));
                }
            }
        }

        match best {
            Some((_, ri, pos, timeline, penalty)) => {
                routes[ri].orders.insert(pos, oi);
                routes[ri].timeline = timeline;
                routes[ri].penalty = penalty;
            }
            None => {
                blocked.push(BlockedOrder {
                    order_id: request.orders[oi].id.clone(),
                    reason: blocking_reason(request, matrix, routes, oi)?,
                });
            }
        }
    }

    Ok(blocked)
}

/// Polar angle around the warehouse, then distance, for sweep seeding.
fn sweep_key(warehouse: &Location, order: &Order) -> (f64, f64) {
    let dy = order.location.lat - warehouse.lat;
    let dx = order.location.lng - warehouse.lng;
    (dy.atan2(dx), dx.hypot(dy))
}

/// Cheapest feasible insertion position of an order within one route.
fn best_insertion(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    route: &PlanRoute,
    oi: usize,
) -> Result<Option<(f64, usize, RouteTimeline, f64)>, Error> {
    let mut best: Option<(f64, usize, RouteTimeline, f64)> = None;
    for pos in 0..=route.orders.len() {
        let mut candidate = route.orders.clone();
        candidate.insert(pos, oi);
        if let Some((timeline, penalty)) =
            evaluate_route(request, route.driver_idx, route.vehicle_idx, &candidate, matrix)?
        {
            let cost = timeline.total_distance_km - route.timeline.total_distance_km
                + (penalty - route.penalty);
            let replace = match &best {
                None => true,
                Some((best_cost, ..)) => cost + EPS < *best_cost,
            };
            if replace {
                best = Some((cost, pos, timeline, penalty));
            }
        }
    }
    Ok(best)
}

/// Distinguishes why an order found no feasible insertion anywhere.
fn blocking_reason(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    routes: &[PlanRoute],
    oi: usize,
) -> Result<BlockedReason, Error> {
    let order = &request.orders[oi];

    let mut any_type_ok = false;
    let mut any_capacity_ok = false;
    for route in routes {
        let vehicle = &request.vehicles[route.vehicle_idx];
        let type_ok = order
            .required_vehicle_type
            .is_none_or(|required| required == vehicle.vehicle_type);
        if type_ok {
            any_type_ok = true;
            if order.weight_kg <= vehicle.capacity_weight_kg
                && order.volume_m3 <= vehicle.capacity_volume_m3
            {
                any_capacity_ok = true;
            }
        }
    }
    if !any_type_ok {
        return Ok(BlockedReason::NoCompatibleVehicle);
    }
    if !any_capacity_ok {
        return Ok(BlockedReason::ExceedsVehicleCapacity);
    }

    // The order fits some vehicle alone; if even an otherwise-empty route
    // could not serve it, the window is the blocker, else the fleet is full.
    for route in routes {
        if evaluate_route(request, route.driver_idx, route.vehicle_idx, &[oi], matrix)?.is_some() {
            return Ok(BlockedReason::FleetExhausted);
        }
    }
    Ok(BlockedReason::NoFeasibleTimeWindow)
}

/// Bounded best-accept local search: intra-route 2-opt and cross-route
/// relocation.
fn improve(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    routes: &mut [PlanRoute],
    baseline_km: f64,
    options: &SolveOptions,
    cancel: &CancelToken,
) -> Result<(), Error> {
    let deadline = options.time_budget.map(|budget| Instant::now() + budget);

    for iteration in 0..options.local_search_iterations {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                debug!(iteration, "improvement budget exhausted");
                break;
            }
        }

        let mut improved = two_opt_pass(request, matrix, routes, baseline_km)?;
        improved |= relocate_pass(request, matrix, routes, baseline_km)?;

        if !improved {
            debug!(iteration, "local search converged");
            break;
        }
    }

    Ok(())
}

fn evals_of(request: &OptimizationRequest, routes: &[PlanRoute]) -> Vec<RouteEval> {
    routes
        .iter()
        .map(|r| route_eval(request, &r.orders, &r.timeline, r.penalty))
        .collect()
}

fn route_eval(
    request: &OptimizationRequest,
    order_idxs: &[usize],
    timeline: &RouteTimeline,
    penalty: f64,
) -> RouteEval {
    let flexibility = f64::from(request.constraints.time_window_flexibility_secs);
    let mut on_time_sum = 0.0;
    let mut windowed = 0;
    for (idx, arrival) in order_idxs.iter().zip(&timeline.arrivals) {
        if let Some(window) = request.orders[*idx].time_window {
            windowed += 1;
            let late = (*arrival - window.end) as f64;
            on_time_sum += if late <= 0.0 {
                1.0
            } else if late >= flexibility {
                0.0
            } else {
                1.0 - late / flexibility
            };
        }
    }
    RouteEval {
        distance_km: timeline.total_distance_km,
        penalty,
        stops: order_idxs.len(),
        on_time_sum,
        windowed,
    }
}

fn score_from_evals(
    evals: &[RouteEval],
    constraints: &ConstraintSet,
    baseline_km: f64,
    total_orders: usize,
) -> SolutionScore {
    let active: Vec<&RouteEval> = evals.iter().filter(|e| e.stops > 0).collect();
    let total_km: f64 = active.iter().map(|e| e.distance_km).sum();

    let distance_component = total_km / baseline_km.max(1.0);

    let windowed: usize = active.iter().map(|e| e.windowed).sum();
    let on_time = if windowed == 0 {
        1.0
    } else {
        active.iter().map(|e| e.on_time_sum).sum::<f64>() / windowed as f64
    };

    let balance = if active.len() <= 1 {
        0.0
    } else {
        let mean = active.iter().map(|e| e.stops as f64).sum::<f64>() / active.len() as f64;
        let variance = active
            .iter()
            .map(|e| (e.stops as f64 - mean).powi(2))
            .sum::<f64>()
            / active.len() as f64;
        variance.sqrt() / mean.max(1.0)
    };

    let penalty_norm =
        active.iter().map(|e| e.penalty).sum::<f64>() / (10.0 * total_orders.max(1) as f64);

    let score = constraints.weight_for(OptimizationGoal::MinimizeDistance) * distance_component
        + constraints.weight_for(OptimizationGoal::MaximizeOnTime) * (1.0 - on_time)
        + constraints.weight_for(OptimizationGoal::BalanceRoutes) * balance
        + penalty_norm;

    SolutionScore {
        score,
        routes: active.len(),
        distance_km: total_km,
    }
}

/// Reverses a segment within one route when that improves the solution.
/// Returns true after the first applied improvement.
fn two_opt_pass(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    routes: &mut [PlanRoute],
    baseline_km: f64,
) -> Result<bool, Error> {
    let mut evals = evals_of(request, routes);
    let incumbent = score_from_evals(
        &evals,
        &request.constraints,
        baseline_km,
        request.orders.len(),
    );

    for ri in 0..routes.len() {
        let n = routes[ri].orders.len();
        if n < 2 {
            continue;
        }
        for i in 0..n - 1 {
            for j in i + 1..n {
                let mut candidate = routes[ri].orders.clone();
                candidate[i..=j].reverse();

                let Some((timeline, penalty)) = evaluate_route(
                    request,
                    routes[ri].driver_idx,
                    routes[ri].vehicle_idx,
                    &candidate,
                    matrix,
                )?
                else {
                    continue;
                };

                let replaced = evals[ri];
                evals[ri] = route_eval(request, &candidate, &timeline, penalty);
                let score = score_from_evals(
                    &evals,
                    &request.constraints,
                    baseline_km,
                    request.orders.len(),
                );
                if improves(&score, &incumbent) {
                    routes[ri].orders = candidate;
                    routes[ri].timeline = timeline;
                    routes[ri].penalty = penalty;
                    return Ok(true);
                }
                evals[ri] = replaced;
            }
        }
    }

    Ok(false)
}

/// Moves one order between routes when that improves the solution.
/// Returns true after the first applied improvement.
fn relocate_pass(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
    routes: &mut [PlanRoute],
    baseline_km: f64,
) -> Result<bool, Error> {
    let mut evals = evals_of(request, routes);
    let incumbent = score_from_evals(
        &evals,
        &request.constraints,
        baseline_km,
        request.orders.len(),
    );

    for from in 0..routes.len() {
        for order_pos in 0..routes[from].orders.len() {
            let oi = routes[from].orders[order_pos];
            let mut from_candidate = routes[from].orders.clone();
            from_candidate.remove(order_pos);

            let Some((from_timeline, from_penalty)) = evaluate_route(
                request,
                routes[from].driver_idx,
                routes[from].vehicle_idx,
                &from_candidate,
                matrix,
            )?
            else {
                continue;
            };

            for to in 0..routes.len() {
                if to == from {
                    continue;
                }
                for pos in 0..=routes[to].orders.len() {
                    let mut to_candidate = routes[to].orders.clone();
                    to_candidate.insert(pos, oi);

                    let Some((to_timeline, to_penalty)) = evaluate_route(
                        request,
                        routes[to].driver_idx,
                        routes[to].vehicle_idx,
                        &to_candidate,
                        matrix,
                    )?
                    else {
                        continue;
                    };

                    let replaced_from = evals[from];
                    let replaced_to = evals[to];
                    evals[from] = route_eval(request, &from_candidate, &from_timeline, from_penalty);
                    evals[to] = route_eval(request, &to_candidate, &to_timeline, to_penalty);
                    let score = score_from_evals(
                        &evals,
                        &request.constraints,
                        baseline_km,
                        request.orders.len(),
                    );
                    if improves(&score, &incumbent) {
                        routes[from].orders = from_candidate;
                        routes[from].timeline = from_timeline;
                        routes[from].penalty = from_penalty;
                        routes[to].orders = to_candidate;
                        routes[to].timeline = to_timeline;
                        routes[to].penalty = to_penalty;
                        return Ok(true);
                    }
                    evals[from] = replaced_from;
                    evals[to] = replaced_to;
                }
            }
        }
    }

    Ok(false)
}

/// Total distance of serving each order with its own warehouse round trip.
fn naive_baseline_km(
    request: &OptimizationRequest,
    matrix: &TravelMatrix,
) -> Result<f64, Error> {
    let mut total = 0.0;
    for order in &request.orders {
        let out = matrix.leg(&request.warehouse, &order.location)?;
        let back = matrix.leg(&order.location, &request.warehouse)?;
        total += out.distance_km + back.distance_km;
    }
    Ok(total)
}

fn finish(
    request: &OptimizationRequest,
    routes: Vec<PlanRoute>,
    blocked: Vec<BlockedOrder>,
    baseline_km: f64,
    options: &SolveOptions,
) -> OptimizationResult {
    let evals = evals_of(request, &routes);
    let score = score_from_evals(
        &evals,
        &request.constraints,
        baseline_km,
        request.orders.len(),
    );

    let windowed: usize = evals.iter().map(|e| e.windowed).sum();
    let on_time_probability = if windowed == 0 {
        1.0
    } else {
        evals.iter().map(|e| e.on_time_sum).sum::<f64>() / windowed as f64
    };

    let proposed: Vec<ProposedRoute> = routes
        .iter()
        .map(|route| {
            let vehicle = &request.vehicles[route.vehicle_idx];
            let load_weight_kg: f64 = route
                .orders
                .iter()
                .map(|&i| request.orders[i].weight_kg)
                .sum();
            let load_volume_m3: f64 = route
                .orders
                .iter()
                .map(|&i| request.orders[i].volume_m3)
                .sum();
            let weight_ratio = load_weight_kg / vehicle.capacity_weight_kg.max(1.0);
            let volume_ratio = load_volume_m3 / vehicle.capacity_volume_m3.max(0.01);

            let stops = route
                .orders
                .iter()
                .enumerate()
                .map(|(i, &oi)| ProposedStop {
                    order_id: request.orders[oi].id.clone(),
                    sequence: (i + 1) as u32,
                    planned_arrival: route.timeline.arrivals[i],
                    planned_service_secs: request.orders[oi].service_duration_secs,
                    leg_distance_km: route.timeline.leg_distances_km[i],
                })
                .collect();

            ProposedRoute {
                driver_id: request.drivers[route.driver_idx].id.clone(),
                vehicle_id: request.vehicles[route.vehicle_idx].id.clone(),
                stops,
                total_distance_km: route.timeline.total_distance_km,
                total_duration_secs: route.timeline.total_duration_secs,
                load_weight_kg,
                load_volume_m3,
                utilization_pct: weight_ratio.max(volume_ratio) * 100.0,
                score: route.timeline.total_distance_km + route.penalty,
            }
        })
        .collect();

    let total_distance_km: f64 = proposed.iter().map(|r| r.total_distance_km).sum();
    let total_duration_secs: i64 = proposed
        .iter()
        .map(|r| i64::from(r.total_duration_secs))
        .sum();
    let savings_percentage = if baseline_km > 0.0 {
        ((baseline_km - total_distance_km) / baseline_km * 100.0).max(0.0)
    } else {
        0.0
    };

    OptimizationResult {
        result_id: ResultId::new(format!("{}-result", request.request_id)),
        request_id: request.request_id.clone(),
        service_date: request.service_date,
        departure_time: request.departure_time,
        warehouse: request.warehouse,
        constraints: request.constraints.clone(),
        routes: proposed,
        unassigned: blocked,
        metrics: ResultMetrics {
            routes_created: routes.len(),
            total_distance_km,
            total_duration_secs,
            on_time_probability,
            cost_estimate: total_distance_km * options.cost_per_km,
            savings_percentage,
            optimization_score: score.score,
        },
    }
}
