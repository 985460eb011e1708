//! Route lifecycle management: materialization, execution, reassignment.
//!
//! The [`Engine`] owns all mutable planning state. Mutations are serialized
//! per resource: each route sits behind its own mutex and the driver/vehicle
//! ownership table is a single versioned registry updated atomically, so two
//! operations on the same route or the same resource never interleave.
//! Every operation validates first and commits all-or-nothing; domain events
//! are published only after the transition commits and outside all locks.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constraints::ConstraintRule;
use crate::error::Error;
use crate::estimate::DistanceEstimator;
use crate::events::{DomainEvent, EventSink, NullSink};
use crate::model::{
    Driver, DriverId, DriverStatus, Order, OrderId, ProofOfDelivery, ResultId, Route, RouteId,
    RouteStatus, Stop, StopId, StopStatus, Vehicle, VehicleId, VehicleStatus,
};
use crate::solver::{CancelToken, OptimizationRequest, OptimizationResult, SolveOptions, solve};
use crate::tracking::{TrackingLog, TrackingSnapshot, TrackingUpdate, compute_snapshot};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay beyond which a tracking snapshot raises the delay flag.
    pub delay_threshold_secs: i64,
    /// Prefix of generated route numbers, `<prefix>-<yyyymmdd>-<nnn>`.
    pub route_number_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delay_threshold_secs: 10 * 60,
            route_number_prefix: "RT".to_string(),
        }
    }
}

/// Driver-supplied completion data for one stop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopCompletion {
    pub completed_at: i64,
    pub proof: Option<ProofOfDelivery>,
    pub actual_service_secs: Option<i32>,
}

impl StopCompletion {
    pub fn at(completed_at: i64) -> Self {
        Self {
            completed_at,
            ..Self::default()
        }
    }

    pub fn with_proof(mut self, proof: ProofOfDelivery) -> Self {
        self.proof = Some(proof);
        self
    }
}

/// One recorded lifecycle transition: who/when/why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: i64,
    pub route_id: Option<RouteId>,
    pub action: String,
    pub detail: String,
}

/// A resource with its current binding and optimistic version.
#[derive(Debug, Clone)]
pub struct ResourceView<T> {
    pub resource: T,
    pub active_route: Option<RouteId>,
    /// Bumped on every claim/release.
    pub version: u64,
}

#[derive(Debug)]
struct ResourceEntry<T> {
    resource: T,
    active_route: Option<RouteId>,
    version: u64,
}

impl<T: Clone> ResourceEntry<T> {
    fn new(resource: T) -> Self {
        Self {
            resource,
            active_route: None,
            version: 0,
        }
    }

    fn view(&self) -> ResourceView<T> {
        ResourceView {
            resource: self.resource.clone(),
            active_route: self.active_route.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Default)]
struct ResourceTable {
    drivers: HashMap<DriverId, ResourceEntry<Driver>>,
    vehicles: HashMap<VehicleId, ResourceEntry<Vehicle>>,
}

impl ResourceTable {
    /// Releases a (driver, vehicle) binding back to available.
    fn release(&mut self, driver_id: &DriverId, vehicle_id: &VehicleId) {
        if let Some(entry) = self.drivers.get_mut(driver_id) {
            entry.active_route = None;
            entry.resource.status = DriverStatus::Available;
            entry.version += 1;
        }
        if let Some(entry) = self.vehicles.get_mut(vehicle_id) {
            entry.active_route = None;
            entry.resource.status = VehicleStatus::Available;
            entry.version += 1;
        }
    }

    /// Claims a (driver, vehicle) binding for a route.
    fn claim(&mut self, driver_id: &DriverId, vehicle_id: &VehicleId, route_id: &RouteId) {
        if let Some(entry) = self.drivers.get_mut(driver_id) {
            entry.active_route = Some(route_id.clone());
            entry.resource.status = DriverStatus::OnRoute;
            entry.version += 1;
        }
        if let Some(entry) = self.vehicles.get_mut(vehicle_id) {
            entry.active_route = Some(route_id.clone());
            entry.resource.status = VehicleStatus::InUse;
            entry.version += 1;
        }
    }
}

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The route optimization engine: optimizer front-end, lifecycle state
/// machine, resource ownership and tracking ingestion.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) estimator: Arc<dyn DistanceEstimator + Send + Sync>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) orders: Mutex<HashMap<OrderId, Order>>,
    pub(crate) resources: Mutex<ResourceTable>,
    pub(crate) routes: RwLock<HashMap<RouteId, Arc<Mutex<Route>>>>,
    pub(crate) applied: Mutex<HashSet<ResultId>>,
    pub(crate) audit: Mutex<Vec<AuditEntry>>,
    pub(crate) route_seq: AtomicU64,
    pub(crate) tracking: TrackingLog,
}

impl Engine {
    pub fn new(estimator: Arc<dyn DistanceEstimator + Send + Sync>, config: EngineConfig) -> Self {
        Self {
            config,
            estimator,
            sink: Arc::new(NullSink),
            orders: Mutex::new(HashMap::new()),
            resources: Mutex::new(ResourceTable::default()),
            routes: RwLock::new(HashMap::new()),
            applied: Mutex::new(HashSet::new()),
            audit: Mutex::new(Vec::new()),
            route_seq: AtomicU64::new(0),
            tracking: TrackingLog::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Adds or updates a driver. Re-registering keeps any active binding
    /// and its lifecycle-managed status.
    pub fn register_driver(&self, driver: Driver) {
        let mut table = locked(&self.resources);
        match table.drivers.entry(driver.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let status = entry.resource.status;
                entry.resource = driver;
                if entry.active_route.is_some() {
                    entry.resource.status = status;
                }
                entry.version += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ResourceEntry::new(driver));
            }
        }
    }

    /// Adds or updates a vehicle. Re-registering keeps any active binding
    /// and its lifecycle-managed status.
    pub fn register_vehicle(&self, vehicle: Vehicle) {
        let mut table = locked(&self.resources);
        match table.vehicles.entry(vehicle.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let status = entry.resource.status;
                entry.resource = vehicle;
                if entry.active_route.is_some() {
                    entry.resource.status = status;
                }
                entry.version += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ResourceEntry::new(vehicle));
            }
        }
    }

    pub fn register_orders(&self, orders: impl IntoIterator<Item = Order>) {
        let mut table = locked(&self.orders);
        for order in orders {
            table.insert(order.id.clone(), order);
        }
    }

    pub fn driver(&self, id: &DriverId) -> Option<ResourceView<Driver>> {
        locked(&self.resources).drivers.get(id).map(|e| e.view())
    }

    pub fn vehicle(&self, id: &VehicleId) -> Option<ResourceView<Vehicle>> {
        locked(&self.resources).vehicles.get(id).map(|e| e.view())
    }

    pub fn order(&self, id: &OrderId) -> Option<Order> {
        locked(&self.orders).get(id).cloned()
    }

    /// Marks a driver unavailable/available outside of route execution.
    /// Fails with [`Error::ResourceConflict`] while the driver is bound.
    pub fn set_driver_status(&self, id: &DriverId, status: DriverStatus) -> Result<(), Error> {
        let mut table = locked(&self.resources);
        let entry = table.drivers.get_mut(id).ok_or_else(|| Error::NotFound {
            entity: "driver",
            id: id.to_string(),
        })?;
        if let Some(route) = &entry.active_route {
            return Err(Error::ResourceConflict {
                resource: "driver",
                id: id.to_string(),
                route: route.clone(),
            });
        }
        entry.resource.status = status;
        entry.version += 1;
        Ok(())
    }

    /// Marks a vehicle unavailable/available outside of route execution.
    /// Fails with [`Error::ResourceConflict`] while the vehicle is bound.
    pub fn set_vehicle_status(&self, id: &VehicleId, status: VehicleStatus) -> Result<(), Error> {
        let mut table = locked(&self.resources);
        let entry = table.vehicles.get_mut(id).ok_or_else(|| Error::NotFound {
            entity: "vehicle",
            id: id.to_string(),
        })?;
        if let Some(route) = &entry.active_route {
            return Err(Error::ResourceConflict {
                resource: "vehicle",
                id: id.to_string(),
                route: route.clone(),
            });
        }
        entry.resource.status = status;
        entry.version += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Optimization front-end
    // ------------------------------------------------------------------

    /// Runs the optimizer against a request snapshot. Read-only: no routes
    /// are created until the result is applied.
    pub fn optimize(
        &self,
        request: &OptimizationRequest,
        options: &SolveOptions,
        cancel: &CancelToken,
    ) -> Result<OptimizationResult, Error> {
        solve(request, self.estimator.as_ref(), options, cancel)
    }

    /// Runs the optimizer on a worker thread, off the request-handling
    /// path. The returned token cancels the computation; a cancelled solve
    /// yields [`Error::Cancelled`] and creates nothing.
    pub fn optimize_background(
        &self,
        request: OptimizationRequest,
        options: SolveOptions,
    ) -> (CancelToken, JoinHandle<Result<OptimizationResult, Error>>) {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let estimator = Arc::clone(&self.estimator);
        let handle = std::thread::spawn(move || {
            solve(&request, estimator.as_ref(), &options, &cancel)
        });
        (token, handle)
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Materializes a result: creates routes in `planned` and binds every
    /// referenced driver/vehicle. Atomic: on any conflict nothing is
    /// created or claimed. Re-applying a result is rejected.
    pub fn apply_result(&self, result: &OptimizationResult, at: i64) -> Result<Vec<RouteId>, Error> {
        if locked(&self.applied).contains(&result.result_id) {
            return Err(Error::ResultAlreadyApplied(result.result_id.clone()));
        }

        // Resolve every referenced order up front.
        let order_table = locked(&self.orders);
        let mut resolved: Vec<Vec<Order>> = Vec::with_capacity(result.routes.len());
        for proposed in &result.routes {
            let mut orders = Vec::with_capacity(proposed.stops.len());
            for stop in &proposed.stops {
                let order = order_table
                    .get(&stop.order_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound {
                        entity: "order",
                        id: stop.order_id.to_string(),
                    })?;
                orders.push(order);
            }
            resolved.push(orders);
        }
        drop(order_table);

        let date = format_date_yyyymmdd(result.service_date);
        let route_ids: Vec<RouteId> = result
            .routes
            .iter()
            .map(|_| {
                let n = self.route_seq.fetch_add(1, Ordering::Relaxed) + 1;
                RouteId::new(format!("{}-{}-{:03}", self.config.route_number_prefix, date, n))
            })
            .collect();

        {
            let mut table = locked(&self.resources);

            let mut seen_drivers = HashSet::new();
            let mut seen_vehicles = HashSet::new();
            for proposed in &result.routes {
                let driver = table
                    .drivers
                    .get(&proposed.driver_id)
                    .ok_or_else(|| Error::NotFound {
                        entity: "driver",
                        id: proposed.driver_id.to_string(),
                    })?;
                if let Some(route) = &driver.active_route {
                    return Err(Error::ResourceConflict {
                        resource: "driver",
                        id: proposed.driver_id.to_string(),
                        route: route.clone(),
                    });
                }
                if driver.resource.status != DriverStatus::Available
                    || !seen_drivers.insert(proposed.driver_id.clone())
                {
                    return Err(Error::ResourceUnavailable {
                        resource: "driver",
                        id: proposed.driver_id.to_string(),
                    });
                }

                let vehicle = table
                    .vehicles
                    .get(&proposed.vehicle_id)
                    .ok_or_else(|| Error::NotFound {
                        entity: "vehicle",
                        id: proposed.vehicle_id.to_string(),
                    })?;
                if let Some(route) = &vehicle.active_route {
                    return Err(Error::ResourceConflict {
                        resource: "vehicle",
                        id: proposed.vehicle_id.to_string(),
                        route: route.clone(),
                    });
                }
                if vehicle.resource.status != VehicleStatus::Available
                    || !seen_vehicles.insert(proposed.vehicle_id.clone())
                {
                    return Err(Error::ResourceUnavailable {
                        resource: "vehicle",
                        id: proposed.vehicle_id.to_string(),
                    });
                }
            }

            // All validated; claim everything.
            for (proposed, route_id) in result.routes.iter().zip(&route_ids) {
                table.claim(&proposed.driver_id, &proposed.vehicle_id, route_id);
            }
        }

        let mut created = Vec::with_capacity(result.routes.len());
        for ((proposed, route_id), orders) in
            result.routes.iter().zip(&route_ids).zip(&resolved)
        {
            let stops: Vec<Stop> = proposed
                .stops
                .iter()
                .zip(orders)
                .map(|(stop, order)| Stop {
                    id: StopId::new(format!("{}-S{:02}", route_id, stop.sequence)),
                    route_id: route_id.clone(),
                    order_id: stop.order_id.clone(),
                    sequence: stop.sequence,
                    status: StopStatus::Pending,
                    location: order.location,
                    address: order.address.clone(),
                    planned_arrival: stop.planned_arrival,
                    planned_service_secs: stop.planned_service_secs,
                    actual_arrival: None,
                    actual_service_secs: None,
                    signature_required: order.signature_required,
                    photo_required: order.photo_required,
                    proof: None,
                    skip_reason: None,
                })
                .collect();

            created.push(Route {
                id: route_id.clone(),
                route_number: route_id.to_string(),
                service_date: result.service_date,
                driver_id: proposed.driver_id.clone(),
                vehicle_id: proposed.vehicle_id.clone(),
                status: RouteStatus::Planned,
                start_location: result.warehouse,
                stops,
                total_distance_km: proposed.total_distance_km,
                total_duration_secs: proposed.total_duration_secs,
                completed_stops: 0,
                optimization_score: proposed.score,
                constraints: result.constraints.clone(),
                reassignments: Vec::new(),
            });
        }

        {
            let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
            for route in created {
                routes.insert(route.id.clone(), Arc::new(Mutex::new(route)));
            }
        }
        locked(&self.applied).insert(result.result_id.clone());

        for route_id in &route_ids {
            self.record_audit(at, Some(route_id.clone()), "apply", format!(
                "created from result {}",
                result.result_id
            ));
        }
        info!(result = %result.result_id, routes = route_ids.len(), "optimization result applied");
        self.sink.publish(&DomainEvent::RoutesApplied {
            result_id: result.result_id.clone(),
            route_ids: route_ids.clone(),
            at,
        });

        Ok(route_ids)
    }

    /// `planned -> in_progress`.
    pub fn start_route(&self, route_id: &RouteId, at: i64) -> Result<Route, Error> {
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if route.status != RouteStatus::Planned {
            return Err(invalid_route_transition(&route, "in_progress"));
        }
        route.status = RouteStatus::InProgress;
        let snapshot = route.clone();
        drop(route);

        self.record_audit(at, Some(route_id.clone()), "start", String::new());
        info!(route = %route_id, "route started");
        self.sink.publish(&DomainEvent::RouteStarted {
            route_id: route_id.clone(),
            at,
        });
        Ok(snapshot)
    }

    /// Marks arrival at the current stop.
    pub fn arrive_stop(&self, route_id: &RouteId, stop_id: &StopId, at: i64) -> Result<Route, Error> {
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if route.status != RouteStatus::InProgress {
            return Err(invalid_route_transition(&route, "in_progress"));
        }
        let current = route.current_stop().map(|s| s.id.clone());
        let stop = find_stop_mut(&mut route, stop_id)?;
        if stop.status != StopStatus::Pending {
            return Err(Error::InvalidTransition {
                entity: "stop",
                id: stop_id.to_string(),
                from: stop.status.to_string(),
                to: "arrived".to_string(),
            });
        }
        if current.as_ref() != Some(stop_id) {
            return Err(Error::OutOfOrderCompletion {
                stop: stop_id.clone(),
                expected: current.unwrap_or_else(|| stop_id.clone()),
            });
        }
        stop.status = StopStatus::Arrived;
        stop.actual_arrival = Some(at);
        let snapshot = route.clone();
        drop(route);

        self.record_audit(at, Some(route_id.clone()), "arrive", stop_id.to_string());
        self.sink.publish(&DomainEvent::StopArrived {
            route_id: route_id.clone(),
            stop_id: stop_id.clone(),
            at,
        });
        Ok(snapshot)
    }

    /// Completes the current stop with proof, advancing the route; the last
    /// terminal stop completes the route and releases its resources.
    pub fn complete_stop(
        &self,
        route_id: &RouteId,
        stop_id: &StopId,
        completion: StopCompletion,
    ) -> Result<Route, Error> {
        let at = completion.completed_at;
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if route.status != RouteStatus::InProgress {
            return Err(invalid_route_transition(&route, "in_progress"));
        }

        let current = route
            .current_stop()
            .map(|s| s.id.clone())
            .ok_or_else(|| Error::NotFound {
                entity: "stop",
                id: stop_id.to_string(),
            })?;

        let stop = find_stop_mut(&mut route, stop_id)?;
        if stop.status.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: "stop",
                id: stop_id.to_string(),
                from: stop.status.to_string(),
                to: "completed".to_string(),
            });
        }
        if &current != stop_id {
            return Err(Error::OutOfOrderCompletion {
                stop: stop_id.clone(),
                expected: current,
            });
        }

        let proof = completion.proof.as_ref();
        if stop.signature_required && proof.and_then(|p| p.signature_ref.as_ref()).is_none() {
            return Err(Error::ProofRequired {
                stop: stop_id.clone(),
                kind: "signature",
            });
        }
        if stop.photo_required && proof.and_then(|p| p.photo_ref.as_ref()).is_none() {
            return Err(Error::ProofRequired {
                stop: stop_id.clone(),
                kind: "photo",
            });
        }

        stop.status = StopStatus::Completed;
        stop.actual_arrival = stop.actual_arrival.or(Some(at));
        stop.actual_service_secs = completion.actual_service_secs;
        stop.proof = completion.proof;
        route.completed_stops += 1;

        let finished = route.all_stops_terminal();
        if finished {
            route.status = RouteStatus::Completed;
        }
        let driver_id = route.driver_id.clone();
        let vehicle_id = route.vehicle_id.clone();
        let snapshot = route.clone();
        drop(route);

        if finished {
            locked(&self.resources).release(&driver_id, &vehicle_id);
        }

        self.record_audit(at, Some(route_id.clone()), "complete_stop", stop_id.to_string());
        self.sink.publish(&DomainEvent::StopCompleted {
            route_id: route_id.clone(),
            stop_id: stop_id.clone(),
            at,
        });
        if finished {
            self.record_audit(at, Some(route_id.clone()), "complete", String::new());
            info!(route = %route_id, "route completed");
            self.sink.publish(&DomainEvent::RouteCompleted {
                route_id: route_id.clone(),
                at,
            });
        }
        Ok(snapshot)
    }

    /// Marks a stop skipped (no proof needed); skipped stops do not block
    /// route completion.
    pub fn skip_stop(
        &self,
        route_id: &RouteId,
        stop_id: &StopId,
        reason: impl Into<String>,
        at: i64,
    ) -> Result<Route, Error> {
        let reason = reason.into();
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if route.status != RouteStatus::InProgress {
            return Err(invalid_route_transition(&route, "in_progress"));
        }
        let stop = find_stop_mut(&mut route, stop_id)?;
        if stop.status.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: "stop",
                id: stop_id.to_string(),
                from: stop.status.to_string(),
                to: "skipped".to_string(),
            });
        }
        stop.status = StopStatus::Skipped;
        stop.skip_reason = Some(reason.clone());

        let finished = route.all_stops_terminal();
        if finished {
            route.status = RouteStatus::Completed;
        }
        let driver_id = route.driver_id.clone();
        let vehicle_id = route.vehicle_id.clone();
        let snapshot = route.clone();
        drop(route);

        if finished {
            locked(&self.resources).release(&driver_id, &vehicle_id);
        }

        self.record_audit(
            at,
            Some(route_id.clone()),
            "skip_stop",
            format!("{stop_id}: {reason}"),
        );
        self.sink.publish(&DomainEvent::StopSkipped {
            route_id: route_id.clone(),
            stop_id: stop_id.clone(),
            reason,
            at,
        });
        if finished {
            self.record_audit(at, Some(route_id.clone()), "complete", String::new());
            self.sink.publish(&DomainEvent::RouteCompleted {
                route_id: route_id.clone(),
                at,
            });
        }
        Ok(snapshot)
    }

    /// Cancels an active route, releasing its driver and vehicle. Stop
    /// progress is preserved as history.
    pub fn cancel_route(
        &self,
        route_id: &RouteId,
        reason: impl Into<String>,
        at: i64,
    ) -> Result<Route, Error> {
        let reason = reason.into();
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if !route.status.is_active() {
            return Err(invalid_route_transition(&route, "cancelled"));
        }
        route.status = RouteStatus::Cancelled;
        let driver_id = route.driver_id.clone();
        let vehicle_id = route.vehicle_id.clone();
        let snapshot = route.clone();
        drop(route);

        locked(&self.resources).release(&driver_id, &vehicle_id);

        self.record_audit(at, Some(route_id.clone()), "cancel", reason.clone());
        info!(route = %route_id, reason = %reason, "route cancelled");
        self.sink.publish(&DomainEvent::RouteCancelled {
            route_id: route_id.clone(),
            reason,
            at,
        });
        Ok(snapshot)
    }

    /// Rebinds a route to a new (driver, vehicle) pair without resetting
    /// stop progress. The replacement must be available and eligible for
    /// the remaining stops; the old binding is recorded as history.
    pub fn reassign_route(
        &self,
        route_id: &RouteId,
        new_driver: &DriverId,
        new_vehicle: &VehicleId,
        reason: impl Into<String>,
        at: i64,
    ) -> Result<Route, Error> {
        let reason = reason.into();
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if !route.status.is_active() {
            return Err(invalid_route_transition(&route, "reassigned"));
        }

        let remaining_orders: Vec<Order> = {
            let order_table = locked(&self.orders);
            route
                .remaining_stops()
                .iter()
                .filter_map(|s| order_table.get(&s.order_id).cloned())
                .collect()
        };

        let old_driver = route.driver_id.clone();
        let old_vehicle = route.vehicle_id.clone();

        {
            let mut table = locked(&self.resources);

            let driver_entry =
                table
                    .drivers
                    .get(new_driver)
                    .ok_or_else(|| Error::NotFound {
                        entity: "driver",
                        id: new_driver.to_string(),
                    })?;
            if new_driver != &old_driver {
                let bound_elsewhere = driver_entry
                    .active_route
                    .as_ref()
                    .is_some_and(|r| r != route_id);
                if bound_elsewhere || driver_entry.resource.status != DriverStatus::Available {
                    return Err(Error::ResourceUnavailable {
                        resource: "driver",
                        id: new_driver.to_string(),
                    });
                }
            }
            let new_driver_record = driver_entry.resource.clone();

            let vehicle_entry =
                table
                    .vehicles
                    .get(new_vehicle)
                    .ok_or_else(|| Error::NotFound {
                        entity: "vehicle",
                        id: new_vehicle.to_string(),
                    })?;
            if new_vehicle != &old_vehicle {
                let bound_elsewhere = vehicle_entry
                    .active_route
                    .as_ref()
                    .is_some_and(|r| r != route_id);
                if bound_elsewhere || vehicle_entry.resource.status != VehicleStatus::Available {
                    return Err(Error::ResourceUnavailable {
                        resource: "vehicle",
                        id: new_vehicle.to_string(),
                    });
                }
            }
            let new_vehicle_record = vehicle_entry.resource.clone();

            // Eligibility against the remaining stops.
            if !new_driver_record.can_drive(new_vehicle_record.vehicle_type) {
                return Err(Error::ConstraintViolated {
                    rule: ConstraintRule::VehicleTypeRequired,
                    detail: format!(
                        "driver {} is not licensed for {}",
                        new_driver, new_vehicle_record.vehicle_type
                    ),
                });
            }
            for order in &remaining_orders {
                if let Some(required) = order.required_vehicle_type {
                    if required != new_vehicle_record.vehicle_type {
                        return Err(Error::ConstraintViolated {
                            rule: ConstraintRule::VehicleTypeRequired,
                            detail: format!(
                                "order {} requires {}, vehicle {} is {}",
                                order.id, required, new_vehicle, new_vehicle_record.vehicle_type
                            ),
                        });
                    }
                }
            }
            let weight: f64 = remaining_orders.iter().map(|o| o.weight_kg).sum();
            if weight > new_vehicle_record.capacity_weight_kg {
                return Err(Error::ConstraintViolated {
                    rule: ConstraintRule::CapacityWeight,
                    detail: format!(
                        "remaining load {:.1}kg exceeds vehicle {} capacity {:.1}kg",
                        weight, new_vehicle, new_vehicle_record.capacity_weight_kg
                    ),
                });
            }
            let volume: f64 = remaining_orders.iter().map(|o| o.volume_m3).sum();
            if volume > new_vehicle_record.capacity_volume_m3 {
                return Err(Error::ConstraintViolated {
                    rule: ConstraintRule::CapacityVolume,
                    detail: format!(
                        "remaining load {:.2}m3 exceeds vehicle {} capacity {:.2}m3",
                        volume, new_vehicle, new_vehicle_record.capacity_volume_m3
                    ),
                });
            }

            // Commit the rebinding atomically.
            table.release(&old_driver, &old_vehicle);
            table.claim(new_driver, new_vehicle, route_id);
        }

        let seq = route.reassignments.len() as u32 + 1;
        route.reassignments.push(crate::model::ReassignmentRecord {
            seq,
            from_driver: old_driver,
            from_vehicle: old_vehicle,
            to_driver: new_driver.clone(),
            to_vehicle: new_vehicle.clone(),
            reason: reason.clone(),
            at,
        });
        route.driver_id = new_driver.clone();
        route.vehicle_id = new_vehicle.clone();
        let snapshot = route.clone();
        drop(route);

        self.record_audit(
            at,
            Some(route_id.clone()),
            "reassign",
            format!("to {new_driver}/{new_vehicle}: {reason}"),
        );
        info!(route = %route_id, driver = %new_driver, vehicle = %new_vehicle, "route reassigned");
        self.sink.publish(&DomainEvent::RouteReassigned {
            route_id: route_id.clone(),
            driver_id: new_driver.clone(),
            vehicle_id: new_vehicle.clone(),
            at,
        });
        Ok(snapshot)
    }

    /// Merges planned routes into the primary driver's route. The merged
    /// candidate must satisfy the primary route's constraints; otherwise
    /// nothing changes. Absorbed routes are deleted and their resources
    /// released.
    pub fn merge_routes(
        &self,
        route_ids: &[RouteId],
        primary_driver: &DriverId,
        at: i64,
    ) -> Result<Route, Error> {
        if route_ids.len() < 2 {
            return Err(Error::ConstraintViolated {
                rule: ConstraintRule::MaxStops,
                detail: "merge requires at least two routes".to_string(),
            });
        }
        let unique: HashSet<&RouteId> = route_ids.iter().collect();
        if unique.len() != route_ids.len() {
            return Err(Error::ConstraintViolated {
                rule: ConstraintRule::MaxStops,
                detail: "merge route list contains duplicates".to_string(),
            });
        }

        let mut map = self.routes.write().unwrap_or_else(|e| e.into_inner());

        let mut arcs = Vec::with_capacity(route_ids.len());
        for id in route_ids {
            let arc = map.get(id).cloned().ok_or_else(|| Error::NotFound {
                entity: "route",
                id: id.to_string(),
            })?;
            arcs.push((id.clone(), arc));
        }

        let mut guards: Vec<(RouteId, MutexGuard<'_, Route>)> = Vec::with_capacity(arcs.len());
        for (id, arc) in &arcs {
            let guard = locked(arc);
            if guard.status != RouteStatus::Planned {
                return Err(invalid_route_transition(&guard, "merged"));
            }
            guards.push((id.clone(), guard));
        }

        let primary_pos = guards
            .iter()
            .position(|(_, g)| &g.driver_id == primary_driver)
            .ok_or_else(|| Error::NotFound {
                entity: "route for primary driver",
                id: primary_driver.to_string(),
            })?;

        // Combined stop list: primary first, then the others in call order.
        let mut combined: Vec<Stop> = Vec::new();
        let mut ordered: Vec<usize> = vec![primary_pos];
        ordered.extend((0..guards.len()).filter(|&i| i != primary_pos));
        for &i in &ordered {
            let mut stops = guards[i].1.stops.clone();
            stops.sort_by_key(|s| s.sequence);
            combined.extend(stops);
        }

        // Validate the merged candidate against the primary's constraints.
        let (primary_id, primary_guard) = &guards[primary_pos];
        let (driver_record, vehicle_record) = {
            let table = locked(&self.resources);
            let driver = table
                .drivers
                .get(&primary_guard.driver_id)
                .map(|e| e.resource.clone())
                .ok_or_else(|| Error::NotFound {
                    entity: "driver",
                    id: primary_guard.driver_id.to_string(),
                })?;
            let vehicle = table
                .vehicles
                .get(&primary_guard.vehicle_id)
                .map(|e| e.resource.clone())
                .ok_or_else(|| Error::NotFound {
                    entity: "vehicle",
                    id: primary_guard.vehicle_id.to_string(),
                })?;
            (driver, vehicle)
        };
        let orders: Vec<Order> = {
            let order_table = locked(&self.orders);
            combined
                .iter()
                .map(|s| {
                    order_table
                        .get(&s.order_id)
                        .cloned()
                        .ok_or_else(|| Error::NotFound {
                            entity: "order",
                            id: s.order_id.to_string(),
                        })
                })
                .collect::<Result<_, _>>()?
        };

        let mut locations = vec![primary_guard.start_location];
        locations.extend(orders.iter().map(|o| o.location));
        let matrix = self
            .estimator
            .matrix(&crate::estimate::dedupe_locations(locations))?;
        let order_refs: Vec<&Order> = orders.iter().collect();
        let departure = primary_guard
            .stops
            .iter()
            .map(|s| s.planned_arrival)
            .min()
            .unwrap_or(at);
        let timeline = crate::constraints::plan_timeline(
            &primary_guard.start_location,
            departure,
            &order_refs,
            &matrix,
        )?;
        let candidate = crate::constraints::RouteCandidate {
            driver: &driver_record,
            vehicle: &vehicle_record,
            orders: order_refs,
        };
        let validation =
            crate::constraints::validate(&candidate, &timeline, &primary_guard.constraints);
        if let Some(violation) = validation.first_hard() {
            return Err(Error::ConstraintViolated {
                rule: violation.rule,
                detail: violation.detail.clone(),
            });
        }

        // Commit: rewrite the primary, drop the absorbed.
        let primary_id = primary_id.clone();
        let absorbed: Vec<(RouteId, DriverId, VehicleId)> = ordered
            .iter()
            .skip(1)
            .map(|&i| {
                let guard = &guards[i].1;
                (guards[i].0.clone(), guard.driver_id.clone(), guard.vehicle_id.clone())
            })
            .collect();

        {
            let primary = &mut guards[primary_pos].1;
            primary.stops = combined
                .into_iter()
                .enumerate()
                .map(|(i, mut stop)| {
                    stop.sequence = (i + 1) as u32;
                    stop.route_id = primary_id.clone();
                    stop.planned_arrival = timeline.arrivals[i];
                    stop
                })
                .collect();
            primary.total_distance_km = timeline.total_distance_km;
            primary.total_duration_secs = timeline.total_duration_secs;
            let snapshot = primary.clone();
            drop(guards);

            {
                let mut table = locked(&self.resources);
                for (_, driver_id, vehicle_id) in &absorbed {
                    table.release(driver_id, vehicle_id);
                }
            }
            for (id, _, _) in &absorbed {
                map.remove(id);
            }
            drop(map);

            let absorbed_ids: Vec<RouteId> = absorbed.into_iter().map(|(id, _, _)| id).collect();
            self.record_audit(
                at,
                Some(primary_id.clone()),
                "merge",
                format!("absorbed {:?}", absorbed_ids.iter().map(|r| r.as_str()).collect::<Vec<_>>()),
            );
            info!(route = %primary_id, absorbed = absorbed_ids.len(), "routes merged");
            self.sink.publish(&DomainEvent::RoutesMerged {
                primary: primary_id,
                absorbed: absorbed_ids,
                at,
            });
            Ok(snapshot)
        }
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Appends a tracking event and returns the derived snapshot.
    pub fn record_tracking(
        &self,
        route_id: &RouteId,
        update: TrackingUpdate,
    ) -> Result<TrackingSnapshot, Error> {
        let arc = self.route_arc(route_id)?;
        let route = locked(&arc);
        if route.status != RouteStatus::InProgress {
            return Err(invalid_route_transition(&route, "in_progress"));
        }
        let snapshot_route = route.clone();
        drop(route);

        let current = snapshot_route
            .stops
            .iter()
            .find(|s| s.status == StopStatus::Arrived)
            .map(|s| s.id.clone());
        let next = snapshot_route.current_stop().map(|s| s.id.clone());

        let event = self
            .tracking
            .append(route_id.clone(), update, current, next);
        let snapshot = compute_snapshot(
            &event,
            &snapshot_route,
            self.estimator.as_ref(),
            self.config.delay_threshold_secs,
        )?;
        Ok(snapshot)
    }

    /// Recomputes the snapshot from the latest tracking event, if any.
    pub fn snapshot(&self, route_id: &RouteId) -> Result<Option<TrackingSnapshot>, Error> {
        let Some(event) = self.tracking.latest(route_id) else {
            return Ok(None);
        };
        let route = self.route(route_id)?;
        let snapshot = compute_snapshot(
            &event,
            &route,
            self.estimator.as_ref(),
            self.config.delay_threshold_secs,
        )?;
        Ok(Some(snapshot))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn route(&self, route_id: &RouteId) -> Result<Route, Error> {
        let arc = self.route_arc(route_id)?;
        let route = locked(&arc);
        Ok(route.clone())
    }

    pub fn routes(&self) -> Vec<Route> {
        let map = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Route> = map.values().map(|arc| locked(arc).clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        locked(&self.audit).clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn route_arc(&self, route_id: &RouteId) -> Result<Arc<Mutex<Route>>, Error> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(route_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity: "route",
                id: route_id.to_string(),
            })
    }

    pub(crate) fn record_audit(
        &self,
        at: i64,
        route_id: Option<RouteId>,
        action: &str,
        detail: String,
    ) {
        let mut audit = locked(&self.audit);
        let seq = audit.len() as u64 + 1;
        audit.push(AuditEntry {
            seq,
            at,
            route_id,
            action: action.to_string(),
            detail,
        });
    }
}

fn invalid_route_transition(route: &Route, to: &str) -> Error {
    Error::InvalidTransition {
        entity: "route",
        id: route.id.to_string(),
        from: route.status.to_string(),
        to: to.to_string(),
    }
}

fn find_stop_mut<'a>(route: &'a mut Route, stop_id: &StopId) -> Result<&'a mut Stop, Error> {
    route
        .stops
        .iter_mut()
        .find(|s| &s.id == stop_id)
        .ok_or_else(|| Error::NotFound {
            entity: "stop",
            id: stop_id.to_string(),
        })
}

/// `yyyymmdd` of a unix timestamp (days-from-epoch civil conversion).
fn format_date_yyyymmdd(unix_secs: i64) -> String {
    let days = unix_secs.div_euclid(86_400);
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!("{year:04}{month:02}{day:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_dates() {
        assert_eq!(format_date_yyyymmdd(0), "19700101");
        // 2025-08-20T00:00:00Z
        assert_eq!(format_date_yyyymmdd(1_755_648_000), "20250820");
        // End of the same day.
        assert_eq!(format_date_yyyymmdd(1_755_648_000 + 86_399), "20250820");
    }

    #[test]
    fn resource_table_claim_release_bumps_versions() {
        let mut table = ResourceTable::default();
        table.drivers.insert(
            DriverId::from("D1"),
            ResourceEntry::new(Driver::new("D1", "Chang")),
        );
        table.vehicles.insert(
            VehicleId::from("V1"),
            ResourceEntry::new(Vehicle::new(
                "V1",
                crate::model::VehicleType::Van,
                800.0,
                8.0,
            )),
        );

        let route = RouteId::from("R1");
        table.claim(&DriverId::from("D1"), &VehicleId::from("V1"), &route);
        let driver = &table.drivers[&DriverId::from("D1")];
        assert_eq!(driver.active_route, Some(route.clone()));
        assert_eq!(driver.resource.status, DriverStatus::OnRoute);
        assert_eq!(driver.version, 1);

        table.release(&DriverId::from("D1"), &VehicleId::from("V1"));
        let driver = &table.drivers[&DriverId::from("D1")];
        assert_eq!(driver.active_route, None);
        assert_eq!(driver.resource.status, DriverStatus::Available);
        assert_eq!(driver.version, 2);
    }
}
