//! Re-optimization and issue handling for in-flight routes.
//!
//! Re-planning only ever touches the unvisited suffix of a route: completed
//! and skipped stops are immutable history, every pending stop keeps its
//! identity and proof requirements, and nothing is dropped without an
//! explicit skip.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;
use crate::estimate::{TravelMatrix, dedupe_locations};
use crate::events::DomainEvent;
use crate::lifecycle::{Engine, locked};
use crate::model::{Location, Route, RouteId, RouteStatus, Stop, StopId, StopStatus, TimeWindow};
use crate::tracking::TrackingSnapshot;

/// Penalty per position-step for a stop inside an avoided zone; pushes such
/// stops toward the end of the suffix.
const AVOID_ZONE_PENALTY_PER_STEP: f64 = 5.0;

/// Lateness cost inside the flexibility span, per minute.
const LATENESS_PENALTY_PER_MIN: f64 = 1.0;

/// Maximum 2-opt sweeps over a suffix.
const MAX_SUFFIX_PASSES: usize = 100;

/// Reported delivery issue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    CustomerUnavailable,
    WrongAddress,
    TrafficDelay,
    VehicleBreakdown,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueKind::CustomerUnavailable => "customer_unavailable",
            IssueKind::WrongAddress => "wrong_address",
            IssueKind::TrafficDelay => "traffic_delay",
            IssueKind::VehicleBreakdown => "vehicle_breakdown",
        };
        f.write_str(name)
    }
}

/// What to do about a reported issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    /// Skip the stop now and re-plan the rest of the route.
    SkipReturnLater,
    /// Skip the stop; the order goes back to the pool for a future plan.
    Reschedule,
    /// Record the issue only.
    ContinueAnyway,
}

/// Extra constraints for a suffix re-plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReoptimizeOptions {
    /// Zones to steer away from; stops in these zones are pushed toward the
    /// end of the suffix.
    pub avoid_zones: Vec<String>,
}

/// Per-stop data the suffix search needs.
struct SuffixStop {
    location: Location,
    service_secs: i32,
    window: Option<TimeWindow>,
    avoided: bool,
}

impl Engine {
    /// Re-plans a route's unvisited suffix.
    ///
    /// `planned` routes re-order their whole stop list; `in_progress`
    /// routes re-order only stops that are not completed or skipped, from
    /// the vehicle's current position (latest tracking fix, else the last
    /// completed stop, else the warehouse). An `arrived` stop stays first.
    pub fn reoptimize_route(
        &self,
        route_id: &RouteId,
        options: &ReoptimizeOptions,
        at: i64,
    ) -> Result<Route, Error> {
        let arc = self.route_arc(route_id)?;
        let mut route = locked(&arc);
        if !route.status.is_active() {
            return Err(Error::InvalidTransition {
                entity: "route",
                id: route_id.to_string(),
                from: route.status.to_string(),
                to: "reoptimized".to_string(),
            });
        }

        let suffix_ids: Vec<StopId> = route.remaining_stops().iter().map(|s| s.id.clone()).collect();
        if suffix_ids.len() < 2 {
            debug!(route = %route_id, "suffix too short to re-plan");
            return Ok(route.clone());
        }

        let pinned_first = route
            .remaining_stops()
            .first()
            .is_some_and(|s| s.status == StopStatus::Arrived);

        let start = match route.status {
            RouteStatus::InProgress => self
                .tracking
                .latest(route_id)
                .map(|e| e.position)
                .or_else(|| route.last_completed_location())
                .unwrap_or(route.start_location),
            _ => route.start_location,
        };
        let departure = match route.status {
            RouteStatus::InProgress => at,
            _ => route
                .stops
                .iter()
                .map(|s| s.planned_arrival)
                .min()
                .unwrap_or(at),
        };

        let suffix_meta: Vec<SuffixStop> = {
            let order_table = locked(&self.orders);
            suffix_ids
                .iter()
                .map(|id| {
                    let stop = route.stop(id).ok_or_else(|| Error::NotFound {
                        entity: "stop",
                        id: id.to_string(),
                    })?;
                    let order = order_table.get(&stop.order_id);
                    Ok(SuffixStop {
                        location: stop.location,
                        service_secs: stop.planned_service_secs,
                        window: order.and_then(|o| o.time_window),
                        avoided: order
                            .and_then(|o| o.zone.as_ref())
                            .is_some_and(|z| options.avoid_zones.contains(z)),
                    })
                })
                .collect::<Result<_, Error>>()?
        };

        let mut locations = vec![start];
        locations.extend(suffix_meta.iter().map(|s| s.location));
        let matrix = self.estimator.matrix(&dedupe_locations(locations))?;

        let flexibility = route.constraints.time_window_flexibility_secs;
        let order = improve_suffix(
            &start,
            departure,
            &suffix_meta,
            &matrix,
            flexibility,
            pinned_first,
        )?;

        // Rebuild the stop list: history first (original order), then the
        // re-planned suffix with fresh arrivals and dense sequences.
        let arrivals = suffix_arrivals(&start, departure, &suffix_meta, &order, &matrix)?;
        let mut history: Vec<Stop> = route
            .stops
            .iter()
            .filter(|s| s.status.is_terminal())
            .cloned()
            .collect();
        history.sort_by_key(|s| s.sequence);

        let mut rebuilt = history;
        for (slot, &idx) in order.iter().enumerate() {
            let id = &suffix_ids[idx];
            let mut stop = route
                .stop(id)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    entity: "stop",
                    id: id.to_string(),
                })?;
            stop.planned_arrival = arrivals[slot];
            rebuilt.push(stop);
        }
        for (i, stop) in rebuilt.iter_mut().enumerate() {
            stop.sequence = (i + 1) as u32;
        }
        route.stops = rebuilt;

        // Totals now describe the remaining plan from the current position.
        let (distance_km, duration_secs) = path_totals(&route, &matrix, &start)?;
        route.total_distance_km = distance_km;
        route.total_duration_secs = duration_secs;

        let snapshot = route.clone();
        drop(route);

        self.record_audit(
            at,
            Some(route_id.clone()),
            "reoptimize",
            format!("{} stops re-planned", suffix_ids.len()),
        );
        info!(route = %route_id, suffix = suffix_ids.len(), "route suffix re-optimized");
        self.sink.publish(&DomainEvent::RouteReoptimized {
            route_id: route_id.clone(),
            at,
        });
        Ok(snapshot)
    }

    /// Records a delivery issue and applies its action: skipping the stop,
    /// optionally followed by a suffix re-plan.
    pub fn report_issue(
        &self,
        route_id: &RouteId,
        stop_id: &StopId,
        issue: IssueKind,
        action: IssueAction,
        at: i64,
    ) -> Result<Route, Error> {
        let route = match action {
            IssueAction::SkipReturnLater => {
                let after_skip = self.skip_stop(route_id, stop_id, issue.to_string(), at)?;
                if after_skip.status == RouteStatus::InProgress {
                    self.reoptimize_route(route_id, &ReoptimizeOptions::default(), at)?
                } else {
                    after_skip
                }
            }
            IssueAction::Reschedule => {
                self.skip_stop(route_id, stop_id, format!("reschedule: {issue}"), at)?
            }
            IssueAction::ContinueAnyway => self.route(route_id)?,
        };

        self.record_audit(
            at,
            Some(route_id.clone()),
            "issue",
            format!("{stop_id}: {issue} -> {action:?}"),
        );
        self.sink.publish(&DomainEvent::IssueReported {
            route_id: route_id.clone(),
            stop_id: stop_id.clone(),
            issue,
            action,
            at,
        });
        Ok(route)
    }

    /// Checks the latest tracking snapshot; past the delay threshold the
    /// suffix is re-planned and a delay alert is published. Returns the
    /// snapshot when an alert fired.
    pub fn handle_delay(
        &self,
        route_id: &RouteId,
        at: i64,
    ) -> Result<Option<TrackingSnapshot>, Error> {
        let Some(snapshot) = self.snapshot(route_id)? else {
            return Ok(None);
        };
        if !snapshot.delayed {
            return Ok(None);
        }

        info!(route = %route_id, delay_secs = snapshot.delay_secs, "delay threshold breached");
        self.reoptimize_route(route_id, &ReoptimizeOptions::default(), at)?;
        self.record_audit(
            at,
            Some(route_id.clone()),
            "delay_alert",
            format!("{}s behind plan", snapshot.delay_secs),
        );
        self.sink.publish(&DomainEvent::DelayAlert {
            route_id: route_id.clone(),
            delay_secs: snapshot.delay_secs,
            at,
        });
        Ok(Some(snapshot))
    }
}

/// Cost of visiting the suffix in the given order, or `None` when a stop
/// lands beyond its window flexibility.
fn suffix_cost(
    start: &Location,
    departure: i64,
    stops: &[SuffixStop],
    order: &[usize],
    matrix: &TravelMatrix,
    flexibility_secs: i32,
) -> Result<Option<f64>, Error> {
    let mut time = departure;
    let mut prev = *start;
    let mut cost = 0.0;

    for (slot, &idx) in order.iter().enumerate() {
        let stop = &stops[idx];
        let leg = matrix.leg(&prev, &stop.location)?;
        time += i64::from(leg.duration_secs);
        cost += leg.distance_km;

        if let Some(window) = stop.window {
            if time < window.start {
                time = window.start;
            }
            let late = time - window.end;
            if late > i64::from(flexibility_secs) {
                return Ok(None);
            }
            if late > 0 {
                cost += late as f64 / 60.0 * LATENESS_PENALTY_PER_MIN;
            }
        }
        if stop.avoided {
            cost += (order.len() - slot) as f64 * AVOID_ZONE_PENALTY_PER_STEP;
        }

        time += i64::from(stop.service_secs);
        prev = stop.location;
    }

    Ok(Some(cost))
}

/// First-improvement 2-opt over the suffix order. Falls back to the current
/// order when no feasible improvement exists.
fn improve_suffix(
    start: &Location,
    departure: i64,
    stops: &[SuffixStop],
    matrix: &TravelMatrix,
    flexibility_secs: i32,
    pinned_first: bool,
) -> Result<Vec<usize>, Error> {
    let mut order: Vec<usize> = (0..stops.len()).collect();
    let mut best_cost =
        match suffix_cost(start, departure, stops, &order, matrix, flexibility_secs)? {
            Some(cost) => cost,
            // The current plan is already infeasible (e.g. accumulated
            // delay); search still looks for any feasible ordering.
            None => f64::INFINITY,
        };

    let first = usize::from(pinned_first);
    for _ in 0..MAX_SUFFIX_PASSES {
        let mut improved = false;
        'outer: for i in first..order.len().saturating_sub(1) {
            for j in i + 1..order.len() {
                let mut candidate = order.clone();
                candidate[i..=j].reverse();
                if let Some(cost) =
                    suffix_cost(start, departure, stops, &candidate, matrix, flexibility_secs)?
                {
                    if cost + 1e-9 < best_cost {
                        order = candidate;
                        best_cost = cost;
                        improved = true;
                        break 'outer;
                    }
                }
            }
        }
        if !improved {
            break;
        }
    }

    Ok(order)
}

/// Planned arrivals for the suffix in its final order.
fn suffix_arrivals(
    start: &Location,
    departure: i64,
    stops: &[SuffixStop],
    order: &[usize],
    matrix: &TravelMatrix,
) -> Result<Vec<i64>, Error> {
    let mut time = departure;
    let mut prev = *start;
    let mut arrivals = Vec::with_capacity(order.len());

    for &idx in order {
        let stop = &stops[idx];
        let leg = matrix.leg(&prev, &stop.location)?;
        time += i64::from(leg.duration_secs);
        if let Some(window) = stop.window {
            if time < window.start {
                time = window.start;
            }
        }
        arrivals.push(time);
        time += i64::from(stop.service_secs);
        prev = stop.location;
    }

    Ok(arrivals)
}

/// Distance/duration of the remaining plan from the current position.
fn path_totals(
    route: &Route,
    suffix_matrix: &TravelMatrix,
    suffix_start: &Location,
) -> Result<(f64, i32), Error> {
    let mut distance = 0.0;
    let mut duration: i64 = 0;

    let mut prev = *suffix_start;
    for stop in route.remaining_stops() {
        let leg = suffix_matrix.leg(&prev, &stop.location)?;
        distance += leg.distance_km;
        duration += i64::from(leg.duration_secs) + i64::from(stop.planned_service_secs);
        prev = stop.location;
    }

    Ok((distance, duration as i32))
}
