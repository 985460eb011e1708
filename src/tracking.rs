//! Tracking ingestion and ETA derivation.
//!
//! Tracking events are append-only facts; they drive ETA and delay state
//! but never stop completion, which requires an explicit action. Snapshots
//! are recomputed from the latest event on demand; nothing derived is
//! persisted, so recomputation is idempotent and safe under concurrent
//! reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::estimate::{DistanceEstimator, EstimateError};
use crate::model::{Location, Route, RouteId, StopId};

/// A position/status report from a driver's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub recorded_at: i64,
    pub position: Location,
    pub speed_kmh: f64,
    pub heading: Option<f64>,
    pub accuracy_m: Option<f64>,
}

/// An appended tracking fact. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    /// Monotonic per-route sequence.
    pub seq: u64,
    pub route_id: RouteId,
    pub recorded_at: i64,
    pub position: Location,
    pub speed_kmh: f64,
    pub heading: Option<f64>,
    pub accuracy_m: Option<f64>,
    /// Stop being serviced when the fix was taken, if any.
    pub current_stop: Option<StopId>,
    pub next_stop: Option<StopId>,
}

/// Derived view of where a route stands relative to its plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub route_id: RouteId,
    pub recorded_at: i64,
    pub next_stop: Option<StopId>,
    pub distance_to_next_km: Option<f64>,
    pub eta_next_stop: Option<i64>,
    /// Projected arrival for every remaining stop, in sequence order.
    pub stop_etas: Vec<(StopId, i64)>,
    /// Projected ETA minus planned arrival for the next stop.
    pub delay_secs: i64,
    pub delayed: bool,
}

/// Append-only per-route tracking log.
///
/// Writers append under a short lock; readers receive `Arc` handles to
/// immutable events, so computing a snapshot never holds the log lock.
#[derive(Debug, Default)]
pub struct TrackingLog {
    inner: Mutex<HashMap<RouteId, Vec<Arc<TrackingEvent>>>>,
}

impl TrackingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an update, assigning the next per-route sequence number.
    pub fn append(
        &self,
        route_id: RouteId,
        update: TrackingUpdate,
        current_stop: Option<StopId>,
        next_stop: Option<StopId>,
    ) -> Arc<TrackingEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events = inner.entry(route_id.clone()).or_default();
        let event = Arc::new(TrackingEvent {
            seq: events.len() as u64 + 1,
            route_id,
            recorded_at: update.recorded_at,
            position: update.position,
            speed_kmh: update.speed_kmh,
            heading: update.heading,
            accuracy_m: update.accuracy_m,
            current_stop,
            next_stop,
        });
        events.push(Arc::clone(&event));
        event
    }

    /// Latest event for a route, if any.
    pub fn latest(&self, route_id: &RouteId) -> Option<Arc<TrackingEvent>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(route_id)
            .and_then(|events| events.last().cloned())
    }

    /// Full event history for a route, oldest first.
    pub fn history(&self, route_id: &RouteId) -> Vec<Arc<TrackingEvent>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(route_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Derives a snapshot from the latest event and the route's remaining stop
/// sequence. Pure: same inputs, same snapshot.
pub fn compute_snapshot(
    event: &TrackingEvent,
    route: &Route,
    estimator: &dyn DistanceEstimator,
    delay_threshold_secs: i64,
) -> Result<TrackingSnapshot, EstimateError> {
    let remaining = route.remaining_stops();

    let Some(next) = remaining.first() else {
        return Ok(TrackingSnapshot {
            route_id: route.id.clone(),
            recorded_at: event.recorded_at,
            next_stop: None,
            distance_to_next_km: None,
            eta_next_stop: None,
            stop_etas: Vec::new(),
            delay_secs: 0,
            delayed: false,
        });
    };

    let leg = estimator.leg(&event.position, &next.location)?;
    let eta_next = event.recorded_at + i64::from(leg.duration_secs);
    let delay_secs = eta_next - next.planned_arrival;

    let mut stop_etas = Vec::with_capacity(remaining.len());
    stop_etas.push((next.id.clone(), eta_next));
    let mut clock = eta_next + i64::from(next.planned_service_secs);
    let mut prev = next.location;
    for stop in remaining.iter().skip(1) {
        let hop = estimator.leg(&prev, &stop.location)?;
        clock += i64::from(hop.duration_secs);
        stop_etas.push((stop.id.clone(), clock));
        clock += i64::from(stop.planned_service_secs);
        prev = stop.location;
    }

    Ok(TrackingSnapshot {
        route_id: route.id.clone(),
        recorded_at: event.recorded_at,
        next_stop: Some(next.id.clone()),
        distance_to_next_km: Some(leg.distance_km),
        eta_next_stop: Some(eta_next),
        stop_etas,
        delay_secs,
        delayed: delay_secs > delay_threshold_secs,
    })
}
