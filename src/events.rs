//! Outbound domain events, published after a state transition commits.
//!
//! The engine never blocks on delivery: sinks receive events outside all
//! locks and are expected to hand off quickly (queueing, channel send).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::model::{DriverId, ResultId, RouteId, StopId, VehicleId};
use crate::reopt::{IssueAction, IssueKind};

/// Lifecycle facts emitted to external collaborators (notification fan-out,
/// dashboards). Every variant carries the commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    RoutesApplied {
        result_id: ResultId,
        route_ids: Vec<RouteId>,
        at: i64,
    },
    RouteStarted {
        route_id: RouteId,
        at: i64,
    },
    StopArrived {
        route_id: RouteId,
        stop_id: StopId,
        at: i64,
    },
    StopCompleted {
        route_id: RouteId,
        stop_id: StopId,
        at: i64,
    },
    StopSkipped {
        route_id: RouteId,
        stop_id: StopId,
        reason: String,
        at: i64,
    },
    RouteCompleted {
        route_id: RouteId,
        at: i64,
    },
    RouteCancelled {
        route_id: RouteId,
        reason: String,
        at: i64,
    },
    RouteReassigned {
        route_id: RouteId,
        driver_id: DriverId,
        vehicle_id: VehicleId,
        at: i64,
    },
    RoutesMerged {
        primary: RouteId,
        absorbed: Vec<RouteId>,
        at: i64,
    },
    RouteReoptimized {
        route_id: RouteId,
        at: i64,
    },
    IssueReported {
        route_id: RouteId,
        stop_id: StopId,
        issue: IssueKind,
        action: IssueAction,
        at: i64,
    },
    DelayAlert {
        route_id: RouteId,
        delay_secs: i64,
        at: i64,
    },
}

/// Receives committed domain events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DomainEvent);
}

/// Discards every event. The default sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &DomainEvent) {}
}

/// Collects events in memory; useful for tests and simple consumers.
#[derive(Debug, Default)]
pub struct BufferSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, in order.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Removes and returns all buffered events.
    pub fn drain(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl EventSink for BufferSink {
    fn publish(&self, event: &DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
