//! Engine error taxonomy.
//!
//! Constraint and transition violations always name the offending rule and
//! entity; they are surfaced to the caller, never coerced or partially
//! applied.

use thiserror::Error;

use crate::constraints::ConstraintRule;
use crate::estimate::EstimateError;
use crate::model::{ResultId, RouteId, StopId};
use crate::solver::BlockedOrder;

#[derive(Debug, Error)]
pub enum Error {
    /// The optimizer could not construct any feasible route. Carries the
    /// blocking reason for every order so callers can relax constraints or
    /// place orders manually.
    #[error("no feasible solution: {} order(s) could not be placed", blocked.len())]
    NoFeasibleSolution { blocked: Vec<BlockedOrder> },

    /// A mutation would break a capacity, distance, duration or time-window
    /// rule.
    #[error("constraint violated ({rule}): {detail}")]
    ConstraintViolated { rule: ConstraintRule, detail: String },

    /// The driver or vehicle is already bound to another active route.
    #[error("{resource} {id} is already bound to route {route}")]
    ResourceConflict {
        resource: &'static str,
        id: String,
        route: RouteId,
    },

    /// The driver or vehicle is not in an available state.
    #[error("{resource} {id} is not available")]
    ResourceUnavailable { resource: &'static str, id: String },

    /// A state-machine precondition was not met.
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// The stop requires signature or photo proof that was not supplied.
    #[error("stop {stop} requires {kind} proof of delivery")]
    ProofRequired { stop: StopId, kind: &'static str },

    /// Stop completion must be processed in non-decreasing sequence order.
    #[error("stop {stop} completed out of order; expected stop {expected}")]
    OutOfOrderCompletion { stop: StopId, expected: StopId },

    /// Results are applied at most once.
    #[error("optimization result {0} has already been applied")]
    ResultAlreadyApplied(ResultId),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The caller cancelled an in-flight optimization; no routes were
    /// created.
    #[error("optimization cancelled")]
    Cancelled,

    #[error(transparent)]
    Estimate(#[from] EstimateError),
}
