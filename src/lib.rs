//! Delivery route optimization engine.
//!
//! Assigns pending delivery orders to drivers and vehicles as sequenced
//! routes under capacity, distance, duration and time-window constraints,
//! then keeps those routes consistent while execution deviates from plan:
//! tracking, delay alerts, suffix re-planning, reassignment and merges.

pub mod constraints;
pub mod error;
pub mod estimate;
pub mod events;
pub mod haversine;
pub mod lifecycle;
pub mod model;
pub mod osrm;
pub mod reopt;
pub mod solver;
pub mod tracking;
