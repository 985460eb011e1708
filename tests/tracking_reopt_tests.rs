//! Tracking, ETA and re-optimization tests.

mod fixtures;

use std::collections::HashSet;

use delivery_routing::error::Error;
use delivery_routing::events::DomainEvent;
use delivery_routing::lifecycle::StopCompletion;
use delivery_routing::model::{Location, Order, StopStatus};
use delivery_routing::reopt::{IssueAction, IssueKind, ReoptimizeOptions};
use delivery_routing::tracking::TrackingUpdate;

use fixtures::{CUSTOMERS, DEPARTURE, engine_with_applied_routes, order};

fn update_at(recorded_at: i64, position: Location) -> TrackingUpdate {
    TrackingUpdate {
        recorded_at,
        position,
        speed_kmh: 35.0,
        heading: Some(90.0),
        accuracy_m: Some(10.0),
    }
}

// ============================================================================
// Tracking & ETA
// ============================================================================

#[test]
fn tracking_requires_an_in_progress_route() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);

    let err = engine
        .record_tracking(&route_ids[0], update_at(DEPARTURE, CUSTOMERS[1].location()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[test]
fn tracking_snapshot_points_at_the_current_stop() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0]), order("ORD_002", &CUSTOMERS[1])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    let stops = engine.route(route_id).unwrap().stops;

    let snapshot = engine
        .record_tracking(route_id, update_at(DEPARTURE + 300, CUSTOMERS[2].location()))
        .unwrap();
    assert_eq!(snapshot.next_stop.as_ref(), Some(&stops[0].id));
    assert_eq!(snapshot.stop_etas.len(), 2);
    assert!(snapshot.distance_to_next_km.unwrap() > 0.0);

    // After completing the first stop the snapshot advances.
    engine
        .complete_stop(route_id, &stops[0].id, StopCompletion::at(DEPARTURE + 900))
        .unwrap();
    let snapshot = engine
        .record_tracking(route_id, update_at(DEPARTURE + 1000, stops[0].location))
        .unwrap();
    assert_eq!(snapshot.next_stop.as_ref(), Some(&stops[1].id));
}

#[test]
fn recomputed_snapshot_is_identical() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0]), order("ORD_002", &CUSTOMERS[1])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    let recorded = engine
        .record_tracking(route_id, update_at(DEPARTURE + 300, CUSTOMERS[2].location()))
        .unwrap();

    let a = engine.snapshot(route_id).unwrap().unwrap();
    let b = engine.snapshot(route_id).unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(a, recorded);
}

#[test]
fn snapshot_without_events_is_none() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    assert!(engine.snapshot(&route_ids[0]).unwrap().is_none());
}

// ============================================================================
// Delay handling
// ============================================================================

#[test]
fn on_time_route_raises_no_alert() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0]), order("ORD_002", &CUSTOMERS[1])];
    let (engine, sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    // On plan: reporting from the warehouse right at departure.
    engine
        .record_tracking(route_id, update_at(DEPARTURE, fixtures::WAREHOUSES[0].location()))
        .unwrap();

    let outcome = engine.handle_delay(route_id, DEPARTURE).unwrap();
    assert!(outcome.is_none());
    assert!(
        !sink
            .events()
            .iter()
            .any(|e| matches!(e, DomainEvent::DelayAlert { .. }))
    );
}

#[test]
fn breached_threshold_alerts_and_replans() {
    let orders: Vec<Order> = CUSTOMERS
        .iter()
        .take(4)
        .enumerate()
        .map(|(i, place)| order(&format!("ORD_{:03}", i + 1), place))
        .collect();
    let (engine, sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    // Two hours behind plan, far from the next stop.
    let late = DEPARTURE + 2 * 3600;
    engine
        .record_tracking(route_id, update_at(late, CUSTOMERS[15].location()))
        .unwrap();

    let snapshot = engine
        .handle_delay(route_id, late)
        .unwrap()
        .expect("delay should be flagged");
    assert!(snapshot.delayed);
    assert!(snapshot.delay_secs > 600);

    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e, DomainEvent::DelayAlert { .. }))
    );
    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e, DomainEvent::RouteReoptimized { .. }))
    );
}

// ============================================================================
// Suffix re-optimization
// ============================================================================

#[test]
fn issue_with_skip_return_later_skips_and_replans() {
    let orders: Vec<Order> = CUSTOMERS
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, place)| order(&format!("ORD_{:03}", i + 1), place))
        .collect();
    let (engine, sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    let before = engine.route(route_id).unwrap();
    let first = before.stops[0].clone();
    engine
        .complete_stop(route_id, &first.id, StopCompletion::at(DEPARTURE + 600))
        .unwrap();

    let trouble = before.stops[1].id.clone();
    let after = engine
        .report_issue(
            route_id,
            &trouble,
            IssueKind::CustomerUnavailable,
            IssueAction::SkipReturnLater,
            DEPARTURE + 900,
        )
        .unwrap();

    // Completed history is untouched.
    let done = after.stop(&first.id).unwrap();
    assert_eq!(done.status, StopStatus::Completed);
    assert_eq!(done.sequence, 1);

    // The troubled stop is skipped with the issue as its reason.
    let skipped = after.stop(&trouble).unwrap();
    assert_eq!(skipped.status, StopStatus::Skipped);
    assert_eq!(skipped.skip_reason.as_deref(), Some("customer_unavailable"));

    // No stop was lost, sequences stay dense, the suffix stays pending.
    let ids: HashSet<String> = after.stops.iter().map(|s| s.id.to_string()).collect();
    let expected: HashSet<String> = before.stops.iter().map(|s| s.id.to_string()).collect();
    assert_eq!(ids, expected);
    let seqs: Vec<u32> = after.stops.iter().map(|s| s.sequence).collect();
    assert_eq!(seqs, (1..=after.stops.len() as u32).collect::<Vec<_>>());
    assert_eq!(
        after
            .stops
            .iter()
            .filter(|s| s.status == StopStatus::Pending)
            .count(),
        3
    );

    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e, DomainEvent::IssueReported { issue, .. }
                if *issue == IssueKind::CustomerUnavailable))
    );
}

#[test]
fn reschedule_skips_without_replanning() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0]), order("ORD_002", &CUSTOMERS[1])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    let stops = engine.route(route_id).unwrap().stops;

    let after = engine
        .report_issue(
            route_id,
            &stops[0].id,
            IssueKind::WrongAddress,
            IssueAction::Reschedule,
            DEPARTURE + 300,
        )
        .unwrap();

    let skipped = after.stop(&stops[0].id).unwrap();
    assert_eq!(skipped.status, StopStatus::Skipped);
    assert_eq!(
        skipped.skip_reason.as_deref(),
        Some("reschedule: wrong_address")
    );
}

#[test]
fn reoptimize_preserves_identity_and_proof_flags() {
    let orders = vec![
        order("ORD_001", &CUSTOMERS[0]).requiring_signature(),
        order("ORD_002", &CUSTOMERS[1]),
        order("ORD_003", &CUSTOMERS[2]).requiring_photo(),
    ];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];
    engine.start_route(route_id, DEPARTURE).unwrap();

    let before = engine.route(route_id).unwrap();
    let after = engine
        .reoptimize_route(route_id, &ReoptimizeOptions::default(), DEPARTURE + 60)
        .unwrap();

    assert_eq!(before.stops.len(), after.stops.len());
    for stop in &before.stops {
        let counterpart = after.stop(&stop.id).expect("stop identity preserved");
        assert_eq!(counterpart.signature_required, stop.signature_required);
        assert_eq!(counterpart.photo_required, stop.photo_required);
        assert_eq!(counterpart.order_id, stop.order_id);
    }
}

#[test]
fn avoided_zone_stops_sink_to_the_end() {
    // Three nearby stops; the avoided-zone stop starts first in plan order.
    let orders = vec![
        order("ORD_AVOID", &CUSTOMERS[0]).with_zone("construction"),
        order("ORD_002", &CUSTOMERS[7]),
        order("ORD_003", &CUSTOMERS[12]),
    ];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];
    engine.start_route(route_id, DEPARTURE).unwrap();

    let options = ReoptimizeOptions {
        avoid_zones: vec!["construction".to_string()],
    };
    let after = engine
        .reoptimize_route(route_id, &options, DEPARTURE + 60)
        .unwrap();

    let last = after.stops.last().unwrap();
    assert_eq!(last.order_id.as_str(), "ORD_AVOID");
}

#[test]
fn reoptimizing_a_completed_route_is_rejected() {
    let orders = vec![order("ORD_001", &CUSTOMERS[0])];
    let (engine, _sink, _result, route_ids) = engine_with_applied_routes(orders, 1);
    let route_id = &route_ids[0];

    engine.start_route(route_id, DEPARTURE).unwrap();
    let stop = engine.route(route_id).unwrap().stops[0].id.clone();
    engine
        .complete_stop(route_id, &stop, StopCompletion::at(DEPARTURE + 600))
        .unwrap();

    let err = engine
        .reoptimize_route(route_id, &ReoptimizeOptions::default(), DEPARTURE + 700)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}
