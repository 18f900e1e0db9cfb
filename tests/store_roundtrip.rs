//! SQLite persistence integration tests.
//!
//! Tests the full path: model merge -> SQLite record -> fresh instance load.
//!
//! Run with: `cargo test --test store_roundtrip`

use std::time::Duration;

use route_session::model::RoutingModel;
use route_session::store::{ContextStore, SqliteStore};
use route_session::{
    LatLng, RecomputeCriterion, Route, RoutingEntry, RoutingRequest, Waypoint, ELEVATION_UNKNOWN,
};
use tempfile::TempDir;

/// Helper: an entry with a known and an unknown elevation and a flattened parameter.
fn entry(lat: f64, description: &str) -> RoutingEntry {
    let origin = Waypoint::new(lat, 5.72)
        .with_elevation(212.0)
        .with_description(description);
    let stops = vec![
        Waypoint::new(lat + 0.01, 5.73).with_elevation(250.5),
        Waypoint::new(lat + 0.02, 5.70),
    ];
    let mut request = RoutingRequest::new("route", origin.clone(), stops.clone());
    request
        .parameters
        .extra
        .insert("vehicle".to_string(), serde_json::json!("bike"));
    request.parameters.criterion = Some(RecomputeCriterion::PreserveOrder);
    request.avoid_zones = vec![vec![
        LatLng::new(lat + 0.005, 5.71),
        LatLng::new(lat + 0.006, 5.72),
        LatLng::new(lat + 0.007, 5.71),
    ]];
    request.request_id = request.compute_request_id();

    let paths = vec![LatLng::new(lat, 5.72), LatLng::new(lat + 0.02, 5.70)];
    let route = Route::automatic(origin, stops, paths, 3200.0, 1100.0);
    let ghost = route.ghost();
    RoutingEntry::new(request, vec![route, ghost])
}

fn db_path(dir: &TempDir) -> String {
    dir.path()
        .join("routes.db")
        .to_str()
        .expect("temp path is not UTF-8")
        .to_string()
}

fn start(path: &str) -> RoutingModel {
    let store = SqliteStore::new(path).expect("failed to open store");
    let mut model = RoutingModel::new(Box::new(store), "roundtrip");
    model.startup().expect("startup failed");
    model
}

// ============================================================================
// Test: Round Trip Through A Fresh Instance
// ============================================================================

#[test]
fn test_entries_survive_fresh_instance() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let path = db_path(&tmp);

    let written = {
        let mut model = start(&path);
        model.merge_incoming(vec![entry(45.18, "Gare"), entry(45.30, "Col")]);
        model.persist().expect("persist failed");
        model.context().clone()
    };

    let reopened = start(&path);
    let loaded = reopened.context();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded, &written);
    assert_eq!(loaded.entries()[0].request.origin.description, "Gare");
    assert_eq!(loaded.entries()[1].request.origin.description, "Col");

    let stops = &loaded.route(0, 0).expect("missing route").waypoints;
    assert_eq!(stops[0].elevation, 250.5);
    assert_eq!(stops[1].elevation, ELEVATION_UNKNOWN);
    assert_eq!(
        loaded.entries()[0].request.parameters.extra["vehicle"],
        serde_json::json!("bike")
    );
    assert!(loaded.route(1, 1).expect("missing ghost").is_ghost());
}

// ============================================================================
// Test: Clear And Metadata
// ============================================================================

#[test]
fn test_clear_is_durable() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let path = db_path(&tmp);

    let mut model = start(&path);
    model.merge_incoming(vec![entry(45.18, "Gare")]);
    model.persist().expect("persist failed");
    model.clear().expect("clear failed");

    let reopened = start(&path);
    assert!(reopened.context().is_empty());
}

#[test]
fn test_metadata_timestamp_strictly_increases() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let path = db_path(&tmp);

    let mut model = start(&path);
    model.merge_incoming(vec![entry(45.18, "Gare")]);

    let probe = SqliteStore::new(&path).expect("failed to open probe");
    let mut last = i64::MIN;
    for _ in 0..5 {
        model.persist().expect("persist failed");
        let meta = probe
            .read_meta()
            .expect("meta read failed")
            .expect("meta missing");
        assert!(meta.timestamp > last);
        assert_eq!(Some(meta.session_id.as_str()), model.session_id());
        assert_eq!(meta.app_name, "roundtrip");
        last = meta.timestamp;
    }
}

#[test]
fn test_load_missing_key() {
    let store = SqliteStore::in_memory().expect("failed to open store");
    assert_eq!(store.load("latest").expect("load failed"), None);
    assert!(store.watch("me", Duration::from_millis(10)).is_err());
}
