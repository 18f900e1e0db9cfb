//! # Route Session
//!
//! Session core for a route-planning map viewer.
//!
//! This library keeps a collection of computed routes consistent:
//! - between concurrently open instances sharing one SQLite store
//! - between that store and the in-memory working copy
//! - between the working copy and the interactive map overlays
//!
//! ## Features
//!
//! - **`http`** - Enable the reference HTTP client for the route computation service
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_session::{Route, RoutingEntry, RoutingRequest, Waypoint};
//! use route_session::model::RoutingModel;
//! use route_session::store::MemoryStore;
//!
//! let origin = Waypoint::new(45.1885, 5.7245);
//! let stops = vec![Waypoint::new(45.1920, 5.7300), Waypoint::new(45.1990, 5.7110)];
//! let request = RoutingRequest::new("route", origin.clone(), stops.clone());
//! let route = Route::automatic(origin, stops, Vec::new(), 4200.0, 3600.0);
//! let entry = RoutingEntry::new(request, vec![route]);
//!
//! let mut model = RoutingModel::new(Box::new(MemoryStore::default()), "demo");
//! model.startup().unwrap();
//!
//! let outcome = model.merge_incoming(vec![entry.clone()]);
//! assert!(outcome.changed);
//!
//! // Feeding the same batch twice is a no-op
//! let outcome = model.merge_incoming(vec![entry]);
//! assert!(!outcome.changed);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

// Unified error handling
pub mod error;
pub use error::{EditConflict, OptionExt, PositionError, Result, SessionError};

// Session configuration
pub mod config;
pub use config::{OrientationMode, SessionConfig};

// Persistent store adapter (SQLite record + flat session metadata)
pub mod store;
pub use store::{
    ContextStore, ExternalChangeHandle, MemoryStore, SessionMeta, SqliteStore, StoreChange,
};

// Routing context model (single writer of the collection)
pub mod model;
pub use model::{MergeOutcome, ModelEvent, RoutingModel, SessionStats};

// Import/export key-shape contract
pub mod import;
pub use import::{export_request, export_snapshot, parse_import, ImportPayload};

// Route computation service contract
pub mod service;
pub use service::RoutingService;
#[cfg(feature = "http")]
pub use service::http::HttpRoutingService;

// Selection & UI state machine
pub mod selection;
pub use selection::{EditOutcome, EditSnapshot, SelectionMachine, UiState};

// Declarative list and control rendering
pub mod view;
pub use view::{render, ControlStates, ViewModel};

// Overlay library contract
pub mod surface;
pub use surface::{
    Icon, MapSurface, MarkerId, PointerTarget, SceneSurface, ScreenPoint, ShadowId, ShapeId,
    TooltipId,
};

// Overlay rendering pipeline
pub mod render;
pub use render::{ElevationRange, IconRole, OverlayPipeline, PinPalette};

// Tooltip interaction engine
pub mod tooltip;
pub use tooltip::{quantize_direction, Direction, DragState, TooltipEngine, TooltipMode};

// Live position tracking
pub mod tracking;
pub use tracking::{HeadingMarker, LiveTracker, PositionFix, PositionSource, RotatableMarker, WatchId};

// Session context and command dispatch
pub mod session;
pub use session::{Command, DispatchOutcome, PointerEvent, SessionContext};

// ============================================================================
// Core Types
// ============================================================================

/// Elevation value meaning "unknown".
pub const ELEVATION_UNKNOWN: f64 = -9999.0;

/// Distance/time value of a route not yet confirmed by the service.
pub const ESTIMATE_PENDING: f64 = -1.0;

/// A geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check if the coordinate is finite and inside WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl From<LatLng> for geo::Point<f64> {
    fn from(p: LatLng) -> Self {
        geo::Point::new(p.lng, p.lat)
    }
}

impl From<geo::Point<f64>> for LatLng {
    fn from(p: geo::Point<f64>) -> Self {
        LatLng::new(p.y(), p.x())
    }
}

/// A stop of a route (or its origin).
///
/// `elevation` is [`ELEVATION_UNKNOWN`] when the service could not resolve it;
/// a JSON `null` deserializes to the same sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(
        default = "elevation_unknown",
        deserialize_with = "deserialize_elevation"
    )]
    pub elevation: f64,
    #[serde(default)]
    pub description: String,
}

fn elevation_unknown() -> f64 {
    ELEVATION_UNKNOWN
}

fn deserialize_elevation<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or(ELEVATION_UNKNOWN))
}

impl Waypoint {
    /// Create a waypoint with unknown elevation and no description.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            elevation: ELEVATION_UNKNOWN,
            description: String::new(),
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = elevation;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    /// Elevation if known.
    pub fn known_elevation(&self) -> Option<f64> {
        if self.elevation == ELEVATION_UNKNOWN || !self.elevation.is_finite() {
            None
        } else {
            Some(self.elevation)
        }
    }
}

/// Bounding box for a set of coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from coordinates. `None` when the input is empty.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = LatLng>,
    {
        let mut bounds: Option<Bounds> = None;
        for p in points {
            bounds = Some(match bounds {
                None => Bounds {
                    min_lat: p.lat,
                    max_lat: p.lat,
                    min_lng: p.lng,
                    max_lng: p.lng,
                },
                Some(b) => b.extended(p),
            });
        }
        bounds
    }

    /// Return these bounds grown to include `p`.
    pub fn extended(&self, p: LatLng) -> Self {
        Self {
            min_lat: self.min_lat.min(p.lat),
            max_lat: self.max_lat.max(p.lat),
            min_lng: self.min_lng.min(p.lng),
            max_lng: self.max_lng.max(p.lng),
        }
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn contains(&self, p: LatLng) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lng >= self.min_lng && p.lng <= self.max_lng
    }
}

/// Recompute criterion sent to the route computation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeCriterion {
    /// Let the service reorder stops by shortest distance
    Distance,
    /// Keep the visiting order given in the request
    PreserveOrder,
}

/// Parameters of a route computation request.
///
/// Keys other than `waypoints` and `criterion` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestParameters {
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion: Option<RecomputeCriterion>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The input that produced a routing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    pub origin: Waypoint,
    pub parameters: RequestParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoid_zones: Vec<Vec<LatLng>>,
    #[serde(default)]
    pub request_id: String,
}

/// Borrowed view of the request fields that determine its identity.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestIdentity<'a> {
    #[serde(rename = "type")]
    request_type: &'a str,
    origin: &'a Waypoint,
    parameters: &'a RequestParameters,
    avoid_zones: &'a [Vec<LatLng>],
}

impl RoutingRequest {
    /// Build a request and stamp its content-derived id.
    pub fn new(request_type: &str, origin: Waypoint, waypoints: Vec<Waypoint>) -> Self {
        let mut request = Self {
            request_type: request_type.to_string(),
            origin,
            parameters: RequestParameters {
                waypoints,
                ..RequestParameters::default()
            },
            avoid_zones: Vec::new(),
            request_id: String::new(),
        };
        request.request_id = request.compute_request_id();
        request
    }

    /// Hex SHA-256 over the canonical JSON of type, origin, parameters and zones.
    pub fn compute_request_id(&self) -> String {
        let identity = RequestIdentity {
            request_type: &self.request_type,
            origin: &self.origin,
            parameters: &self.parameters,
            avoid_zones: &self.avoid_zones,
        };
        let canonical = serde_json::to_vec(&identity).unwrap_or_default();
        format!("{:x}", Sha256::digest(&canonical))
    }

    /// Fill in `request_id` when an imported request carries none.
    pub fn ensure_request_id(&mut self) {
        if self.request_id.is_empty() {
            self.request_id = self.compute_request_id();
        }
    }

    /// Copy of this request with a new origin, stop order and criterion.
    pub fn recompute(
        &self,
        origin: Waypoint,
        waypoints: Vec<Waypoint>,
        criterion: RecomputeCriterion,
    ) -> Self {
        let mut request = self.clone();
        request.origin = origin;
        request.parameters.waypoints = waypoints;
        request.parameters.criterion = Some(criterion);
        request.request_id = request.compute_request_id();
        request
    }
}

/// One route variant of a routing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub route_id: String,
    pub automatic: bool,
    pub created: DateTime<Utc>,
    pub origin: Waypoint,
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub paths: Vec<LatLng>,
    pub estimated_distance: f64,
    pub estimated_time: f64,
}

impl Route {
    /// Create a service-computed route with a fresh id.
    pub fn automatic(
        origin: Waypoint,
        waypoints: Vec<Waypoint>,
        paths: Vec<LatLng>,
        estimated_distance: f64,
        estimated_time: f64,
    ) -> Self {
        Self {
            route_id: new_route_id(),
            automatic: true,
            created: Utc::now(),
            origin,
            waypoints,
            paths,
            estimated_distance,
            estimated_time,
        }
    }

    /// Copy of this route awaiting confirmation: new id, manual, no estimates.
    pub fn ghost(&self) -> Self {
        Self {
            route_id: new_route_id(),
            automatic: false,
            created: Utc::now(),
            origin: self.origin.clone(),
            waypoints: self.waypoints.clone(),
            paths: self.paths.clone(),
            estimated_distance: ESTIMATE_PENDING,
            estimated_time: ESTIMATE_PENDING,
        }
    }

    /// True while the service has not confirmed the estimates.
    pub fn is_ghost(&self) -> bool {
        self.estimated_distance < 0.0
    }

    /// Origin followed by the stops, in visiting order.
    pub fn stops(&self) -> impl Iterator<Item = &Waypoint> {
        std::iter::once(&self.origin).chain(self.waypoints.iter())
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.stops().map(Waypoint::position))
    }
}

fn new_route_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Result part of a routing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResponse {
    pub routes: Vec<Route>,
    /// Area the service searched, drawn as the boundary overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<Vec<LatLng>>,
}

/// One accepted computation request and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub request: RoutingRequest,
    pub response: RoutingResponse,
}

impl RoutingEntry {
    pub fn new(request: RoutingRequest, routes: Vec<Route>) -> Self {
        Self {
            request,
            response: RoutingResponse {
                routes,
                boundary: None,
            },
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.response.routes
    }

    /// Whether this entry can still absorb a duplicate request.
    pub fn is_untouched(&self) -> bool {
        self.response
            .routes
            .first()
            .map(|r| r.automatic)
            .unwrap_or(false)
    }

    /// Index of the automatic variant, if any.
    pub fn automatic_index(&self) -> Option<usize> {
        self.response.routes.iter().position(|r| r.automatic)
    }
}

/// Ordered collection of routing entries. Insertion order is the only ordering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingContext {
    entries: Vec<RoutingEntry>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<RoutingEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn entry(&self, index1: usize) -> Option<&RoutingEntry> {
        self.entries.get(index1)
    }

    pub fn route(&self, index1: usize, index2: usize) -> Option<&Route> {
        self.entries.get(index1)?.response.routes.get(index2)
    }

    pub fn into_entries(self) -> Vec<RoutingEntry> {
        self.entries
    }

    /// Total number of route variants across entries.
    pub fn route_count(&self) -> usize {
        self.entries.iter().map(|e| e.response.routes.len()).sum()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<RoutingEntry> {
        &mut self.entries
    }

    pub(crate) fn route_mut(&mut self, index1: usize, index2: usize) -> Option<&mut Route> {
        self.entries.get_mut(index1)?.response.routes.get_mut(index2)
    }
}

/// `(index1, index2)` into `context[index1].response.routes[index2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectionPointer {
    pub index1: usize,
    pub index2: usize,
}

impl SelectionPointer {
    pub fn new(index1: usize, index2: usize) -> Self {
        Self { index1, index2 }
    }

    /// Whether the pointer references a live route in `context`.
    pub fn is_valid_in(&self, context: &RoutingContext) -> bool {
        context.route(self.index1, self.index2).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RoutingRequest {
        RoutingRequest::new(
            "route",
            Waypoint::new(45.19, 5.72),
            vec![Waypoint::new(45.20, 5.73), Waypoint::new(45.21, 5.70)],
        )
    }

    #[test]
    fn test_request_id_is_content_derived() {
        let a = sample_request();
        let b = sample_request();
        assert_eq!(a.request_id, b.request_id);
        assert_eq!(a.request_id.len(), 64);

        let mut c = sample_request();
        c.origin.lat = 45.0;
        assert_ne!(a.request_id, c.compute_request_id());
    }

    #[test]
    fn test_request_id_ignores_stored_id() {
        let mut a = sample_request();
        let expected = a.request_id.clone();
        a.request_id = "stale".to_string();
        assert_eq!(a.compute_request_id(), expected);
    }

    #[test]
    fn test_waypoint_null_elevation_is_sentinel() {
        let wp: Waypoint =
            serde_json::from_str(r#"{"lat": 1.0, "lng": 2.0, "elevation": null}"#).unwrap();
        assert_eq!(wp.elevation, ELEVATION_UNKNOWN);
        assert_eq!(wp.known_elevation(), None);

        let wp: Waypoint = serde_json::from_str(r#"{"lat": 1.0, "lng": 2.0}"#).unwrap();
        assert_eq!(wp.elevation, ELEVATION_UNKNOWN);

        let wp: Waypoint =
            serde_json::from_str(r#"{"lat": 1.0, "lng": 2.0, "elevation": 212.5}"#).unwrap();
        assert_eq!(wp.known_elevation(), Some(212.5));
    }

    #[test]
    fn test_ghost_route_is_manual_and_pending() {
        let route = Route::automatic(
            Waypoint::new(45.19, 5.72),
            vec![Waypoint::new(45.20, 5.73)],
            Vec::new(),
            1200.0,
            900.0,
        );
        let ghost = route.ghost();
        assert!(!ghost.automatic);
        assert!(ghost.is_ghost());
        assert_ne!(ghost.route_id, route.route_id);
        assert_eq!(ghost.waypoints, route.waypoints);
    }

    #[test]
    fn test_bounds_from_points() {
        let bounds = Bounds::from_points(vec![
            LatLng::new(45.0, 5.0),
            LatLng::new(46.0, 4.0),
            LatLng::new(45.5, 6.0),
        ])
        .unwrap();
        assert_eq!(bounds.min_lat, 45.0);
        assert_eq!(bounds.max_lat, 46.0);
        assert_eq!(bounds.min_lng, 4.0);
        assert_eq!(bounds.max_lng, 6.0);
        assert!(Bounds::from_points(Vec::new()).is_none());
    }

    #[test]
    fn test_request_wire_shape() {
        let mut request = sample_request();
        request
            .parameters
            .extra
            .insert("vehicle".to_string(), serde_json::json!("bike"));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "route");
        assert_eq!(json["parameters"]["vehicle"], "bike");
        assert!(json.get("requestId").is_some());
        assert!(json.get("avoidZones").is_none());

        let back: RoutingRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
