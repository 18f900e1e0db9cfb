//! # Live Position Tracking
//!
//! Optional live-position overlay. Tracking is either off or watching a
//! position source; turning it off cancels the watch and removes the overlay
//! in one step, and a source failure turns it off the same way.
//!
//! The overlay marker is a [`HeadingMarker`]: a base marker composed with a
//! rotation capability, rather than a modified base marker.

use chrono::{DateTime, Utc};
use geo::{Bearing, Distance, Haversine, Point};
use log::{debug, info, warn};

use crate::error::{PositionError, Result, SessionError};
use crate::surface::{Icon, MapSurface, MarkerId};
use crate::{LatLng, Route, RoutingRequest, Waypoint};

/// Distance below which a stop counts as reached, in meters.
const ARRIVAL_RADIUS_M: f64 = 25.0;

/// Movement below which no heading is derived from consecutive fixes, in meters.
const MIN_HEADING_MOVE_M: f64 = 2.0;

/// One reading of the position source.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub position: LatLng,
    /// Degrees clockwise from north, when the source reports it
    pub heading: Option<f64>,
    /// Meters
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            position: LatLng::new(lat, lng),
            heading: None,
            accuracy: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }
}

/// Identifier of an active position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(pub u64);

/// Device position provider. Fixes and failures are fed back to the
/// session as commands; the source only starts and stops the watch.
pub trait PositionSource {
    fn start_watch(&mut self) -> std::result::Result<WatchId, PositionError>;
    fn clear_watch(&mut self, watch: WatchId);
}

/// Marker capability: rotate to a heading.
pub trait RotatableMarker {
    fn set_rotation(&mut self, surface: &mut dyn MapSurface, degrees: f64);
    fn rotation(&self) -> f64;
}

/// Live position marker: an arrow icon on a base marker.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadingMarker {
    marker: MarkerId,
    color: String,
    rotation: f64,
}

impl HeadingMarker {
    pub fn create(surface: &mut dyn MapSurface, position: LatLng, color: &str) -> Self {
        let marker = surface.add_marker(
            position,
            Icon::Arrow {
                color: color.to_string(),
                rotation: 0.0,
            },
        );
        Self {
            marker,
            color: color.to_string(),
            rotation: 0.0,
        }
    }

    pub fn id(&self) -> MarkerId {
        self.marker
    }

    pub fn move_to(&self, surface: &mut dyn MapSurface, position: LatLng) {
        surface.set_marker_position(self.marker, position);
    }

    pub fn remove(self, surface: &mut dyn MapSurface) {
        surface.remove_marker(self.marker);
    }
}

impl RotatableMarker for HeadingMarker {
    fn set_rotation(&mut self, surface: &mut dyn MapSurface, degrees: f64) {
        self.rotation = degrees.rem_euclid(360.0);
        surface.set_marker_icon(
            self.marker,
            Icon::Arrow {
                color: self.color.clone(),
                rotation: self.rotation,
            },
        );
    }

    fn rotation(&self) -> f64 {
        self.rotation
    }
}

#[derive(Debug)]
enum TrackingState {
    Off,
    Watching {
        watch: WatchId,
        marker: Option<HeadingMarker>,
        last: Option<PositionFix>,
        heading: Option<f64>,
    },
}

/// Live position tracker.
#[derive(Debug)]
pub struct LiveTracker {
    state: TrackingState,
    color: String,
}

impl LiveTracker {
    pub fn new(color: &str) -> Self {
        Self {
            state: TrackingState::Off,
            color: color.to_string(),
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, TrackingState::Watching { .. })
    }

    pub fn last_position(&self) -> Option<LatLng> {
        match &self.state {
            TrackingState::Watching { last, .. } => last.as_ref().map(|fix| fix.position),
            TrackingState::Off => None,
        }
    }

    pub fn heading(&self) -> Option<f64> {
        match &self.state {
            TrackingState::Watching { heading, .. } => *heading,
            TrackingState::Off => None,
        }
    }

    pub fn marker(&self) -> Option<&HeadingMarker> {
        match &self.state {
            TrackingState::Watching { marker, .. } => marker.as_ref(),
            TrackingState::Off => None,
        }
    }

    /// Turn tracking on or off. Returns whether tracking is now on.
    ///
    /// A source refusing to start leaves tracking off and reports the error.
    pub fn toggle(&mut self, surface: &mut dyn MapSurface, source: &mut dyn PositionSource) -> Result<bool> {
        if self.is_tracking() {
            self.stop(surface, source);
            return Ok(false);
        }
        match source.start_watch() {
            Ok(watch) => {
                info!("[LiveTracker] Tracking started");
                self.state = TrackingState::Watching {
                    watch,
                    marker: None,
                    last: None,
                    heading: None,
                };
                Ok(true)
            }
            Err(e) => {
                warn!("[LiveTracker] Could not start tracking: {}", e);
                Err(SessionError::Position(e))
            }
        }
    }

    /// Cancel the watch and remove the overlay.
    pub fn stop(&mut self, surface: &mut dyn MapSurface, source: &mut dyn PositionSource) {
        if let TrackingState::Watching { watch, marker, .. } =
            std::mem::replace(&mut self.state, TrackingState::Off)
        {
            source.clear_watch(watch);
            if let Some(marker) = marker {
                marker.remove(surface);
            }
            info!("[LiveTracker] Tracking stopped");
        }
    }

    /// Source failure: warn and turn tracking off.
    pub fn on_error(&mut self, surface: &mut dyn MapSurface, source: &mut dyn PositionSource, error: PositionError) {
        warn!("[LiveTracker] Position source failed: {}", error);
        self.stop(surface, source);
    }

    /// Apply a fix. Returns the position and heading to center on, `None`
    /// when tracking is off.
    ///
    /// Without a reported heading, the bearing from the previous fix is used
    /// once the device moved far enough.
    pub fn on_position(&mut self, surface: &mut dyn MapSurface, fix: PositionFix) -> Option<(LatLng, Option<f64>)> {
        let TrackingState::Watching {
            marker,
            last,
            heading,
            ..
        } = &mut self.state
        else {
            debug!("[LiveTracker] Ignoring fix while off");
            return None;
        };

        let derived = fix.heading.or_else(|| {
            let previous = last.as_ref()?;
            let from: Point<f64> = previous.position.into();
            let to: Point<f64> = fix.position.into();
            (Haversine::distance(from, to) >= MIN_HEADING_MOVE_M)
                .then(|| Haversine::bearing(from, to).rem_euclid(360.0))
        });
        if derived.is_some() {
            *heading = derived;
        }

        match marker {
            Some(existing) => existing.move_to(surface, fix.position),
            None => *marker = Some(HeadingMarker::create(surface, fix.position, &self.color)),
        }
        if let (Some(overlay), Some(h)) = (marker.as_mut(), *heading) {
            overlay.set_rotation(surface, h);
        }

        let position = fix.position;
        *last = Some(fix);
        Some((position, *heading))
    }

    /// Request for the leg from the live position to the next stop of `route`.
    ///
    /// The next stop is the one after the nearest stop when that one is
    /// reached, otherwise the nearest stop itself. `None` when off, without
    /// a fix, or past the last stop.
    pub fn next_leg_request(&self, route: &Route) -> Option<RoutingRequest> {
        let here = self.last_position()?;
        let here_point: Point<f64> = here.into();
        let (nearest, distance) = route
            .waypoints
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let stop: Point<f64> = w.position().into();
                (i, Haversine::distance(here_point, stop))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        let next = if distance <= ARRIVAL_RADIUS_M { nearest + 1 } else { nearest };
        let target = route.waypoints.get(next)?;
        Some(RoutingRequest::new(
            "leg",
            Waypoint::new(here.lat, here.lng),
            vec![target.clone()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::SceneSurface;

    #[derive(Default)]
    struct FakeSource {
        next: u64,
        active: Vec<WatchId>,
        refuse: Option<PositionError>,
    }

    impl PositionSource for FakeSource {
        fn start_watch(&mut self) -> std::result::Result<WatchId, PositionError> {
            if let Some(e) = self.refuse {
                return Err(e);
            }
            self.next += 1;
            let id = WatchId(self.next);
            self.active.push(id);
            Ok(id)
        }

        fn clear_watch(&mut self, watch: WatchId) {
            self.active.retain(|w| *w != watch);
        }
    }

    #[test]
    fn test_toggle_off_clears_watch_and_overlay() {
        let mut scene = SceneSurface::new();
        let mut source = FakeSource::default();
        let mut tracker = LiveTracker::new("#0078ff");

        assert!(tracker.toggle(&mut scene, &mut source).unwrap());
        tracker.on_position(&mut scene, PositionFix::new(45.0, 5.0));
        assert_eq!(scene.markers().len(), 1);
        assert_eq!(source.active.len(), 1);

        assert!(!tracker.toggle(&mut scene, &mut source).unwrap());
        assert!(scene.markers().is_empty());
        assert!(source.active.is_empty());
        assert!(tracker.last_position().is_none());
    }

    #[test]
    fn test_permission_denied_stays_off() {
        let mut scene = SceneSurface::new();
        let mut source = FakeSource {
            refuse: Some(PositionError::PermissionDenied),
            ..FakeSource::default()
        };
        let mut tracker = LiveTracker::new("#0078ff");
        assert!(matches!(
            tracker.toggle(&mut scene, &mut source),
            Err(SessionError::Position(PositionError::PermissionDenied))
        ));
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn test_error_while_watching_turns_off() {
        let mut scene = SceneSurface::new();
        let mut source = FakeSource::default();
        let mut tracker = LiveTracker::new("#0078ff");
        tracker.toggle(&mut scene, &mut source).unwrap();
        tracker.on_position(&mut scene, PositionFix::new(45.0, 5.0));

        tracker.on_error(&mut scene, &mut source, PositionError::Timeout);
        assert!(!tracker.is_tracking());
        assert!(scene.markers().is_empty());
        assert!(source.active.is_empty());
        assert!(tracker.on_position(&mut scene, PositionFix::new(45.0, 5.0)).is_none());
    }

    #[test]
    fn test_heading_from_movement() {
        let mut scene = SceneSurface::new();
        let mut source = FakeSource::default();
        let mut tracker = LiveTracker::new("#0078ff");
        tracker.toggle(&mut scene, &mut source).unwrap();

        tracker.on_position(&mut scene, PositionFix::new(45.0, 5.0));
        let (_, heading) = tracker
            .on_position(&mut scene, PositionFix::new(45.001, 5.0))
            .unwrap();
        let heading = heading.unwrap();
        assert!(heading < 1.0 || heading > 359.0, "north-bound heading was {}", heading);

        let (_, reported) = tracker
            .on_position(&mut scene, PositionFix::new(45.001, 5.0).with_heading(135.0))
            .unwrap();
        assert_eq!(reported, Some(135.0));
        assert_eq!(tracker.marker().unwrap().rotation(), 135.0);
        let icon = &scene.marker(tracker.marker().unwrap().id()).unwrap().icon;
        assert!(matches!(icon, Icon::Arrow { rotation, .. } if *rotation == 135.0));
    }

    #[test]
    fn test_next_leg_request() {
        let mut scene = SceneSurface::new();
        let mut source = FakeSource::default();
        let mut tracker = LiveTracker::new("#0078ff");
        let stops = vec![Waypoint::new(45.01, 5.0), Waypoint::new(45.02, 5.0)];
        let route = Route::automatic(Waypoint::new(45.0, 5.0), stops.clone(), Vec::new(), 2000.0, 600.0);

        assert!(tracker.next_leg_request(&route).is_none());
        tracker.toggle(&mut scene, &mut source).unwrap();

        tracker.on_position(&mut scene, PositionFix::new(45.005, 5.0));
        let leg = tracker.next_leg_request(&route).unwrap();
        assert_eq!(leg.request_type, "leg");
        assert_eq!(leg.parameters.waypoints, vec![stops[0].clone()]);

        tracker.on_position(&mut scene, PositionFix::new(45.01, 5.0));
        let leg = tracker.next_leg_request(&route).unwrap();
        assert_eq!(leg.parameters.waypoints, vec![stops[1].clone()]);

        tracker.on_position(&mut scene, PositionFix::new(45.02, 5.0));
        assert!(tracker.next_leg_request(&route).is_none());
    }
}
