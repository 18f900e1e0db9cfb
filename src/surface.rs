//! Overlay library contract.
//!
//! The map library is consumed only through [`MapSurface`]: markers,
//! polylines, polygons, tooltips and drag shadows, plus view control and
//! geo-to-screen projection. [`SceneSurface`] is a retained in-memory
//! implementation, used by headless hosts and by the tests.

use std::collections::BTreeMap;

use crate::tooltip::Direction;
use crate::{Bounds, LatLng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TooltipId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowId(pub u64);

/// A point in screen pixels, y growing downwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Marker icon.
#[derive(Debug, Clone, PartialEq)]
pub enum Icon {
    /// Image loaded from a file or URL
    File { path: String },
    /// Colored pin with a text label
    Pin { label: String, color: String },
    /// Pin marking the route origin
    Home { color: String },
    /// Plain colored disc
    Disc { color: String, radius: f64 },
    /// Arrow pointing `rotation` degrees clockwise from north
    Arrow { color: String, rotation: f64 },
}

/// Stroke and fill of a polyline or polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeStyle {
    pub color: String,
    pub weight: f64,
    pub fill_opacity: f64,
    pub dashed: bool,
}

impl ShapeStyle {
    pub fn line(color: &str, weight: f64) -> Self {
        Self {
            color: color.to_string(),
            weight,
            fill_opacity: 0.0,
            dashed: false,
        }
    }

    pub fn area(color: &str, fill_opacity: f64) -> Self {
        Self {
            color: color.to_string(),
            weight: 2.0,
            fill_opacity,
            dashed: false,
        }
    }

    pub fn dashed(mut self) -> Self {
        self.dashed = true;
        self
    }
}

/// Tooltip creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TooltipSpec {
    pub content: String,
    pub direction: Direction,
    /// Pixel offset from the marker anchor
    pub offset: (f64, f64),
    /// Pinned tooltips stay open on pointer-out
    pub sticky: bool,
}

/// Where a pointer event landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerTarget {
    /// Over the map, at a screen position
    Map(ScreenPoint),
    /// Outside the map entirely
    Outside,
}

/// Map rendering library seen from the session.
pub trait MapSurface {
    fn add_marker(&mut self, position: LatLng, icon: Icon) -> MarkerId;
    fn set_marker_position(&mut self, marker: MarkerId, position: LatLng);
    fn set_marker_icon(&mut self, marker: MarkerId, icon: Icon);
    fn remove_marker(&mut self, marker: MarkerId);

    fn add_polyline(&mut self, points: &[LatLng], style: &ShapeStyle) -> ShapeId;
    fn add_polygon(&mut self, points: &[LatLng], style: &ShapeStyle) -> ShapeId;
    fn set_shape_points(&mut self, shape: ShapeId, points: &[LatLng]);
    fn remove_shape(&mut self, shape: ShapeId);

    fn add_tooltip(&mut self, marker: MarkerId, spec: &TooltipSpec) -> TooltipId;
    fn set_tooltip_content(&mut self, tooltip: TooltipId, content: &str);
    fn set_tooltip_position(&mut self, tooltip: TooltipId, position: LatLng);
    fn remove_tooltip(&mut self, tooltip: TooltipId);

    /// Semi-transparent copy of a tooltip positioned in screen coordinates.
    fn add_shadow(&mut self, tooltip: TooltipId, at: ScreenPoint) -> ShadowId;
    fn move_shadow(&mut self, shadow: ShadowId, to: ScreenPoint);
    fn remove_shadow(&mut self, shadow: ShadowId);

    /// Enable or disable the map's own pan gesture.
    fn set_pan_enabled(&mut self, enabled: bool);
    fn fit_bounds(&mut self, bounds: Bounds, padding: f64);
    fn set_center(&mut self, center: LatLng);
    /// Rotate the view, degrees clockwise from north.
    fn set_bearing(&mut self, degrees: f64);

    /// Project a coordinate to screen pixels.
    fn project(&self, position: LatLng) -> ScreenPoint;
}

// ============================================================================
// Retained scene
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SceneMarker {
    pub position: LatLng,
    pub icon: Icon,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeKind {
    Polyline,
    Polygon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneShape {
    pub kind: ShapeKind,
    pub points: Vec<LatLng>,
    pub style: ShapeStyle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneTooltip {
    pub marker: MarkerId,
    pub spec: TooltipSpec,
    pub position: Option<LatLng>,
}

/// Retained scene graph implementing [`MapSurface`].
///
/// Projection is equirectangular around `center` at `pixels_per_degree`.
#[derive(Debug, Clone)]
pub struct SceneSurface {
    next_id: u64,
    markers: BTreeMap<MarkerId, SceneMarker>,
    shapes: BTreeMap<ShapeId, SceneShape>,
    tooltips: BTreeMap<TooltipId, SceneTooltip>,
    shadows: BTreeMap<ShadowId, (TooltipId, ScreenPoint)>,
    pan_enabled: bool,
    center: LatLng,
    bearing: f64,
    fitted: Option<Bounds>,
    pixels_per_degree: f64,
    shapes_created: u64,
}

impl Default for SceneSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneSurface {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            markers: BTreeMap::new(),
            shapes: BTreeMap::new(),
            tooltips: BTreeMap::new(),
            shadows: BTreeMap::new(),
            pan_enabled: true,
            center: LatLng::new(0.0, 0.0),
            bearing: 0.0,
            fitted: None,
            pixels_per_degree: 10_000.0,
            shapes_created: 0,
        }
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn markers(&self) -> &BTreeMap<MarkerId, SceneMarker> {
        &self.markers
    }

    pub fn marker(&self, id: MarkerId) -> Option<&SceneMarker> {
        self.markers.get(&id)
    }

    pub fn shapes(&self) -> &BTreeMap<ShapeId, SceneShape> {
        &self.shapes
    }

    pub fn shape(&self, id: ShapeId) -> Option<&SceneShape> {
        self.shapes.get(&id)
    }

    pub fn tooltips(&self) -> &BTreeMap<TooltipId, SceneTooltip> {
        &self.tooltips
    }

    pub fn tooltips_of(&self, marker: MarkerId) -> Vec<&SceneTooltip> {
        self.tooltips.values().filter(|t| t.marker == marker).collect()
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    pub fn shadow(&self, id: ShadowId) -> Option<ScreenPoint> {
        self.shadows.get(&id).map(|(_, at)| *at)
    }

    pub fn pan_enabled(&self) -> bool {
        self.pan_enabled
    }

    pub fn center(&self) -> LatLng {
        self.center
    }

    pub fn bearing(&self) -> f64 {
        self.bearing
    }

    pub fn fitted_bounds(&self) -> Option<Bounds> {
        self.fitted
    }

    /// Number of polylines and polygons ever created.
    pub fn shapes_created(&self) -> u64 {
        self.shapes_created
    }

    fn add_shape(&mut self, kind: ShapeKind, points: &[LatLng], style: &ShapeStyle) -> ShapeId {
        let id = ShapeId(self.next());
        self.shapes_created += 1;
        self.shapes.insert(
            id,
            SceneShape {
                kind,
                points: points.to_vec(),
                style: style.clone(),
            },
        );
        id
    }
}

impl MapSurface for SceneSurface {
    fn add_marker(&mut self, position: LatLng, icon: Icon) -> MarkerId {
        let id = MarkerId(self.next());
        self.markers.insert(id, SceneMarker { position, icon });
        id
    }

    fn set_marker_position(&mut self, marker: MarkerId, position: LatLng) {
        if let Some(m) = self.markers.get_mut(&marker) {
            m.position = position;
        }
    }

    fn set_marker_icon(&mut self, marker: MarkerId, icon: Icon) {
        if let Some(m) = self.markers.get_mut(&marker) {
            m.icon = icon;
        }
    }

    fn remove_marker(&mut self, marker: MarkerId) {
        self.markers.remove(&marker);
        // The library drops tooltips bound to a removed marker
        self.tooltips.retain(|_, t| t.marker != marker);
    }

    fn add_polyline(&mut self, points: &[LatLng], style: &ShapeStyle) -> ShapeId {
        self.add_shape(ShapeKind::Polyline, points, style)
    }

    fn add_polygon(&mut self, points: &[LatLng], style: &ShapeStyle) -> ShapeId {
        self.add_shape(ShapeKind::Polygon, points, style)
    }

    fn set_shape_points(&mut self, shape: ShapeId, points: &[LatLng]) {
        if let Some(s) = self.shapes.get_mut(&shape) {
            s.points = points.to_vec();
        }
    }

    fn remove_shape(&mut self, shape: ShapeId) {
        self.shapes.remove(&shape);
    }

    fn add_tooltip(&mut self, marker: MarkerId, spec: &TooltipSpec) -> TooltipId {
        let id = TooltipId(self.next());
        self.tooltips.insert(
            id,
            SceneTooltip {
                marker,
                spec: spec.clone(),
                position: None,
            },
        );
        id
    }

    fn set_tooltip_content(&mut self, tooltip: TooltipId, content: &str) {
        if let Some(t) = self.tooltips.get_mut(&tooltip) {
            t.spec.content = content.to_string();
        }
    }

    fn set_tooltip_position(&mut self, tooltip: TooltipId, position: LatLng) {
        if let Some(t) = self.tooltips.get_mut(&tooltip) {
            t.position = Some(position);
        }
    }

    fn remove_tooltip(&mut self, tooltip: TooltipId) {
        self.tooltips.remove(&tooltip);
    }

    fn add_shadow(&mut self, tooltip: TooltipId, at: ScreenPoint) -> ShadowId {
        let id = ShadowId(self.next());
        self.shadows.insert(id, (tooltip, at));
        id
    }

    fn move_shadow(&mut self, shadow: ShadowId, to: ScreenPoint) {
        if let Some(entry) = self.shadows.get_mut(&shadow) {
            entry.1 = to;
        }
    }

    fn remove_shadow(&mut self, shadow: ShadowId) {
        self.shadows.remove(&shadow);
    }

    fn set_pan_enabled(&mut self, enabled: bool) {
        self.pan_enabled = enabled;
    }

    fn fit_bounds(&mut self, bounds: Bounds, _padding: f64) {
        self.fitted = Some(bounds);
        self.center = bounds.center();
    }

    fn set_center(&mut self, center: LatLng) {
        self.center = center;
    }

    fn set_bearing(&mut self, degrees: f64) {
        self.bearing = degrees.rem_euclid(360.0);
    }

    fn project(&self, position: LatLng) -> ScreenPoint {
        ScreenPoint::new(
            (position.lng - self.center.lng) * self.pixels_per_degree,
            (self.center.lat - position.lat) * self.pixels_per_degree,
        )
    }
}
