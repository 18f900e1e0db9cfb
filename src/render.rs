//! # Overlay Rendering Pipeline
//!
//! Turns the selected route into map overlays:
//! - boundary and avoid-zone polygons of the entry
//! - the computed path polyline
//! - the origin marker and numbered, elevation-colored waypoint pins
//! - midpoint discs between consecutive stops
//!
//! [`OverlayPipeline::draw`] rebuilds everything for a new selection.
//! [`OverlayPipeline::update`] only replaces the path, stop markers and
//! midpoints, for an edited variant of the same computation.
//!
//! Pin colors need the elevation range of the whole route. [`PinPalette`]
//! can only be built from a finished [`ElevationRange`], so no pin can be
//! colored before the range is known.

use std::collections::HashMap;

use geo::{Haversine, InterpolatePoint, Point};
use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::config::{OrientationMode, SessionConfig};
use crate::error::{OptionExt, Result};
use crate::surface::{Icon, MapSurface, MarkerId, ShapeId, ShapeStyle};
use crate::tooltip::{Direction, TooltipEngine};
use crate::{Bounds, LatLng, Route, RoutingContext, SelectionPointer, Waypoint};

/// Named colors accepted wherever a hex color is expected.
static NAMED_COLORS: Lazy<HashMap<&'static str, (u8, u8, u8)>> = Lazy::new(|| {
    HashMap::from([
        ("black", (0, 0, 0)),
        ("white", (255, 255, 255)),
        ("red", (255, 0, 0)),
        ("green", (0, 128, 0)),
        ("blue", (0, 0, 255)),
        ("orange", (255, 165, 0)),
        ("gray", (128, 128, 128)),
    ])
});

/// Parse `#rgb`, `#rrggbb` or a basic color name.
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    if let Some(rgb) = NAMED_COLORS.get(color) {
        return Some(*rgb);
    }
    let hex = color.strip_prefix('#').filter(|h| h.is_ascii())?;
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let mut digits = hex.chars().map(|c| c.to_digit(16).map(|d| (d * 17) as u8));
            Some((digits.next()??, digits.next()??, digits.next()??))
        }
        6 => Some((channel(&hex[0..2])?, channel(&hex[2..4])?, channel(&hex[4..6])?)),
        _ => None,
    }
}

fn to_hex((r, g, b): (u8, u8, u8)) -> String {
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

// ============================================================================
// Elevation coloring
// ============================================================================

/// Min/max of the known elevations of a set of stops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElevationRange {
    pub min: f64,
    pub max: f64,
}

impl ElevationRange {
    /// Range over the stops with a known elevation. `None` when none is known.
    pub fn from_waypoints<'a, I>(waypoints: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Waypoint>,
    {
        waypoints
            .into_iter()
            .filter_map(Waypoint::known_elevation)
            .fold(None, |range: Option<ElevationRange>, e| {
                Some(match range {
                    None => ElevationRange { min: e, max: e },
                    Some(r) => ElevationRange {
                        min: r.min.min(e),
                        max: r.max.max(e),
                    },
                })
            })
    }

    /// Position of `elevation` in the range, 0.0..=1.0. A flat range maps to 0.5.
    pub fn ratio(&self, elevation: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON {
            return 0.5;
        }
        ((elevation - self.min) / span).clamp(0.0, 1.0)
    }
}

/// Colors for waypoint pins of one route.
#[derive(Debug, Clone, PartialEq)]
pub struct PinPalette {
    range: Option<ElevationRange>,
    low: (u8, u8, u8),
    high: (u8, u8, u8),
    unknown: String,
    by_elevation: bool,
}

impl PinPalette {
    /// Palette for a route. The range covers every stop before any pin exists.
    pub fn for_route(route: &Route, config: &SessionConfig) -> Self {
        Self::with_range(ElevationRange::from_waypoints(route.stops()), config)
    }

    pub fn with_range(range: Option<ElevationRange>, config: &SessionConfig) -> Self {
        let fallback = (128, 128, 128);
        Self {
            range,
            low: parse_hex_color(&config.elevation_low_color).unwrap_or(fallback),
            high: parse_hex_color(&config.elevation_high_color).unwrap_or(fallback),
            unknown: config.unknown_elevation_color.clone(),
            by_elevation: config.color_by_elevation,
        }
    }

    pub fn range(&self) -> Option<ElevationRange> {
        self.range
    }

    /// Pin color for a stop: interpolated between the low and high colors, or
    /// the neutral color when the elevation is unknown.
    pub fn color_for(&self, waypoint: &Waypoint) -> String {
        let (Some(range), Some(elevation), true) =
            (self.range, waypoint.known_elevation(), self.by_elevation)
        else {
            return self.unknown.clone();
        };
        let t = range.ratio(elevation);
        let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
        to_hex((
            mix(self.low.0, self.high.0),
            mix(self.low.1, self.high.1),
            mix(self.low.2, self.high.2),
        ))
    }
}

/// What a marker stands for; resolved to an [`Icon`] through the palette.
#[derive(Debug, Clone, PartialEq)]
pub enum IconRole {
    /// Custom image
    File(String),
    /// Numbered waypoint pin (0-based index)
    IndexedPin(usize),
    /// Route origin
    Home,
    /// Non-interactive midpoint disc
    Disc,
}

impl IconRole {
    pub fn resolve(&self, waypoint: &Waypoint, palette: &PinPalette, config: &SessionConfig) -> Icon {
        match self {
            IconRole::File(path) => Icon::File { path: path.clone() },
            IconRole::IndexedPin(index) => Icon::Pin {
                label: (index + 1).to_string(),
                color: palette.color_for(waypoint),
            },
            IconRole::Home => Icon::Home {
                color: palette.color_for(waypoint),
            },
            IconRole::Disc => Icon::Disc {
                color: config.path_color.clone(),
                radius: 4.0,
            },
        }
    }
}

/// Tooltip text of a stop: description and elevation when known.
fn describe(waypoint: &Waypoint) -> String {
    let title = if waypoint.description.is_empty() {
        format!("{:.5}, {:.5}", waypoint.lat, waypoint.lng)
    } else {
        waypoint.description.clone()
    };
    match waypoint.known_elevation() {
        Some(e) => format!("{} ({:.0} m)", title, e),
        None => title,
    }
}

/// Great-circle midpoints between consecutive stops.
pub fn midpoints(stops: &[LatLng]) -> Vec<LatLng> {
    stops
        .windows(2)
        .map(|pair| {
            let a: Point<f64> = pair[0].into();
            let b: Point<f64> = pair[1].into();
            Haversine::point_at_ratio_between(a, b, 0.5).into()
        })
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

/// Overlays currently drawn for one selected route.
#[derive(Debug, Default)]
pub struct OverlayPipeline {
    drawn: Option<SelectionPointer>,
    boundary: Option<ShapeId>,
    zones: Vec<ShapeId>,
    path: Option<ShapeId>,
    leg: Option<ShapeId>,
    origin: Option<MarkerId>,
    waypoints: Vec<MarkerId>,
    midpoints: Vec<MarkerId>,
    stops: Vec<LatLng>,
    palette: Option<PinPalette>,
}

impl OverlayPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pointer of the route currently on the map.
    pub fn drawn(&self) -> Option<SelectionPointer> {
        self.drawn
    }

    pub fn waypoint_markers(&self) -> &[MarkerId] {
        &self.waypoints
    }

    pub fn origin_marker(&self) -> Option<MarkerId> {
        self.origin
    }

    pub fn midpoint_markers(&self) -> &[MarkerId] {
        &self.midpoints
    }

    pub fn path_shape(&self) -> Option<ShapeId> {
        self.path
    }

    pub fn zone_shapes(&self) -> &[ShapeId] {
        &self.zones
    }

    pub fn boundary_shape(&self) -> Option<ShapeId> {
        self.boundary
    }

    pub fn palette(&self) -> Option<&PinPalette> {
        self.palette.as_ref()
    }

    /// Full redraw of the route at `pointer`.
    pub fn draw(
        &mut self,
        surface: &mut dyn MapSurface,
        tooltips: &mut TooltipEngine,
        config: &SessionConfig,
        context: &RoutingContext,
        pointer: SelectionPointer,
        live: Option<LatLng>,
    ) -> Result<()> {
        let entry = context.entry(pointer.index1).ok_or_selection(pointer.index1, pointer.index2)?;
        let route = entry
            .response
            .routes
            .get(pointer.index2)
            .ok_or_selection(pointer.index1, pointer.index2)?;

        self.clear(surface, tooltips);

        if let Some(boundary) = &entry.response.boundary {
            let style = ShapeStyle::area(&config.path_color, 0.05).dashed();
            self.boundary = Some(surface.add_polygon(boundary, &style));
        }
        let zone_style = ShapeStyle::area(&config.avoid_zone_color, 0.25);
        self.zones = entry
            .request
            .avoid_zones
            .iter()
            .filter(|zone| zone.len() >= 3)
            .map(|zone| surface.add_polygon(zone, &zone_style))
            .collect();

        self.draw_route(surface, tooltips, config, route);
        self.drawn = Some(pointer);
        debug!(
            "[OverlayPipeline] Drew route {} ({} stops, {} zones)",
            route.route_id,
            self.stops.len(),
            self.zones.len()
        );
        self.zoom(surface, config, live);
        Ok(())
    }

    /// Replace path, stop markers and midpoints, keeping boundary and zones.
    ///
    /// Falls back to [`draw`](Self::draw) when `pointer` belongs to another entry.
    pub fn update(
        &mut self,
        surface: &mut dyn MapSurface,
        tooltips: &mut TooltipEngine,
        config: &SessionConfig,
        context: &RoutingContext,
        pointer: SelectionPointer,
        live: Option<LatLng>,
    ) -> Result<()> {
        if self.drawn.map(|d| d.index1) != Some(pointer.index1) {
            return self.draw(surface, tooltips, config, context, pointer, live);
        }
        let route = context
            .route(pointer.index1, pointer.index2)
            .ok_or_selection(pointer.index1, pointer.index2)?;
        self.clear_route(surface, tooltips);
        self.draw_route(surface, tooltips, config, route);
        self.drawn = Some(pointer);
        Ok(())
    }

    /// Draw a route preview, e.g. the draft of an edition in progress.
    pub fn preview(
        &mut self,
        surface: &mut dyn MapSurface,
        tooltips: &mut TooltipEngine,
        config: &SessionConfig,
        route: &Route,
    ) {
        self.clear_route(surface, tooltips);
        self.draw_route(surface, tooltips, config, route);
    }

    fn draw_route(
        &mut self,
        surface: &mut dyn MapSurface,
        tooltips: &mut TooltipEngine,
        config: &SessionConfig,
        route: &Route,
    ) {
        let palette = PinPalette::for_route(route, config);
        self.stops = route.stops().map(Waypoint::position).collect();

        let path: Vec<LatLng> = if route.paths.is_empty() {
            self.stops.clone()
        } else {
            route.paths.clone()
        };
        if path.iter().any(|p| !p.is_valid()) {
            warn!("[OverlayPipeline] Route {} has invalid path points", route.route_id);
        }
        let mut style = ShapeStyle::line(&config.path_color, 4.0);
        if route.is_ghost() {
            style = style.dashed();
        }
        self.path = Some(surface.add_polyline(&path, &style));

        let direction = Direction::parse(&config.tooltip_direction).unwrap_or(Direction::Top);
        let distance = config.tooltip_offset;

        let origin_role = match &config.origin_icon_file {
            Some(file) => IconRole::File(file.clone()),
            None => IconRole::Home,
        };
        let origin = &route.origin;
        let marker = surface.add_marker(origin.position(), origin_role.resolve(origin, &palette, config));
        let text = describe(origin);
        tooltips.bind(marker, origin.position(), direction, move || text.clone(), move |d| {
            d.offset(distance)
        });
        self.origin = Some(marker);

        for (index, waypoint) in route.waypoints.iter().enumerate() {
            let icon = IconRole::IndexedPin(index).resolve(waypoint, &palette, config);
            let marker = surface.add_marker(waypoint.position(), icon);
            let text = format!("{}. {}", index + 1, describe(waypoint));
            tooltips.bind(marker, waypoint.position(), direction, move || text.clone(), move |d| {
                d.offset(distance)
            });
            self.waypoints.push(marker);
        }

        for point in midpoints(&self.stops) {
            let icon = IconRole::Disc.resolve(origin, &palette, config);
            self.midpoints.push(surface.add_marker(point, icon));
        }
        self.palette = Some(palette);
    }

    fn clear_route(&mut self, surface: &mut dyn MapSurface, tooltips: &mut TooltipEngine) {
        for marker in self.origin.take().into_iter().chain(self.waypoints.drain(..)) {
            tooltips.unbind(surface, marker);
            surface.remove_marker(marker);
        }
        for marker in self.midpoints.drain(..) {
            surface.remove_marker(marker);
        }
        if let Some(path) = self.path.take() {
            surface.remove_shape(path);
        }
        self.stops.clear();
        self.palette = None;
    }

    /// Remove every overlay this pipeline owns.
    pub fn clear(&mut self, surface: &mut dyn MapSurface, tooltips: &mut TooltipEngine) {
        self.clear_route(surface, tooltips);
        for shape in self.boundary.take().into_iter().chain(self.zones.drain(..)) {
            surface.remove_shape(shape);
        }
        self.clear_leg(surface);
        self.drawn = None;
    }

    /// Draw the path from the live position to the next stop.
    pub fn draw_leg(&mut self, surface: &mut dyn MapSurface, config: &SessionConfig, path: &[LatLng]) {
        self.clear_leg(surface);
        let style = ShapeStyle::line(&config.path_color, 3.0).dashed();
        self.leg = Some(surface.add_polyline(path, &style));
    }

    pub fn clear_leg(&mut self, surface: &mut dyn MapSurface) {
        if let Some(leg) = self.leg.take() {
            surface.remove_shape(leg);
        }
    }

    /// Fit the view to the origin, the stops and the live position.
    pub fn zoom(&self, surface: &mut dyn MapSurface, config: &SessionConfig, live: Option<LatLng>) {
        let points = self.stops.iter().copied().chain(live);
        if let Some(bounds) = Bounds::from_points(points) {
            surface.fit_bounds(bounds, config.fit_padding);
        }
    }

    /// Center on a live position, rotating the view when heading-up.
    pub fn center(
        &self,
        surface: &mut dyn MapSurface,
        config: &SessionConfig,
        position: LatLng,
        heading: Option<f64>,
    ) {
        surface.set_center(position);
        match (config.orientation, heading) {
            (OrientationMode::HeadingUp, Some(heading)) => surface.set_bearing(heading),
            (OrientationMode::HeadingUp, None) => {}
            (OrientationMode::NorthUp, _) => surface.set_bearing(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{SceneSurface, ShapeKind};
    use crate::{RoutingEntry, RoutingRequest, ELEVATION_UNKNOWN};

    fn context() -> RoutingContext {
        let origin = Waypoint::new(45.0, 5.0).with_elevation(200.0).with_description("Home");
        let stops = vec![
            Waypoint::new(45.01, 5.01).with_elevation(10.0),
            Waypoint::new(45.02, 5.0),
            Waypoint::new(45.03, 4.99).with_elevation(30.0),
        ];
        let mut request = RoutingRequest::new("route", origin.clone(), stops.clone());
        request.avoid_zones = vec![vec![
            LatLng::new(45.015, 5.0),
            LatLng::new(45.016, 5.01),
            LatLng::new(45.017, 5.0),
        ]];
        let route = Route::automatic(origin, stops, Vec::new(), 5000.0, 3000.0);
        let ghost = route.ghost();
        let mut entry = RoutingEntry::new(request, vec![route, ghost]);
        entry.response.boundary = Some(vec![
            LatLng::new(44.9, 4.9),
            LatLng::new(45.1, 4.9),
            LatLng::new(45.1, 5.1),
        ]);
        RoutingContext::from_entries(vec![entry])
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff0080"), Some((255, 0, 128)));
        assert_eq!(parse_hex_color("#fff"), Some((255, 255, 255)));
        assert_eq!(parse_hex_color("red"), Some((255, 0, 0)));
        assert_eq!(parse_hex_color("ff0080"), None);
        assert_eq!(parse_hex_color("#12345"), None);
        assert_eq!(parse_hex_color("#gggggg"), None);
    }

    #[test]
    fn test_elevation_range_skips_unknown() {
        let stops = vec![
            Waypoint::new(0.0, 0.0).with_elevation(10.0),
            Waypoint::new(0.0, 0.0).with_elevation(ELEVATION_UNKNOWN),
            Waypoint::new(0.0, 0.0).with_elevation(30.0),
        ];
        let range = ElevationRange::from_waypoints(&stops).unwrap();
        assert_eq!(range.min, 10.0);
        assert_eq!(range.max, 30.0);
        assert_eq!(range.ratio(20.0), 0.5);

        let unknown = vec![Waypoint::new(0.0, 0.0)];
        assert!(ElevationRange::from_waypoints(&unknown).is_none());
    }

    #[test]
    fn test_palette_colors() {
        let config = SessionConfig::default();
        let range = ElevationRange { min: 10.0, max: 30.0 };
        let palette = PinPalette::with_range(Some(range), &config);

        let low = palette.color_for(&Waypoint::new(0.0, 0.0).with_elevation(10.0));
        let high = palette.color_for(&Waypoint::new(0.0, 0.0).with_elevation(30.0));
        assert_eq!(low, config.elevation_low_color);
        assert_eq!(high, config.elevation_high_color);
        assert_eq!(
            palette.color_for(&Waypoint::new(0.0, 0.0)),
            config.unknown_elevation_color
        );
    }

    #[test]
    fn test_midpoints_between_stops() {
        let mids = midpoints(&[LatLng::new(0.0, 0.0), LatLng::new(0.0, 2.0), LatLng::new(2.0, 2.0)]);
        assert_eq!(mids.len(), 2);
        assert!((mids[0].lng - 1.0).abs() < 1e-6);
        assert!(mids[0].lat.abs() < 1e-6);
        assert!((mids[1].lat - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_draw_creates_all_layers() {
        let config = SessionConfig::default();
        let ctx = context();
        let mut scene = SceneSurface::new();
        let mut tooltips = TooltipEngine::new();
        let mut pipeline = OverlayPipeline::new();

        pipeline
            .draw(&mut scene, &mut tooltips, &config, &ctx, SelectionPointer::new(0, 0), None)
            .unwrap();

        assert!(pipeline.boundary_shape().is_some());
        assert_eq!(pipeline.zone_shapes().len(), 1);
        assert_eq!(pipeline.waypoint_markers().len(), 3);
        assert_eq!(pipeline.midpoint_markers().len(), 3);
        // origin + 3 pins + 3 midpoints
        assert_eq!(scene.markers().len(), 7);
        let polygons = scene.shapes().values().filter(|s| s.kind == ShapeKind::Polygon).count();
        assert_eq!(polygons, 2);
        assert!(scene.fitted_bounds().is_some());

        let range = pipeline.palette().unwrap().range().unwrap();
        assert_eq!((range.min, range.max), (10.0, 200.0));

        let first = scene.marker(pipeline.waypoint_markers()[0]).unwrap();
        match &first.icon {
            Icon::Pin { label, color } => {
                assert_eq!(label, "1");
                assert_eq!(color, &config.elevation_low_color);
            }
            other => panic!("unexpected icon {:?}", other),
        }
        let second = scene.marker(pipeline.waypoint_markers()[1]).unwrap();
        assert!(matches!(&second.icon, Icon::Pin { color, .. } if color == &config.unknown_elevation_color));

        for marker in pipeline.waypoint_markers() {
            assert!(tooltips.is_bound(*marker));
        }
        assert!(!tooltips.is_bound(pipeline.midpoint_markers()[0]));
    }

    #[test]
    fn test_update_keeps_zones() {
        let config = SessionConfig::default();
        let ctx = context();
        let mut scene = SceneSurface::new();
        let mut tooltips = TooltipEngine::new();
        let mut pipeline = OverlayPipeline::new();

        pipeline
            .draw(&mut scene, &mut tooltips, &config, &ctx, SelectionPointer::new(0, 0), None)
            .unwrap();
        let zones = pipeline.zone_shapes().to_vec();
        let boundary = pipeline.boundary_shape();
        let path = pipeline.path_shape();

        pipeline
            .update(&mut scene, &mut tooltips, &config, &ctx, SelectionPointer::new(0, 1), None)
            .unwrap();
        assert_eq!(pipeline.zone_shapes(), zones.as_slice());
        assert_eq!(pipeline.boundary_shape(), boundary);
        assert_ne!(pipeline.path_shape(), path);
        assert_eq!(scene.markers().len(), 7);
        let ghost_path = scene.shape(pipeline.path_shape().unwrap()).unwrap();
        assert!(ghost_path.style.dashed);
    }

    #[test]
    fn test_clear_removes_everything() {
        let config = SessionConfig::default();
        let ctx = context();
        let mut scene = SceneSurface::new();
        let mut tooltips = TooltipEngine::new();
        let mut pipeline = OverlayPipeline::new();

        pipeline
            .draw(&mut scene, &mut tooltips, &config, &ctx, SelectionPointer::new(0, 0), None)
            .unwrap();
        pipeline.draw_leg(&mut scene, &config, &[LatLng::new(45.0, 5.0), LatLng::new(45.01, 5.01)]);
        pipeline.clear(&mut scene, &mut tooltips);
        assert!(scene.markers().is_empty());
        assert!(scene.shapes().is_empty());
        assert!(pipeline.drawn().is_none());
    }

    #[test]
    fn test_draw_rejects_invalid_pointer() {
        let config = SessionConfig::default();
        let mut scene = SceneSurface::new();
        let mut tooltips = TooltipEngine::new();
        let mut pipeline = OverlayPipeline::new();
        let result = pipeline.draw(
            &mut scene,
            &mut tooltips,
            &config,
            &context(),
            SelectionPointer::new(0, 9),
            None,
        );
        assert!(result.is_err());
        assert!(scene.markers().is_empty());
    }

    #[test]
    fn test_center_heading_up() {
        let mut config = SessionConfig::default();
        let pipeline = OverlayPipeline::new();
        let mut scene = SceneSurface::new();
        config.orientation = OrientationMode::HeadingUp;
        pipeline.center(&mut scene, &config, LatLng::new(45.0, 5.0), Some(270.0));
        assert_eq!(scene.bearing(), 270.0);
        assert_eq!(scene.center(), LatLng::new(45.0, 5.0));

        config.orientation = OrientationMode::NorthUp;
        pipeline.center(&mut scene, &config, LatLng::new(45.0, 5.0), Some(90.0));
        assert_eq!(scene.bearing(), 0.0);
    }
}
