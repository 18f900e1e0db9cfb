//! # Tooltip Interaction Engine
//!
//! Per-marker tooltip state and drag-to-reposition.
//!
//! A bound marker shows at most one tooltip at a time:
//! - **Hover**: shown on pointer-over, hidden on pointer-out
//! - **Sticky**: pinned by a click, survives pointer-out, closed by a second click
//!
//! While a sticky tooltip is open, hovering does not stack a hover tooltip.
//!
//! Sticky tooltips can be dragged. Pointer-down on the tooltip disables the
//! map pan gesture and creates a shadow copy that follows the pointer in
//! screen coordinates. On release the angle between the marker anchor and the
//! release point picks the new anchor direction. Every way out of a drag
//! (release on the map, release outside, a new drag, an explicit cancel)
//! goes through the same cleanup, so pan is never left disabled.

use std::collections::HashMap;

use log::debug;

use crate::surface::{MapSurface, MarkerId, PointerTarget, ScreenPoint, ShadowId, TooltipId, TooltipSpec};
use crate::LatLng;

/// Anchor direction of a tooltip relative to its marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Top,
    Right,
    Bottom,
    Left,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "top" => Some(Direction::Top),
            "right" => Some(Direction::Right),
            "bottom" => Some(Direction::Bottom),
            "left" => Some(Direction::Left),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Top => "top",
            Direction::Right => "right",
            Direction::Bottom => "bottom",
            Direction::Left => "left",
        }
    }

    /// Pixel offset placing a tooltip `distance` away from the anchor.
    pub fn offset(&self, distance: f64) -> (f64, f64) {
        match self {
            Direction::Top => (0.0, -distance),
            Direction::Right => (distance, 0.0),
            Direction::Bottom => (0.0, distance),
            Direction::Left => (-distance, 0.0),
        }
    }
}

/// Angle of `release` seen from `anchor`, degrees clockwise from screen-up,
/// in `[0, 360)`.
pub fn drag_angle(anchor: ScreenPoint, release: ScreenPoint) -> f64 {
    let dx = release.x - anchor.x;
    let dy = release.y - anchor.y;
    dx.atan2(-dy).to_degrees().rem_euclid(360.0)
}

/// Angles closer than this to a sector boundary are snapped onto it.
const BOUNDARY_EPSILON_DEG: f64 = 1e-9;

/// Quantize a release point into a direction using 90 degree sectors centered
/// on each axis. A boundary angle (45, 135, ...) belongs to the clockwise
/// sector. `None` when the release point is the anchor itself.
pub fn quantize_direction(anchor: ScreenPoint, release: ScreenPoint) -> Option<Direction> {
    if anchor == release {
        return None;
    }
    let position = (drag_angle(anchor, release) + 45.0) / 90.0;
    let nearest = position.round();
    let position = if (position - nearest).abs() * 90.0 < BOUNDARY_EPSILON_DEG {
        nearest
    } else {
        position
    };
    let sector = position.floor() as u32 % 4;
    Some(match sector {
        0 => Direction::Top,
        1 => Direction::Right,
        2 => Direction::Bottom,
        _ => Direction::Left,
    })
}

/// Presentation of the tooltip currently shown for a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TooltipMode {
    Hover,
    Sticky,
}

/// Drag-to-reposition state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragState {
    Idle,
    Dragging {
        marker: MarkerId,
        shadow: ShadowId,
        start: ScreenPoint,
        last: ScreenPoint,
    },
}

impl DragState {
    /// Begin a drag: disables pan and creates the shadow.
    fn begin(
        surface: &mut dyn MapSurface,
        marker: MarkerId,
        tooltip: TooltipId,
        at: ScreenPoint,
    ) -> Self {
        surface.set_pan_enabled(false);
        let shadow = surface.add_shadow(tooltip, at);
        DragState::Dragging {
            marker,
            shadow,
            start: at,
            last: at,
        }
    }

    /// Track the pointer.
    fn moved(self, surface: &mut dyn MapSurface, to: ScreenPoint) -> Self {
        match self {
            DragState::Dragging {
                marker,
                shadow,
                start,
                ..
            } => {
                surface.move_shadow(shadow, to);
                DragState::Dragging {
                    marker,
                    shadow,
                    start,
                    last: to,
                }
            }
            DragState::Idle => DragState::Idle,
        }
    }

    /// The single cleanup path: remove the shadow and re-enable pan.
    fn end(self, surface: &mut dyn MapSurface) -> DragState {
        if let DragState::Dragging { shadow, .. } = self {
            surface.remove_shadow(shadow);
            surface.set_pan_enabled(true);
        }
        DragState::Idle
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self, DragState::Dragging { .. })
    }
}

type ContentResolver = Box<dyn Fn() -> String>;
type OffsetResolver = Box<dyn Fn(Direction) -> (f64, f64)>;

struct Binding {
    anchor: LatLng,
    direction: Direction,
    content: ContentResolver,
    offset: OffsetResolver,
    shown: Option<(TooltipId, TooltipMode)>,
}

impl Binding {
    fn spec(&self, mode: TooltipMode) -> TooltipSpec {
        TooltipSpec {
            content: (self.content)(),
            direction: self.direction,
            offset: (self.offset)(self.direction),
            sticky: mode == TooltipMode::Sticky,
        }
    }
}

/// Tooltip state for every interactive marker.
pub struct TooltipEngine {
    bindings: HashMap<MarkerId, Binding>,
    drag: DragState,
}

impl Default for TooltipEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TooltipEngine {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            drag: DragState::Idle,
        }
    }

    /// Bind a tooltip to a marker. Nothing is shown until the pointer interacts.
    pub fn bind<C, O>(
        &mut self,
        marker: MarkerId,
        anchor: LatLng,
        direction: Direction,
        content: C,
        offset: O,
    ) where
        C: Fn() -> String + 'static,
        O: Fn(Direction) -> (f64, f64) + 'static,
    {
        self.bindings.insert(
            marker,
            Binding {
                anchor,
                direction,
                content: Box::new(content),
                offset: Box::new(offset),
                shown: None,
            },
        );
    }

    /// Remove a marker's tooltip and binding, ending a drag on it.
    pub fn unbind(&mut self, surface: &mut dyn MapSurface, marker: MarkerId) {
        if let DragState::Dragging { marker: dragged, .. } = self.drag {
            if dragged == marker {
                self.drag = self.drag.end(surface);
            }
        }
        if let Some(binding) = self.bindings.remove(&marker) {
            if let Some((tooltip, _)) = binding.shown {
                surface.remove_tooltip(tooltip);
            }
        }
    }

    /// Unbind every marker.
    pub fn clear(&mut self, surface: &mut dyn MapSurface) {
        self.drag = self.drag.end(surface);
        for (_, binding) in self.bindings.drain() {
            if let Some((tooltip, _)) = binding.shown {
                surface.remove_tooltip(tooltip);
            }
        }
    }

    pub fn is_bound(&self, marker: MarkerId) -> bool {
        self.bindings.contains_key(&marker)
    }

    pub fn mode(&self, marker: MarkerId) -> Option<TooltipMode> {
        self.bindings.get(&marker)?.shown.map(|(_, mode)| mode)
    }

    pub fn tooltip(&self, marker: MarkerId) -> Option<TooltipId> {
        self.bindings.get(&marker)?.shown.map(|(id, _)| id)
    }

    pub fn direction(&self, marker: MarkerId) -> Option<Direction> {
        self.bindings.get(&marker).map(|b| b.direction)
    }

    pub fn drag_state(&self) -> DragState {
        self.drag
    }

    // ========================================================================
    // Hover / sticky
    // ========================================================================

    pub fn pointer_enter(&mut self, surface: &mut dyn MapSurface, marker: MarkerId) {
        let Some(binding) = self.bindings.get_mut(&marker) else {
            return;
        };
        if binding.shown.is_some() {
            return;
        }
        let tooltip = surface.add_tooltip(marker, &binding.spec(TooltipMode::Hover));
        binding.shown = Some((tooltip, TooltipMode::Hover));
    }

    pub fn pointer_leave(&mut self, surface: &mut dyn MapSurface, marker: MarkerId) {
        let Some(binding) = self.bindings.get_mut(&marker) else {
            return;
        };
        if let Some((tooltip, TooltipMode::Hover)) = binding.shown {
            surface.remove_tooltip(tooltip);
            binding.shown = None;
        }
    }

    /// Pin the tooltip open, or close it when already pinned.
    pub fn click(&mut self, surface: &mut dyn MapSurface, marker: MarkerId) {
        if !self.bindings.contains_key(&marker) {
            return;
        }
        if let DragState::Dragging { marker: dragged, .. } = self.drag {
            if dragged == marker {
                self.drag = self.drag.end(surface);
            }
        }
        let Some(binding) = self.bindings.get_mut(&marker) else {
            return;
        };
        match binding.shown.take() {
            Some((tooltip, TooltipMode::Sticky)) => {
                surface.remove_tooltip(tooltip);
            }
            shown => {
                if let Some((hover, _)) = shown {
                    surface.remove_tooltip(hover);
                }
                let tooltip = surface.add_tooltip(marker, &binding.spec(TooltipMode::Sticky));
                binding.shown = Some((tooltip, TooltipMode::Sticky));
            }
        }
    }

    // ========================================================================
    // Drag
    // ========================================================================

    /// Pointer-down on a marker's tooltip surface. Starts a drag when the
    /// tooltip is sticky; any drag in progress elsewhere is cleaned up first.
    pub fn pointer_down(&mut self, surface: &mut dyn MapSurface, marker: MarkerId, at: ScreenPoint) {
        self.drag = self.drag.end(surface);

        let Some(binding) = self.bindings.get(&marker) else {
            return;
        };
        let Some((tooltip, TooltipMode::Sticky)) = binding.shown else {
            return;
        };
        debug!("[Tooltip] Drag started on marker {:?}", marker);
        self.drag = DragState::begin(surface, marker, tooltip, at);
    }

    pub fn pointer_move(&mut self, surface: &mut dyn MapSurface, to: ScreenPoint) {
        self.drag = self.drag.moved(surface, to);
    }

    /// End a drag. Returns the new direction when the tooltip was re-anchored.
    pub fn pointer_up(&mut self, surface: &mut dyn MapSurface, target: PointerTarget) -> Option<Direction> {
        let DragState::Dragging { marker, start, .. } = self.drag else {
            return None;
        };
        self.drag = self.drag.end(surface);

        let PointerTarget::Map(release) = target else {
            debug!("[Tooltip] Drag released outside the map");
            return None;
        };
        if release == start {
            return None;
        }

        let binding = self.bindings.get(&marker)?;
        let anchor = surface.project(binding.anchor);
        let direction = quantize_direction(anchor, release)?;
        if direction == binding.direction {
            return None;
        }
        self.redirect(surface, marker, direction);
        Some(direction)
    }

    /// Abort a drag without re-anchoring.
    pub fn cancel_drag(&mut self, surface: &mut dyn MapSurface) {
        self.drag = self.drag.end(surface);
    }

    /// Recreate the marker's tooltip facing `direction`. The hover
    /// presentation picks the direction up the next time it is shown.
    fn redirect(&mut self, surface: &mut dyn MapSurface, marker: MarkerId, direction: Direction) {
        let Some(binding) = self.bindings.get_mut(&marker) else {
            return;
        };
        binding.direction = direction;
        if let Some((tooltip, mode)) = binding.shown.take() {
            surface.remove_tooltip(tooltip);
            let recreated = surface.add_tooltip(marker, &binding.spec(mode));
            binding.shown = Some((recreated, mode));
        }
        debug!(
            "[Tooltip] Marker {:?} tooltip now anchored {}",
            marker,
            direction.as_str()
        );
    }
}
