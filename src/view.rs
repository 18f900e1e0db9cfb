//! Declarative rendering of the route list, detail panel and control states.
//!
//! [`render`] is a pure function of the context and the selection machine;
//! hosts re-render after every dispatched command.

use serde::Serialize;

use crate::selection::{SelectionMachine, UiState};
use crate::{RoutingContext, RoutingEntry, SelectionPointer, Waypoint};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointItem {
    pub index: usize,
    pub description: String,
    pub lat: f64,
    pub lng: f64,
    pub elevation: Option<f64>,
}

impl WaypointItem {
    fn new(index: usize, waypoint: &Waypoint) -> Self {
        Self {
            index,
            description: waypoint.description.clone(),
            lat: waypoint.lat,
            lng: waypoint.lng,
            elevation: waypoint.known_elevation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteItem {
    pub pointer: SelectionPointer,
    pub route_id: String,
    pub automatic: bool,
    pub ghost: bool,
    /// Kilometers, `None` while pending
    pub distance_km: Option<f64>,
    /// Minutes, `None` while pending
    pub time_min: Option<f64>,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryItem {
    pub index1: usize,
    pub request_id: String,
    pub label: String,
    pub routes: Vec<RouteItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDetail {
    pub pointer: SelectionPointer,
    pub route_id: String,
    pub created: String,
    pub automatic: bool,
    pub ghost: bool,
    pub origin: WaypointItem,
    pub waypoints: Vec<WaypointItem>,
    /// Showing the unsaved draft of an edition
    pub draft: bool,
}

/// Which controls accept input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStates {
    pub select_route: bool,
    pub delete_route: bool,
    pub duplicate_route: bool,
    pub clear_all: bool,
    pub import: bool,
    pub export: bool,
    pub back: bool,
    pub enter_edition: bool,
    pub reorder_waypoints: bool,
    pub edit_origin: bool,
    pub confirm_edition: bool,
    pub cancel_edition: bool,
}

impl ControlStates {
    pub fn for_state(state: UiState) -> Self {
        let list = ControlStates {
            select_route: true,
            delete_route: true,
            duplicate_route: true,
            clear_all: true,
            import: true,
            export: true,
            ..ControlStates::default()
        };
        match state {
            UiState::Idle => ControlStates {
                import: true,
                ..ControlStates::default()
            },
            UiState::RouteLoaded => list,
            UiState::RouteSelected => ControlStates {
                back: true,
                enter_edition: true,
                ..list
            },
            // Every other mutation is locked while editing
            UiState::EditionMode => ControlStates {
                reorder_waypoints: true,
                edit_origin: true,
                confirm_edition: true,
                cancel_edition: true,
                ..ControlStates::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub state: UiState,
    pub entries: Vec<EntryItem>,
    pub detail: Option<RouteDetail>,
    pub controls: ControlStates,
}

fn entry_label(entry: &RoutingEntry) -> String {
    let origin = &entry.request.origin;
    let name = if origin.description.is_empty() {
        format!("{:.4}, {:.4}", origin.lat, origin.lng)
    } else {
        origin.description.clone()
    };
    let stops = entry.request.parameters.waypoints.len();
    format!("{} ({} stop{})", name, stops, if stops == 1 { "" } else { "s" })
}

fn estimate(value: f64, unit: f64) -> Option<f64> {
    (value >= 0.0).then(|| value / unit)
}

/// Build the view for the current context and selection.
pub fn render(context: &RoutingContext, selection: &SelectionMachine) -> ViewModel {
    let state = selection.state();
    let highlighted = selection.pointer();

    let entries = context
        .entries()
        .iter()
        .enumerate()
        .map(|(index1, entry)| EntryItem {
            index1,
            request_id: entry.request.request_id.clone(),
            label: entry_label(entry),
            routes: entry
                .routes()
                .iter()
                .enumerate()
                .map(|(index2, route)| {
                    let pointer = SelectionPointer::new(index1, index2);
                    RouteItem {
                        pointer,
                        route_id: route.route_id.clone(),
                        automatic: route.automatic,
                        ghost: route.is_ghost(),
                        distance_km: estimate(route.estimated_distance, 1000.0),
                        time_min: estimate(route.estimated_time, 60.0),
                        highlighted: Some(pointer) == highlighted,
                    }
                })
                .collect(),
        })
        .collect();

    let detail = match state {
        UiState::RouteSelected | UiState::EditionMode => highlighted.and_then(|pointer| {
            let route = context.route(pointer.index1, pointer.index2)?;
            let (origin, waypoints, draft) = match selection.draft() {
                Some((origin, waypoints)) => (origin, waypoints, true),
                None => (&route.origin, route.waypoints.as_slice(), false),
            };
            Some(RouteDetail {
                pointer,
                route_id: route.route_id.clone(),
                created: route.created.to_rfc3339(),
                automatic: route.automatic,
                ghost: route.is_ghost(),
                origin: WaypointItem::new(0, origin),
                waypoints: waypoints
                    .iter()
                    .enumerate()
                    .map(|(i, w)| WaypointItem::new(i + 1, w))
                    .collect(),
                draft,
            })
        }),
        UiState::Idle | UiState::RouteLoaded => None,
    };

    ViewModel {
        state,
        entries,
        detail,
        controls: ControlStates::for_state(state),
    }
}
