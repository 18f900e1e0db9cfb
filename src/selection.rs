//! # Selection & UI State Machine
//!
//! ```text
//! Idle ──load──> RouteLoaded ──select──> RouteSelected ──enter──> EditionMode
//!                     ^                      |    ^                    |
//!                     └───────back───────────┘    └──confirm/cancel────┘
//! ```
//!
//! The machine is forced back to `Idle` whenever the context becomes empty,
//! and `RouteLoaded` always carries a valid pointer (defaulting to `(0, 0)`).
//!
//! Entering edition mode snapshots the route. Cancel restores the snapshot
//! exactly; confirm compares the draft with the snapshot to pick the
//! recompute criterion.

use log::{debug, info};
use serde::Serialize;

use crate::error::{EditConflict, OptionExt, Result, SessionError};
use crate::{RecomputeCriterion, Route, RoutingContext, SelectionPointer, Waypoint};

/// UI state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UiState {
    Idle,
    RouteLoaded,
    RouteSelected,
    EditionMode,
}

impl UiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UiState::Idle => "idle",
            UiState::RouteLoaded => "routeLoaded",
            UiState::RouteSelected => "routeSelected",
            UiState::EditionMode => "editionMode",
        }
    }
}

/// Route state captured on entering edition mode.
#[derive(Debug, Clone, PartialEq)]
pub struct EditSnapshot {
    pub pointer: SelectionPointer,
    pub origin: Waypoint,
    pub waypoints: Vec<Waypoint>,
}

/// What confirming an edition requires.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    /// Draft identical to the snapshot, nothing to recompute
    Unchanged,
    /// Recompute the route with the draft stops
    Recompute {
        pointer: SelectionPointer,
        criterion: RecomputeCriterion,
        origin: Waypoint,
        waypoints: Vec<Waypoint>,
    },
}

/// Selection pointer plus UI state, kept consistent with the context.
#[derive(Debug, Clone)]
pub struct SelectionMachine {
    state: UiState,
    pointer: Option<SelectionPointer>,
    snapshot: Option<EditSnapshot>,
    draft: Option<(Waypoint, Vec<Waypoint>)>,
}

impl Default for SelectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionMachine {
    pub fn new() -> Self {
        Self {
            state: UiState::Idle,
            pointer: None,
            snapshot: None,
            draft: None,
        }
    }

    pub fn state(&self) -> UiState {
        self.state
    }

    pub fn pointer(&self) -> Option<SelectionPointer> {
        self.pointer
    }

    pub fn snapshot(&self) -> Option<&EditSnapshot> {
        self.snapshot.as_ref()
    }

    /// Origin and stops being edited.
    pub fn draft(&self) -> Option<(&Waypoint, &[Waypoint])> {
        self.draft.as_ref().map(|(o, w)| (o, w.as_slice()))
    }

    /// The selected route with the draft applied, for previews.
    pub fn draft_route(&self, context: &RoutingContext) -> Option<Route> {
        let pointer = self.pointer?;
        let (origin, waypoints) = self.draft.as_ref()?;
        let mut route = context.route(pointer.index1, pointer.index2)?.clone();
        route.origin = origin.clone();
        route.waypoints = waypoints.clone();
        route.paths.clear();
        Some(route)
    }

    fn reject(&self, command: &str) -> SessionError {
        SessionError::InvalidState {
            command: command.to_string(),
            state: self.state.as_str().to_string(),
        }
    }

    fn leave_edition(&mut self) {
        self.snapshot = None;
        self.draft = None;
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Re-validate against the context after any change to it.
    ///
    /// Empty context forces `Idle`. A dangling pointer is repaired to the
    /// first variant of the nearest surviving entry and the machine drops
    /// back to `RouteLoaded`, abandoning any edition on the lost route.
    pub fn sync(&mut self, context: &RoutingContext) {
        if context.is_empty() {
            if self.state != UiState::Idle {
                debug!("[Selection] Context empty, back to idle");
            }
            self.state = UiState::Idle;
            self.pointer = None;
            self.leave_edition();
            return;
        }

        match self.pointer {
            Some(pointer) if pointer.is_valid_in(context) => {
                if self.state == UiState::Idle {
                    self.state = UiState::RouteLoaded;
                }
            }
            previous => {
                let preferred = previous.map(|p| p.index1).unwrap_or(0);
                let repaired = nearest_route(context, preferred);
                debug!("[Selection] Pointer {:?} repaired to {:?}", previous, repaired);
                self.state = if repaired.is_some() {
                    UiState::RouteLoaded
                } else {
                    UiState::Idle
                };
                self.pointer = repaired;
                self.leave_edition();
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Show the loaded context, highlighting the first route.
    pub fn load(&mut self, context: &RoutingContext) {
        self.leave_edition();
        if context.is_empty() {
            self.state = UiState::Idle;
            self.pointer = None;
        } else {
            self.pointer = nearest_route(context, 0);
            self.state = if self.pointer.is_some() {
                UiState::RouteLoaded
            } else {
                UiState::Idle
            };
        }
    }

    /// Select a route and show its detail.
    pub fn select(&mut self, context: &RoutingContext, pointer: SelectionPointer) -> Result<()> {
        if self.state == UiState::EditionMode {
            return Err(self.reject("select"));
        }
        context
            .route(pointer.index1, pointer.index2)
            .ok_or_selection(pointer.index1, pointer.index2)?;
        self.pointer = Some(pointer);
        self.state = UiState::RouteSelected;
        Ok(())
    }

    /// Leave the detail view, keeping the highlight.
    pub fn back(&mut self) -> Result<()> {
        if self.state != UiState::RouteSelected {
            return Err(self.reject("back"));
        }
        self.state = UiState::RouteLoaded;
        Ok(())
    }

    /// Enter edition mode on the selected route.
    pub fn enter_edition(&mut self, context: &RoutingContext) -> Result<()> {
        if self.state != UiState::RouteSelected {
            return Err(self.reject("enter_edition"));
        }
        let pointer = self.pointer.ok_or_else(|| self.reject("enter_edition"))?;
        let route = context
            .route(pointer.index1, pointer.index2)
            .ok_or_selection(pointer.index1, pointer.index2)?;

        self.snapshot = Some(EditSnapshot {
            pointer,
            origin: route.origin.clone(),
            waypoints: route.waypoints.clone(),
        });
        self.draft = Some((route.origin.clone(), route.waypoints.clone()));
        self.state = UiState::EditionMode;
        info!("[Selection] Editing route {}", route.route_id);
        Ok(())
    }

    fn draft_mut(&mut self, command: &str) -> Result<&mut (Waypoint, Vec<Waypoint>)> {
        if self.state != UiState::EditionMode {
            return Err(self.reject(command));
        }
        let state = self.state.as_str();
        self.draft.as_mut().ok_or_else(|| SessionError::InvalidState {
            command: command.to_string(),
            state: state.to_string(),
        })
    }

    /// Move a stop to another position in the visiting order.
    pub fn move_waypoint(&mut self, from: usize, to: usize) -> Result<()> {
        let (_, waypoints) = self.draft_mut("move_waypoint")?;
        if from >= waypoints.len() || to >= waypoints.len() {
            return Err(SessionError::InvalidSelection {
                index1: from,
                index2: to,
            });
        }
        let waypoint = waypoints.remove(from);
        waypoints.insert(to, waypoint);
        Ok(())
    }

    /// Replace the origin of the draft.
    pub fn set_origin(&mut self, origin: Waypoint) -> Result<()> {
        let draft = self.draft_mut("set_origin")?;
        draft.0 = origin;
        Ok(())
    }

    /// Evaluate the draft against the snapshot without leaving edition mode.
    ///
    /// Origin change alone recomputes by distance, order change alone
    /// preserves the order. Both at once need `choice`, otherwise the edit is
    /// reported ambiguous and the machine stays in edition mode.
    pub fn confirm_edition(&self, choice: Option<RecomputeCriterion>) -> Result<EditOutcome> {
        if self.state != UiState::EditionMode {
            return Err(self.reject("confirm_edition"));
        }
        let (Some(snapshot), Some((origin, waypoints))) = (&self.snapshot, &self.draft) else {
            return Err(self.reject("confirm_edition"));
        };

        let origin_changed = *origin != snapshot.origin;
        let order_changed = *waypoints != snapshot.waypoints;
        let criterion = match (origin_changed, order_changed) {
            (false, false) => return Ok(EditOutcome::Unchanged),
            (true, false) => RecomputeCriterion::Distance,
            (false, true) => RecomputeCriterion::PreserveOrder,
            (true, true) => choice.ok_or(SessionError::AmbiguousEdit(EditConflict {
                origin_changed,
                order_changed,
            }))?,
        };
        Ok(EditOutcome::Recompute {
            pointer: snapshot.pointer,
            criterion,
            origin: origin.clone(),
            waypoints: waypoints.clone(),
        })
    }

    /// Leave edition mode after a successful confirm.
    pub fn finish_edition(&mut self, context: &RoutingContext) {
        self.leave_edition();
        self.state = UiState::RouteSelected;
        self.sync(context);
    }

    /// Abandon the edition. Returns the snapshot the route must be shown as.
    pub fn cancel_edition(&mut self) -> Result<EditSnapshot> {
        if self.state != UiState::EditionMode {
            return Err(self.reject("cancel_edition"));
        }
        let snapshot = self.snapshot.take().ok_or_else(|| self.reject("cancel_edition"))?;
        self.draft = None;
        self.pointer = Some(snapshot.pointer);
        self.state = UiState::RouteSelected;
        Ok(snapshot)
    }
}

/// First variant of the entry closest to `index1` that still has a route.
fn nearest_route(context: &RoutingContext, index1: usize) -> Option<SelectionPointer> {
    let len = context.len();
    let start = index1.min(len.checked_sub(1)?);
    let has_route = |i: usize| context.route(i, 0).is_some();
    (0..=start)
        .rev()
        .chain(start + 1..len)
        .find(|&i| has_route(i))
        .map(|i| SelectionPointer::new(i, 0))
}
