//! # Session Context
//!
//! One explicit owner for everything a running viewer instance needs:
//! the model, the selection machine, the overlay pipeline, the tooltip
//! engine, the live tracker and the external-change subscription.
//!
//! Every UI action is a [`Command`] passed to [`SessionContext::dispatch`].
//! Mutations are persisted before anything is rendered; when the store
//! rejects a write, the working copy is rolled back and the command fails.
//! A failed service computation never touches the context.

use log::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{OptionExt, PositionError, Result, SessionError};
use crate::import::{export_request, export_snapshot, parse_import, ImportPayload};
use crate::model::{MergeOutcome, ModelEvent, RoutingModel};
use crate::render::OverlayPipeline;
use crate::selection::{EditOutcome, SelectionMachine, UiState};
use crate::service::{accept_response, RoutingService};
use crate::store::{ContextStore, ExternalChangeHandle, SqliteStore};
use crate::surface::{MapSurface, MarkerId, PointerTarget, ScreenPoint};
use crate::tooltip::TooltipEngine;
use crate::tracking::{LiveTracker, PositionFix, PositionSource};
use crate::view::{render, ViewModel};
use crate::{RecomputeCriterion, Route, RoutingEntry, RoutingRequest, SelectionPointer, Waypoint};

/// Color of the live position arrow.
const LIVE_MARKER_COLOR: &str = "#0078ff";

/// Pointer interaction with the map overlays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Enter(MarkerId),
    Leave(MarkerId),
    Click(MarkerId),
    /// Pointer pressed on the tooltip of a marker
    TooltipDown { marker: MarkerId, at: ScreenPoint },
    Move(ScreenPoint),
    Up(PointerTarget),
}

/// A UI action.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Reset the selection to the first route
    Load,
    Select { index1: usize, index2: usize },
    Back,
    DeleteRoute { index1: usize, index2: usize },
    DeleteEntry { index1: usize },
    DuplicateRoute { index1: usize, index2: usize },
    ClearAll,
    /// Import the text of a request or snapshot file
    Import { text: String },
    Compute(RoutingRequest),
    ExportSnapshot,
    ExportRequest { index1: usize },
    EnterEdition,
    MoveWaypoint { from: usize, to: usize },
    SetOrigin(Waypoint),
    ConfirmEdition { criterion: Option<RecomputeCriterion> },
    CancelEdition,
    Zoom,
    /// Another instance wrote to the store
    ExternalChange,
    Pointer(PointerEvent),
    ToggleTracking,
    PositionUpdate(PositionFix),
    PositionFailed(PositionError),
    /// Compute and draw the leg from the live position to the next stop
    RequestLiveLeg,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Select { .. } => "select",
            Command::Back => "back",
            Command::DeleteRoute { .. } => "delete_route",
            Command::DeleteEntry { .. } => "delete_entry",
            Command::DuplicateRoute { .. } => "duplicate_route",
            Command::ClearAll => "clear_all",
            Command::Import { .. } => "import",
            Command::Compute(_) => "compute",
            Command::ExportSnapshot => "export_snapshot",
            Command::ExportRequest { .. } => "export_request",
            Command::EnterEdition => "enter_edition",
            Command::MoveWaypoint { .. } => "move_waypoint",
            Command::SetOrigin(_) => "set_origin",
            Command::ConfirmEdition { .. } => "confirm_edition",
            Command::CancelEdition => "cancel_edition",
            Command::Zoom => "zoom",
            Command::ExternalChange => "external_change",
            Command::Pointer(_) => "pointer",
            Command::ToggleTracking => "toggle_tracking",
            Command::PositionUpdate(_) => "position_update",
            Command::PositionFailed(_) => "position_failed",
            Command::RequestLiveLeg => "request_live_leg",
        }
    }

    /// Commands that change the routing collection.
    fn mutates_context(&self) -> bool {
        matches!(
            self,
            Command::DeleteRoute { .. }
                | Command::DeleteEntry { .. }
                | Command::DuplicateRoute { .. }
                | Command::ClearAll
                | Command::Import { .. }
                | Command::Compute(_)
        )
    }
}

/// Result of a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub view: ViewModel,
    /// Text of an export command
    pub exported: Option<String>,
    /// Non-fatal problems to show the operator
    pub warnings: Vec<String>,
    pub events: Vec<ModelEvent>,
}

/// A running viewer session.
pub struct SessionContext<S: MapSurface> {
    config: SessionConfig,
    model: RoutingModel,
    selection: SelectionMachine,
    pipeline: OverlayPipeline,
    tooltips: TooltipEngine,
    tracker: LiveTracker,
    surface: S,
    service: Box<dyn RoutingService>,
    position: Option<Box<dyn PositionSource>>,
    watcher: Option<ExternalChangeHandle>,
}

impl<S: MapSurface> SessionContext<S> {
    /// Start a session over `store`: load the context, subscribe to external
    /// changes and draw the first route.
    pub fn open(
        config: SessionConfig,
        store: Box<dyn ContextStore>,
        surface: S,
        service: Box<dyn RoutingService>,
    ) -> Result<Self> {
        config.validate()?;
        let mut model =
            RoutingModel::new(store, &config.app_name).with_session_reuse(config.reuse_session);
        model.startup()?;

        let watcher = match model.watch(config.watch_interval()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("[Session] External changes will not be observed: {}", e);
                None
            }
        };

        let mut selection = SelectionMachine::new();
        selection.load(model.context());

        let mut session = Self {
            config,
            model,
            selection,
            pipeline: OverlayPipeline::new(),
            tooltips: TooltipEngine::new(),
            tracker: LiveTracker::new(LIVE_MARKER_COLOR),
            surface,
            service,
            position: None,
            watcher,
        };
        session.redraw()?;
        info!(
            "[Session] Opened with {} entries",
            session.model.context().len()
        );
        Ok(session)
    }

    /// Start a session on the SQLite database named in the configuration.
    pub fn open_sqlite(config: SessionConfig, surface: S, service: Box<dyn RoutingService>) -> Result<Self> {
        let store = SqliteStore::new(&config.db_path)?;
        Self::open(config, Box::new(store), surface, service)
    }

    pub fn with_position_source(mut self, source: Box<dyn PositionSource>) -> Self {
        self.position = Some(source);
        self
    }

    /// Tear down: stop watching the store and tracking, remove overlays.
    pub fn close(mut self) -> S {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.cancel();
        }
        if let Some(source) = self.position.as_mut() {
            self.tracker.stop(&mut self.surface, source.as_mut());
        }
        self.pipeline.clear(&mut self.surface, &mut self.tooltips);
        info!("[Session] Closed");
        self.surface
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn model(&self) -> &RoutingModel {
        &self.model
    }

    pub fn selection(&self) -> &SelectionMachine {
        &self.selection
    }

    pub fn pipeline(&self) -> &OverlayPipeline {
        &self.pipeline
    }

    pub fn tooltips(&self) -> &TooltipEngine {
        &self.tooltips
    }

    pub fn tracker(&self) -> &LiveTracker {
        &self.tracker
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Subscription to external changes, to register extra callbacks.
    pub fn watcher_mut(&mut self) -> Option<&mut ExternalChangeHandle> {
        self.watcher.as_mut()
    }

    pub fn view(&self) -> ViewModel {
        render(self.model.context(), &self.selection)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run one command and return the resulting view.
    pub fn dispatch(&mut self, command: Command) -> Result<DispatchOutcome> {
        debug!("[Session] Dispatching {}", command.name());
        if command.mutates_context() && self.selection.state() == UiState::EditionMode {
            return Err(SessionError::InvalidState {
                command: command.name().to_string(),
                state: UiState::EditionMode.as_str().to_string(),
            });
        }

        let mut exported = None;
        let mut warnings = Vec::new();

        match command {
            Command::Load => {
                self.selection.load(self.model.context());
                self.redraw()?;
            }
            Command::Select { index1, index2 } => {
                self.selection
                    .select(self.model.context(), SelectionPointer::new(index1, index2))?;
                self.redraw()?;
            }
            Command::Back => self.selection.back()?,
            Command::DeleteRoute { index1, index2 } => {
                self.commit(|model| model.delete_route(index1, index2))?;
                self.selection.sync(self.model.context());
                self.redraw()?;
            }
            Command::DeleteEntry { index1 } => {
                self.commit(|model| model.delete_entry(index1))?;
                self.selection.sync(self.model.context());
                self.redraw()?;
            }
            Command::DuplicateRoute { index1, index2 } => {
                let ghost = self.commit(|model| model.duplicate_route(index1, index2))?;
                self.selection.select(self.model.context(), ghost)?;
                self.redraw()?;
            }
            Command::ClearAll => {
                self.model.clear()?;
                self.selection.sync(self.model.context());
                self.pipeline.clear(&mut self.surface, &mut self.tooltips);
            }
            Command::Import { text } => match parse_import(&text)? {
                ImportPayload::Request(request) => {
                    if let Some(notice) = self.compute(request)? {
                        warnings.push(notice);
                    }
                }
                ImportPayload::Snapshot(entries) => {
                    let outcome = self.merge(entries)?;
                    if outcome.duplicates > 0 {
                        warnings.push(format!(
                            "{} already known entries skipped",
                            outcome.duplicates
                        ));
                    }
                    if let Some(&first) = outcome.appended.first() {
                        self.selection
                            .select(self.model.context(), SelectionPointer::new(first, 0))?;
                        self.redraw()?;
                    }
                }
            },
            Command::Compute(request) => {
                if let Some(notice) = self.compute(request)? {
                    warnings.push(notice);
                }
            }
            Command::ExportSnapshot => {
                exported = Some(export_snapshot(self.model.context())?);
            }
            Command::ExportRequest { index1 } => {
                let entry = self.model.context().entry(index1).ok_or_selection(index1, 0)?;
                exported = Some(export_request(entry)?);
            }
            Command::EnterEdition => self.selection.enter_edition(self.model.context())?,
            Command::MoveWaypoint { from, to } => {
                self.selection.move_waypoint(from, to)?;
                self.preview_draft();
            }
            Command::SetOrigin(origin) => {
                self.selection.set_origin(origin)?;
                self.preview_draft();
            }
            Command::ConfirmEdition { criterion } => self.confirm_edition(criterion)?,
            Command::CancelEdition => {
                let snapshot = self.selection.cancel_edition()?;
                self.pipeline.update(
                    &mut self.surface,
                    &mut self.tooltips,
                    &self.config,
                    self.model.context(),
                    snapshot.pointer,
                    self.tracker.last_position(),
                )?;
            }
            Command::Zoom => {
                self.pipeline
                    .zoom(&mut self.surface, &self.config, self.tracker.last_position());
            }
            Command::ExternalChange => {
                self.sync_external()?;
            }
            Command::Pointer(event) => self.pointer(event),
            Command::ToggleTracking => {
                if let Some(warning) = self.toggle_tracking() {
                    warnings.push(warning);
                }
            }
            Command::PositionUpdate(fix) => {
                if let Some((position, heading)) = self.tracker.on_position(&mut self.surface, fix) {
                    self.pipeline
                        .center(&mut self.surface, &self.config, position, heading);
                }
            }
            Command::PositionFailed(error) => {
                if let Some(source) = self.position.as_mut() {
                    self.tracker.on_error(&mut self.surface, source.as_mut(), error);
                }
                self.pipeline.clear_leg(&mut self.surface);
                warnings.push(format!("Live position stopped: {}", error));
            }
            Command::RequestLiveLeg => self.live_leg()?,
        }

        Ok(DispatchOutcome {
            view: self.view(),
            exported,
            warnings,
            events: self.model.take_events(),
        })
    }

    /// Deliver pending store notifications and reload once if there were any.
    pub fn poll_external(&mut self) -> Result<Option<DispatchOutcome>> {
        let pending = match self.watcher.as_mut() {
            Some(watcher) => watcher.dispatch_pending(),
            None => 0,
        };
        if pending == 0 {
            return Ok(None);
        }
        self.dispatch(Command::ExternalChange).map(Some)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Apply a model mutation and persist it, rolling back on store failure.
    fn commit<T>(&mut self, mutate: impl FnOnce(&mut RoutingModel) -> Result<T>) -> Result<T> {
        let before = self.model.context().clone();
        let value = mutate(&mut self.model)?;
        if let Err(e) = self.model.persist() {
            self.model.restore(before);
            self.model.take_events();
            return Err(e);
        }
        Ok(value)
    }

    /// Merge entries, persisting only when something was appended.
    fn merge(&mut self, entries: Vec<RoutingEntry>) -> Result<MergeOutcome> {
        let before = self.model.context().clone();
        let outcome = self.model.merge_incoming(entries);
        if outcome.changed {
            if let Err(e) = self.model.persist() {
                self.model.restore(before);
                self.model.take_events();
                return Err(e);
            }
        }
        self.selection.sync(self.model.context());
        Ok(outcome)
    }

    fn redraw(&mut self) -> Result<()> {
        match (self.selection.state(), self.selection.pointer()) {
            (UiState::Idle, _) | (_, None) => {
                self.pipeline.clear(&mut self.surface, &mut self.tooltips);
                Ok(())
            }
            (_, Some(pointer)) => self.pipeline.draw(
                &mut self.surface,
                &mut self.tooltips,
                &self.config,
                self.model.context(),
                pointer,
                self.tracker.last_position(),
            ),
        }
    }

    fn preview_draft(&mut self) {
        if let Some(route) = self.selection.draft_route(self.model.context()) {
            self.pipeline
                .preview(&mut self.surface, &mut self.tooltips, &self.config, &route);
        }
    }

    /// Compute a request unless an untouched entry already answers it.
    fn compute(&mut self, mut request: RoutingRequest) -> Result<Option<String>> {
        request.ensure_request_id();

        if let Some(pointer) = self.model.is_request_already_handled(&request.request_id) {
            let untouched = self
                .model
                .context()
                .entry(pointer.index1)
                .map(RoutingEntry::is_untouched)
                .unwrap_or(false);
            if untouched {
                info!("[Session] Request {} already computed", request.request_id);
                self.selection.select(self.model.context(), pointer)?;
                self.redraw()?;
                return Ok(Some("Route already computed, showing the existing result".to_string()));
            }
        }

        let response = self.service.compute(&request)?;
        let entries = accept_response(&request, response)?;
        let outcome = self.merge(entries)?;
        if let Some(&first) = outcome.appended.first() {
            let index2 = self
                .model
                .context()
                .entry(first)
                .and_then(RoutingEntry::automatic_index)
                .unwrap_or(0);
            self.selection
                .select(self.model.context(), SelectionPointer::new(first, index2))?;
            self.redraw()?;
        }
        Ok(None)
    }

    /// First route of a service answer.
    fn computed_route(&self, request: &RoutingRequest) -> Result<Route> {
        let response = self.service.compute(request)?;
        accept_response(request, response)?
            .into_iter()
            .next()
            .and_then(|entry| entry.response.routes.into_iter().next())
            .ok_or_else(|| SessionError::Http {
                message: "service returned no route".to_string(),
                status_code: None,
            })
    }

    /// Recompute an edited route. A service failure keeps edition mode open.
    fn confirm_edition(&mut self, choice: Option<RecomputeCriterion>) -> Result<()> {
        let (pointer, criterion, origin, waypoints) = match self.selection.confirm_edition(choice)? {
            EditOutcome::Unchanged => {
                self.selection.finish_edition(self.model.context());
                return self.redraw();
            }
            EditOutcome::Recompute {
                pointer,
                criterion,
                origin,
                waypoints,
            } => (pointer, criterion, origin, waypoints),
        };

        let entry = self
            .model
            .context()
            .entry(pointer.index1)
            .ok_or_selection(pointer.index1, pointer.index2)?;
        let request = entry.request.recompute(origin.clone(), waypoints.clone(), criterion);
        let computed = self.computed_route(&request)?;

        self.commit(|model| {
            model.apply_edit(pointer.index1, pointer.index2, origin, waypoints)?;
            model.confirm_route(pointer.index1, pointer.index2, &computed)
        })?;
        self.selection.finish_edition(self.model.context());
        self.pipeline.update(
            &mut self.surface,
            &mut self.tooltips,
            &self.config,
            self.model.context(),
            pointer,
            self.tracker.last_position(),
        )
    }

    /// Reload after another instance wrote. Returns whether anything changed.
    fn sync_external(&mut self) -> Result<bool> {
        if !self.model.reload_external()? {
            return Ok(false);
        }
        let editing = self.selection.state() == UiState::EditionMode;
        self.selection.sync(self.model.context());
        if editing && self.selection.state() == UiState::EditionMode {
            // The edited route survived; keep showing the draft
            self.preview_draft();
        } else {
            self.redraw()?;
        }
        Ok(true)
    }

    fn pointer(&mut self, event: PointerEvent) {
        let surface = &mut self.surface;
        match event {
            PointerEvent::Enter(marker) => self.tooltips.pointer_enter(surface, marker),
            PointerEvent::Leave(marker) => self.tooltips.pointer_leave(surface, marker),
            PointerEvent::Click(marker) => self.tooltips.click(surface, marker),
            PointerEvent::TooltipDown { marker, at } => self.tooltips.pointer_down(surface, marker, at),
            PointerEvent::Move(to) => self.tooltips.pointer_move(surface, to),
            PointerEvent::Up(target) => {
                if let Some(direction) = self.tooltips.pointer_up(surface, target) {
                    debug!("[Session] Tooltip moved {}", direction.as_str());
                }
            }
        }
    }

    fn toggle_tracking(&mut self) -> Option<String> {
        let Some(source) = self.position.as_mut() else {
            return Some(format!("Live position unavailable: {}", PositionError::Unavailable));
        };
        match self.tracker.toggle(&mut self.surface, source.as_mut()) {
            Ok(true) => None,
            Ok(false) => {
                self.pipeline.clear_leg(&mut self.surface);
                None
            }
            Err(e) => Some(e.to_string()),
        }
    }

    fn live_leg(&mut self) -> Result<()> {
        let pointer = self.selection.pointer().ok_or_else(|| SessionError::InvalidState {
            command: "request_live_leg".to_string(),
            state: self.selection.state().as_str().to_string(),
        })?;
        let route = self
            .model
            .route(pointer.index1, pointer.index2)
            .ok_or_selection(pointer.index1, pointer.index2)?;
        let request = self
            .tracker
            .next_leg_request(route)
            .ok_or_else(|| SessionError::InvalidState {
                command: "request_live_leg".to_string(),
                state: "no live position or no stop left".to_string(),
            })?;

        let leg = self.computed_route(&request)?;
        let path = if leg.paths.is_empty() {
            leg.stops().map(Waypoint::position).collect()
        } else {
            leg.paths
        };
        self.pipeline.draw_leg(&mut self.surface, &self.config, &path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::store::MemoryStore;
    use crate::surface::SceneSurface;
    use crate::tracking::WatchId;
    use crate::{LatLng, RoutingContext};

    /// Answers every request with one automatic route through its stops.
    #[derive(Clone, Default)]
    struct EchoService {
        calls: Rc<Cell<usize>>,
        fail: Rc<Cell<bool>>,
    }

    impl RoutingService for EchoService {
        fn compute(&self, request: &RoutingRequest) -> Result<RoutingContext> {
            self.calls.set(self.calls.get() + 1);
            if self.fail.get() {
                return Err(SessionError::Http {
                    message: "unavailable".to_string(),
                    status_code: Some(503),
                });
            }
            let stops = request.parameters.waypoints.clone();
            let paths = std::iter::once(&request.origin)
                .chain(stops.iter())
                .map(Waypoint::position)
                .collect();
            let route = Route::automatic(request.origin.clone(), stops, paths, 1234.0, 456.0);
            Ok(RoutingContext::from_entries(vec![RoutingEntry::new(
                request.clone(),
                vec![route],
            )]))
        }
    }

    struct FakeSource {
        refuse: bool,
    }

    impl PositionSource for FakeSource {
        fn start_watch(&mut self) -> std::result::Result<WatchId, PositionError> {
            if self.refuse {
                Err(PositionError::PermissionDenied)
            } else {
                Ok(WatchId(1))
            }
        }

        fn clear_watch(&mut self, _watch: WatchId) {}
    }

    fn request(lat: f64) -> RoutingRequest {
        RoutingRequest::new(
            "route",
            Waypoint::new(lat, 5.0),
            vec![Waypoint::new(lat + 0.01, 5.01), Waypoint::new(lat + 0.02, 5.0)],
        )
    }

    fn open(store: MemoryStore, service: EchoService) -> SessionContext<SceneSurface> {
        SessionContext::open(
            SessionConfig::default(),
            Box::new(store),
            SceneSurface::new(),
            Box::new(service),
        )
        .unwrap()
    }

    #[test]
    fn test_open_empty_is_idle() {
        let session = open(MemoryStore::new(), EchoService::default());
        let view = session.view();
        assert_eq!(view.state, UiState::Idle);
        assert!(view.controls.import);
        assert!(session.surface().markers().is_empty());
    }

    #[test]
    fn test_compute_selects_and_draws() {
        let service = EchoService::default();
        let mut session = open(MemoryStore::new(), service.clone());

        let outcome = session.dispatch(Command::Compute(request(45.0))).unwrap();
        assert_eq!(outcome.view.state, UiState::RouteSelected);
        assert_eq!(outcome.events, vec![ModelEvent::ContextChanged]);
        assert_eq!(session.selection().pointer(), Some(SelectionPointer::new(0, 0)));
        assert_eq!(session.pipeline().waypoint_markers().len(), 2);
        assert_eq!(service.calls.get(), 1);
    }

    #[test]
    fn test_repeated_request_is_not_recomputed() {
        let service = EchoService::default();
        let mut session = open(MemoryStore::new(), service.clone());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        session.dispatch(Command::Compute(request(46.0))).unwrap();

        let text = serde_json::to_string(&request(45.0)).unwrap();
        let outcome = session.dispatch(Command::Import { text }).unwrap();
        assert_eq!(service.calls.get(), 2);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(session.model().context().len(), 2);
        assert_eq!(session.selection().pointer(), Some(SelectionPointer::new(0, 0)));
    }

    #[test]
    fn test_service_failure_leaves_context_untouched() {
        let service = EchoService::default();
        let mut session = open(MemoryStore::new(), service.clone());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let before = session.model().context().clone();

        service.fail.set(true);
        let result = session.dispatch(Command::Compute(request(46.0)));
        assert!(matches!(result, Err(SessionError::Http { .. })));
        assert_eq!(session.model().context(), &before);
        assert_eq!(session.selection().pointer(), Some(SelectionPointer::new(0, 0)));
    }

    #[test]
    fn test_persist_failure_rolls_back_delete() {
        let store = MemoryStore::new();
        let mut session = open(store.clone(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let markers = session.surface().markers().len();

        store.fail_writes(true);
        let result = session.dispatch(Command::DeleteRoute { index1: 0, index2: 0 });
        assert!(matches!(result, Err(SessionError::Persistence { .. })));
        assert_eq!(session.model().context().len(), 1);
        assert_eq!(session.surface().markers().len(), markers);
    }

    #[test]
    fn test_delete_last_route_goes_idle() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let outcome = session
            .dispatch(Command::DeleteRoute { index1: 0, index2: 0 })
            .unwrap();
        assert_eq!(outcome.view.state, UiState::Idle);
        assert!(session.surface().markers().is_empty());
        assert!(session.surface().shapes().is_empty());
    }

    #[test]
    fn test_duplicate_selects_ghost() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let outcome = session
            .dispatch(Command::DuplicateRoute { index1: 0, index2: 0 })
            .unwrap();
        assert_eq!(session.selection().pointer(), Some(SelectionPointer::new(0, 1)));
        assert!(outcome.view.entries[0].routes[1].ghost);
        assert!(outcome.view.detail.unwrap().ghost);
    }

    #[test]
    fn test_edit_confirm_recomputes_in_place() {
        let service = EchoService::default();
        let mut session = open(MemoryStore::new(), service.clone());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let route_id = session.model().route(0, 0).unwrap().route_id.clone();

        session.dispatch(Command::EnterEdition).unwrap();
        assert!(session.dispatch(Command::DeleteRoute { index1: 0, index2: 0 }).is_err());
        session.dispatch(Command::MoveWaypoint { from: 1, to: 0 }).unwrap();
        let outcome = session
            .dispatch(Command::ConfirmEdition { criterion: None })
            .unwrap();

        assert_eq!(outcome.view.state, UiState::RouteSelected);
        let route = session.model().route(0, 0).unwrap();
        assert_eq!(route.route_id, route_id);
        assert!(!route.automatic);
        assert_eq!(route.estimated_distance, 1234.0);
        assert_eq!(route.waypoints[0].lat, 45.02);
        assert_eq!(service.calls.get(), 2);
    }

    #[test]
    fn test_ambiguous_edit_stays_in_edition() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        session.dispatch(Command::EnterEdition).unwrap();
        session.dispatch(Command::MoveWaypoint { from: 1, to: 0 }).unwrap();
        session.dispatch(Command::SetOrigin(Waypoint::new(44.9, 5.0))).unwrap();

        let result = session.dispatch(Command::ConfirmEdition { criterion: None });
        assert!(matches!(result, Err(SessionError::AmbiguousEdit(_))));
        assert_eq!(session.selection().state(), UiState::EditionMode);

        session
            .dispatch(Command::ConfirmEdition {
                criterion: Some(RecomputeCriterion::Distance),
            })
            .unwrap();
        assert_eq!(session.selection().state(), UiState::RouteSelected);
        assert_eq!(session.model().route(0, 0).unwrap().origin.lat, 44.9);
    }

    #[test]
    fn test_service_failure_keeps_edition_open() {
        let service = EchoService::default();
        let mut session = open(MemoryStore::new(), service.clone());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let before = session.model().context().clone();
        session.dispatch(Command::EnterEdition).unwrap();
        session.dispatch(Command::MoveWaypoint { from: 1, to: 0 }).unwrap();

        service.fail.set(true);
        assert!(session.dispatch(Command::ConfirmEdition { criterion: None }).is_err());
        assert_eq!(session.selection().state(), UiState::EditionMode);
        assert_eq!(session.model().context(), &before);
    }

    #[test]
    fn test_cancel_edition_restores_route() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let before = session.model().context().clone();

        session.dispatch(Command::EnterEdition).unwrap();
        session.dispatch(Command::MoveWaypoint { from: 1, to: 0 }).unwrap();
        let outcome = session.dispatch(Command::CancelEdition).unwrap();

        assert_eq!(outcome.view.state, UiState::RouteSelected);
        assert_eq!(session.model().context(), &before);
        let first_pin = session.pipeline().waypoint_markers()[0];
        assert_eq!(
            session.surface().marker(first_pin).unwrap().position,
            LatLng::new(45.01, 5.01)
        );
    }

    #[test]
    fn test_clear_all() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let outcome = session.dispatch(Command::ClearAll).unwrap();
        assert_eq!(outcome.view.state, UiState::Idle);
        assert_eq!(outcome.events, vec![ModelEvent::ContextCleared]);
        assert!(session.surface().markers().is_empty());
    }

    #[test]
    fn test_export_then_import_in_other_session() {
        let mut first = open(MemoryStore::new(), EchoService::default());
        first.dispatch(Command::Compute(request(45.0))).unwrap();
        first.dispatch(Command::Compute(request(46.0))).unwrap();
        let text = first.dispatch(Command::ExportSnapshot).unwrap().exported.unwrap();

        let mut second = open(MemoryStore::new(), EchoService::default());
        second.dispatch(Command::Import { text: text.clone() }).unwrap();
        assert_eq!(second.model().context(), first.model().context());

        let again = second.dispatch(Command::Import { text }).unwrap();
        assert_eq!(second.model().context().len(), 2);
        assert_eq!(again.warnings.len(), 1);
    }

    #[test]
    fn test_malformed_import_is_rejected() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        let result = session.dispatch(Command::Import {
            text: r#"{"routing": {}}"#.to_string(),
        });
        assert!(matches!(result, Err(SessionError::Format { .. })));
        assert!(session.model().context().is_empty());
    }

    #[test]
    fn test_routeless_snapshot_is_rejected() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        let routeless = RoutingEntry::new(request(45.0), Vec::new());
        let text = export_snapshot(&RoutingContext::from_entries(vec![routeless])).unwrap();

        let result = session.dispatch(Command::Import { text });
        assert!(matches!(result, Err(SessionError::Format { .. })));
        assert!(session.model().context().is_empty());
        assert_eq!(session.selection().state(), UiState::Idle);
        assert_eq!(session.model().stats().persisted_writes, 0);
    }

    #[test]
    fn test_reimporting_edited_snapshot_is_noop() {
        let req = request(45.0);
        let route = Route::automatic(req.origin.clone(), req.parameters.waypoints.clone(), Vec::new(), 900.0, 300.0);
        let entry = RoutingEntry::new(req, vec![route.ghost(), route]);
        let text = export_snapshot(&RoutingContext::from_entries(vec![entry])).unwrap();

        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Import { text: text.clone() }).unwrap();
        let before = session.model().context().clone();

        let again = session.dispatch(Command::Import { text }).unwrap();
        assert!(again.events.is_empty());
        assert_eq!(session.model().context(), &before);
        assert_eq!(session.model().context().len(), 1);
        let pointer = session.selection().pointer().unwrap();
        assert!(pointer.is_valid_in(session.model().context()));
    }

    #[test]
    fn test_external_change_is_picked_up() {
        let store = MemoryStore::new();
        let mut a = open(store.clone(), EchoService::default());
        let mut b = open(store, EchoService::default());

        a.dispatch(Command::Compute(request(45.0))).unwrap();
        assert!(a.poll_external().unwrap().is_none());

        let outcome = b.poll_external().unwrap().unwrap();
        assert_eq!(outcome.events, vec![ModelEvent::ExternalReload]);
        assert_eq!(b.model().context(), a.model().context());
        assert_eq!(outcome.view.state, UiState::RouteLoaded);
        assert!(!b.surface().markers().is_empty());
    }

    #[test]
    fn test_tracking_without_source_warns() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        let outcome = session.dispatch(Command::ToggleTracking).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(!session.tracker().is_tracking());
    }

    #[test]
    fn test_tracking_denied_stays_off() {
        let mut session = open(MemoryStore::new(), EchoService::default())
            .with_position_source(Box::new(FakeSource { refuse: true }));
        let outcome = session.dispatch(Command::ToggleTracking).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(!session.tracker().is_tracking());
    }

    #[test]
    fn test_live_leg_drawn_and_removed() {
        let mut session = open(MemoryStore::new(), EchoService::default())
            .with_position_source(Box::new(FakeSource { refuse: false }));
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        session.dispatch(Command::ToggleTracking).unwrap();
        session
            .dispatch(Command::PositionUpdate(PositionFix::new(45.0, 5.0)))
            .unwrap();
        assert_eq!(session.surface().center(), LatLng::new(45.0, 5.0));

        let shapes = session.surface().shapes().len();
        session.dispatch(Command::RequestLiveLeg).unwrap();
        assert_eq!(session.surface().shapes().len(), shapes + 1);

        let outcome = session
            .dispatch(Command::PositionFailed(PositionError::Timeout))
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(!session.tracker().is_tracking());
        assert_eq!(session.surface().shapes().len(), shapes);
    }

    #[test]
    fn test_close_removes_overlays() {
        let mut session = open(MemoryStore::new(), EchoService::default());
        session.dispatch(Command::Compute(request(45.0))).unwrap();
        let surface = session.close();
        assert!(surface.markers().is_empty());
        assert!(surface.shapes().is_empty());
    }
}
