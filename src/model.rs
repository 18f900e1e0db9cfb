//! # Routing Context Model
//!
//! In-memory mirror of every known route computation, and the only writer of
//! the [`RoutingContext`].
//!
//! New data reaches the model from three places:
//! - a route computation service response
//! - an imported file
//! - another instance writing to the shared store
//!
//! The first two go through [`RoutingModel::merge_incoming`], the last one
//! through [`RoutingModel::reload_external`], which always reloads the whole
//! record and diffs it, since notifications may arrive out of order with
//! respect to this instance's own writes.

use log::{debug, error, info, warn};

use crate::error::{OptionExt, Result, SessionError};
use crate::store::{ContextStore, ExternalChangeHandle, SessionMeta, LATEST_KEY};
use crate::{Route, RoutingContext, RoutingEntry, SelectionPointer, Waypoint, ESTIMATE_PENDING};

/// Model events for notifying read-only consumers of changes
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Entries were added, removed or edited locally
    ContextChanged,
    /// The whole context was cleared
    ContextCleared,
    /// Another instance wrote a different context and it was reloaded
    ExternalReload,
}

/// Result of merging a batch of incoming entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub changed: bool,
    /// Indices (into the merged context) of the appended entries
    pub appended: Vec<usize>,
    /// Number of incoming entries dropped as duplicates
    pub duplicates: usize,
    /// Number of incoming entries refused because they carry no route
    pub rejected: usize,
}

/// Model statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub entry_count: u32,
    pub route_count: u32,
    pub ghost_count: u32,
    pub automatic_count: u32,
    pub persisted_writes: u32,
}

/// The routing context model.
pub struct RoutingModel {
    store: Box<dyn ContextStore>,
    context: RoutingContext,
    session_id: Option<String>,
    /// Identifies this open instance in the store metadata
    writer: String,
    app_name: String,
    reuse_session: bool,
    events: Vec<ModelEvent>,
    persisted_writes: u32,
}

impl RoutingModel {
    /// Create a model over `store`. Nothing is loaded until [`startup`](Self::startup).
    pub fn new(store: Box<dyn ContextStore>, app_name: &str) -> Self {
        Self {
            store,
            context: RoutingContext::new(),
            session_id: None,
            writer: uuid::Uuid::new_v4().to_string(),
            app_name: app_name.to_string(),
            reuse_session: false,
            events: Vec::new(),
            persisted_writes: 0,
        }
    }

    /// Reuse the session id found in the store instead of minting one.
    pub fn with_session_reuse(mut self, reuse: bool) -> Self {
        self.reuse_session = reuse;
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resolve the session identity and load the persisted context.
    ///
    /// An empty store yields an empty context, not an error.
    pub fn startup(&mut self) -> Result<&RoutingContext> {
        let existing = self.store.read_meta()?;
        let session_id = match existing {
            Some(meta) if self.reuse_session => {
                debug!("[RoutingModel] Reusing session {}", meta.session_id);
                meta.session_id
            }
            _ => uuid::Uuid::new_v4().to_string(),
        };

        self.context = self.store.load(LATEST_KEY)?.unwrap_or_default();
        info!(
            "[RoutingModel] Started session {} with {} entries",
            session_id,
            self.context.len()
        );
        self.session_id = Some(session_id);
        Ok(&self.context)
    }

    /// Session identity, once [`startup`](Self::startup) ran.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Writer token of this instance, distinct even when the session is reused.
    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// Subscribe to writes made by other instances.
    pub fn watch(&self, interval: std::time::Duration) -> Result<ExternalChangeHandle> {
        self.require_session()?;
        self.store.watch(&self.writer, interval)
    }

    fn require_session(&self) -> Result<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| SessionError::Persistence {
                message: "session not started".to_string(),
            })
    }

    fn meta(&self) -> Result<SessionMeta> {
        Ok(SessionMeta::now(self.require_session()?, &self.app_name).with_writer(&self.writer))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn context(&self) -> &RoutingContext {
        &self.context
    }

    pub fn route(&self, index1: usize, index2: usize) -> Option<&Route> {
        self.context.route(index1, index2)
    }

    /// Locate an existing computation for `request_id`.
    ///
    /// Returns the pointer to the automatic variant of the first matching
    /// entry (or its first variant if none is automatic), so an import can
    /// jump straight to it instead of recomputing.
    pub fn is_request_already_handled(&self, request_id: &str) -> Option<SelectionPointer> {
        self.context
            .entries()
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.request.request_id == request_id)
            .map(|(index1, entry)| {
                SelectionPointer::new(index1, entry.automatic_index().unwrap_or(0))
            })
    }

    /// Take the events accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stats(&self) -> SessionStats {
        let routes = self.context.entries().iter().flat_map(|e| e.routes());
        let (mut route_count, mut ghost_count, mut automatic_count) = (0, 0, 0);
        for route in routes {
            route_count += 1;
            if route.is_ghost() {
                ghost_count += 1;
            }
            if route.automatic {
                automatic_count += 1;
            }
        }
        SessionStats {
            entry_count: self.context.len() as u32,
            route_count,
            ghost_count,
            automatic_count,
            persisted_writes: self.persisted_writes,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Merge entries from the service or an import.
    ///
    /// An incoming entry is dropped when an existing entry has the same
    /// `requestId` and either its first route is still automatic or it holds
    /// exactly the same route ids. A manually edited entry never absorbs a new
    /// computation, but re-importing it is a no-op. Entries without routes are
    /// refused. Idempotent.
    pub fn merge_incoming(&mut self, incoming: Vec<RoutingEntry>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for mut entry in incoming {
            if entry.routes().is_empty() {
                warn!(
                    "[RoutingModel] Refusing entry {} without routes",
                    entry.request.request_id
                );
                outcome.rejected += 1;
                continue;
            }

            entry.request.ensure_request_id();
            let duplicate = self.context.entries().iter().any(|existing| {
                existing.request.request_id == entry.request.request_id
                    && (existing.is_untouched() || same_routes(existing, &entry))
            });

            if duplicate {
                debug!(
                    "[RoutingModel] Dropping duplicate request {}",
                    entry.request.request_id
                );
                outcome.duplicates += 1;
                continue;
            }

            let automatic = entry.response.routes.iter().filter(|r| r.automatic).count();
            if automatic > 1 {
                warn!(
                    "[RoutingModel] Entry {} has {} automatic routes, keeping the first",
                    entry.request.request_id, automatic
                );
                let first = entry.automatic_index();
                for (i, route) in entry.response.routes.iter_mut().enumerate() {
                    route.automatic = Some(i) == first;
                }
            }

            self.context.entries_mut().push(entry);
            outcome.appended.push(self.context.len() - 1);
        }

        outcome.changed = !outcome.appended.is_empty();
        if outcome.changed {
            info!(
                "[RoutingModel] Merged {} entries ({} duplicates dropped)",
                outcome.appended.len(),
                outcome.duplicates
            );
            self.events.push(ModelEvent::ContextChanged);
        }
        outcome
    }

    /// Write the context to the store and update the session metadata.
    ///
    /// On failure nothing is considered written and the caller must not
    /// render as if it were durable.
    pub fn persist(&mut self) -> Result<()> {
        let meta = self.meta()?;
        match self.store.save(LATEST_KEY, &self.context, &meta) {
            Ok(written) => {
                self.persisted_writes += 1;
                debug!(
                    "[RoutingModel] Persisted {} entries at {}",
                    self.context.len(),
                    written.timestamp
                );
                Ok(())
            }
            Err(e) => {
                error!("[RoutingModel] Persist failed: {}", e);
                Err(e)
            }
        }
    }

    /// Put back a context captured before a mutation whose persist failed.
    pub(crate) fn restore(&mut self, context: RoutingContext) {
        if context != self.context {
            warn!("[RoutingModel] Rolling back unpersisted change");
            self.context = context;
        }
    }

    /// Reload from the store after another instance wrote to it.
    ///
    /// Returns whether the in-memory context changed.
    pub fn reload_external(&mut self) -> Result<bool> {
        let stored = self.store.load(LATEST_KEY).map_err(|e| {
            error!("[RoutingModel] External reload failed: {}", e);
            e
        })?;
        let stored = stored.unwrap_or_default();
        if stored == self.context {
            debug!("[RoutingModel] External change carried no difference");
            return Ok(false);
        }

        info!(
            "[RoutingModel] Reloaded external context ({} -> {} entries)",
            self.context.len(),
            stored.len()
        );
        self.context = stored;
        self.events.push(ModelEvent::ExternalReload);
        Ok(true)
    }

    /// Delete one route variant. The entry goes away with its last variant.
    pub fn delete_route(&mut self, index1: usize, index2: usize) -> Result<Route> {
        self.context.route(index1, index2).ok_or_selection(index1, index2)?;

        let entries = self.context.entries_mut();
        let removed = entries[index1].response.routes.remove(index2);
        if entries[index1].response.routes.is_empty() {
            entries.remove(index1);
        }
        info!("[RoutingModel] Deleted route {}", removed.route_id);
        self.events.push(ModelEvent::ContextChanged);
        Ok(removed)
    }

    /// Delete a whole entry.
    pub fn delete_entry(&mut self, index1: usize) -> Result<RoutingEntry> {
        if index1 >= self.context.len() {
            return Err(SessionError::InvalidSelection { index1, index2: 0 });
        }
        let removed = self.context.entries_mut().remove(index1);
        info!(
            "[RoutingModel] Deleted entry {}",
            removed.request.request_id
        );
        self.events.push(ModelEvent::ContextChanged);
        Ok(removed)
    }

    /// Clear the context and the persisted record.
    ///
    /// The in-memory context is only cleared once the store accepted it.
    pub fn clear(&mut self) -> Result<()> {
        let meta = self.meta()?;
        self.store.clear(LATEST_KEY, &meta)?;
        self.context = RoutingContext::new();
        self.persisted_writes += 1;
        info!("[RoutingModel] Cleared context");
        self.events.push(ModelEvent::ContextCleared);
        Ok(())
    }

    /// Append a ghost copy of a route to the same entry, for customization
    /// before the service confirms it. Returns the pointer to the ghost.
    pub fn duplicate_route(&mut self, index1: usize, index2: usize) -> Result<SelectionPointer> {
        let ghost = self
            .context
            .route(index1, index2)
            .ok_or_selection(index1, index2)?
            .ghost();
        debug!("[RoutingModel] Created ghost route {}", ghost.route_id);

        let routes = &mut self.context.entries_mut()[index1].response.routes;
        routes.push(ghost);
        let pointer = SelectionPointer::new(index1, routes.len() - 1);
        self.events.push(ModelEvent::ContextChanged);
        Ok(pointer)
    }

    /// Store an edited origin and visiting order on a variant.
    ///
    /// The variant becomes manual and its estimates pending until confirmed.
    pub fn apply_edit(
        &mut self,
        index1: usize,
        index2: usize,
        origin: Waypoint,
        waypoints: Vec<Waypoint>,
    ) -> Result<()> {
        let route = self
            .context
            .route_mut(index1, index2)
            .ok_or_selection(index1, index2)?;
        route.origin = origin;
        route.waypoints = waypoints;
        route.automatic = false;
        route.estimated_distance = ESTIMATE_PENDING;
        route.estimated_time = ESTIMATE_PENDING;
        self.events.push(ModelEvent::ContextChanged);
        Ok(())
    }

    /// Apply a service result to an existing variant, keeping its `routeId`.
    pub fn confirm_route(&mut self, index1: usize, index2: usize, computed: &Route) -> Result<()> {
        let route = self
            .context
            .route_mut(index1, index2)
            .ok_or_selection(index1, index2)?;
        route.origin = computed.origin.clone();
        route.waypoints = computed.waypoints.clone();
        route.paths = computed.paths.clone();
        route.estimated_distance = computed.estimated_distance;
        route.estimated_time = computed.estimated_time;
        info!(
            "[RoutingModel] Confirmed route {} ({:.0} m)",
            route.route_id, route.estimated_distance
        );
        self.events.push(ModelEvent::ContextChanged);
        Ok(())
    }
}

/// Whether two entries hold the same route variants, by id and order.
fn same_routes(a: &RoutingEntry, b: &RoutingEntry) -> bool {
    a.routes()
        .iter()
        .map(|r| &r.route_id)
        .eq(b.routes().iter().map(|r| &r.route_id))
}
