//! Import/export of routing files.
//!
//! An accepted file matches exactly one key shape:
//! - a route computation request: `type`, `origin`, `parameters`, optional `avoidZones`
//! - a routing snapshot: a `routing` key holding a context-compatible array
//!
//! Anything else is a format error and leaves the context untouched.

use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::error::{OptionExt, Result, SessionError};
use crate::{RoutingContext, RoutingEntry, RoutingRequest};

const REQUEST_KEYS: [&str; 3] = ["type", "origin", "parameters"];
const SNAPSHOT_KEY: &str = "routing";

/// A parsed import file.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportPayload {
    /// A request to send to the route computation service
    Request(RoutingRequest),
    /// Previously computed entries, merged as-is
    Snapshot(Vec<RoutingEntry>),
}

#[derive(Serialize)]
struct Snapshot<'a> {
    routing: &'a RoutingContext,
}

fn format_error(message: impl Into<String>) -> SessionError {
    SessionError::Format {
        message: message.into(),
    }
}

/// Parse an import file.
pub fn parse_import(text: &str) -> Result<ImportPayload> {
    let value: Value = serde_json::from_str(text).map_err(|e| format_error(e.to_string()))?;
    let object = value.as_object().ok_or_format("expected a JSON object")?;

    let is_request = REQUEST_KEYS.iter().all(|k| object.contains_key(*k));
    let is_snapshot = object.contains_key(SNAPSHOT_KEY);

    match (is_request, is_snapshot) {
        (true, false) => {
            let mut request: RoutingRequest = serde_json::from_value(value)
                .map_err(|e| format_error(format!("invalid request: {}", e)))?;
            request.ensure_request_id();
            debug!("[Import] Parsed request {}", request.request_id);
            Ok(ImportPayload::Request(request))
        }
        (false, true) => {
            let routing = object
                .get(SNAPSHOT_KEY)
                .cloned()
                .ok_or_format("missing routing key")?;
            if !routing.is_array() {
                return Err(format_error("'routing' must be an array"));
            }
            let context: RoutingContext = serde_json::from_value(routing)
                .map_err(|e| format_error(format!("invalid routing snapshot: {}", e)))?;
            if let Some(index) = context.entries().iter().position(|e| e.routes().is_empty()) {
                return Err(format_error(format!(
                    "snapshot entry {} has no route",
                    index
                )));
            }
            debug!("[Import] Parsed snapshot with {} entries", context.len());
            Ok(ImportPayload::Snapshot(context.into_entries()))
        }
        (true, true) => Err(format_error(
            "file matches both the request and the snapshot shape",
        )),
        (false, false) => Err(format_error(
            "expected either a request (type, origin, parameters) or a 'routing' snapshot",
        )),
    }
}

/// Serialize the whole context as a snapshot file.
pub fn export_snapshot(context: &RoutingContext) -> Result<String> {
    serde_json::to_string_pretty(&Snapshot { routing: context })
        .map_err(|e| format_error(e.to_string()))
}

/// Serialize the request of an entry, so it can be recomputed elsewhere.
pub fn export_request(entry: &RoutingEntry) -> Result<String> {
    serde_json::to_string_pretty(&entry.request).map_err(|e| format_error(e.to_string()))
}
