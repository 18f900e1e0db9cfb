//! Route computation service contract.
//!
//! The session only depends on the result shape: a successful computation
//! yields a context-compatible array that is fed through
//! [`RoutingModel::merge_incoming`](crate::model::RoutingModel::merge_incoming).
//! A failed computation must not mutate the context.

use log::warn;

use crate::error::{Result, SessionError};
use crate::{RoutingContext, RoutingEntry, RoutingRequest};

#[cfg(feature = "http")]
pub mod http;

/// Computes routes for a request.
pub trait RoutingService {
    fn compute(&self, request: &RoutingRequest) -> Result<RoutingContext>;
}

/// Check a service result before it reaches the model.
///
/// Entries without routes are rejected; entries without a request id inherit
/// the id of the request that produced them.
pub fn accept_response(request: &RoutingRequest, response: RoutingContext) -> Result<Vec<RoutingEntry>> {
    if response.is_empty() {
        return Err(SessionError::Http {
            message: "service returned no routing entry".to_string(),
            status_code: None,
        });
    }

    let mut entries = response.into_entries();
    for entry in entries.iter_mut() {
        if entry.response.routes.is_empty() {
            return Err(SessionError::Http {
                message: format!("entry {} has no route", entry.request.request_id),
                status_code: None,
            });
        }
        if entry.request.request_id.is_empty() {
            entry.request.request_id = request.request_id.clone();
        }
        for route in &entry.response.routes {
            if route.paths.iter().any(|p| !p.is_valid()) {
                warn!(
                    "[RoutingService] Route {} has invalid path coordinates",
                    route.route_id
                );
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Route, Waypoint};

    fn request() -> RoutingRequest {
        RoutingRequest::new("route", Waypoint::new(45.0, 5.0), vec![Waypoint::new(45.1, 5.1)])
    }

    #[test]
    fn test_empty_response_is_rejected() {
        assert!(accept_response(&request(), RoutingContext::new()).is_err());
    }

    #[test]
    fn test_missing_request_id_is_inherited() {
        let req = request();
        let mut inner = req.clone();
        inner.request_id.clear();
        let route = Route::automatic(req.origin.clone(), Vec::new(), Vec::new(), 10.0, 5.0);
        let response = RoutingContext::from_entries(vec![RoutingEntry::new(inner, vec![route])]);

        let entries = accept_response(&req, response).unwrap();
        assert_eq!(entries[0].request.request_id, req.request_id);
    }

    #[test]
    fn test_entry_without_routes_is_rejected() {
        let req = request();
        let response = RoutingContext::from_entries(vec![RoutingEntry::new(req.clone(), Vec::new())]);
        assert!(accept_response(&req, response).is_err());
    }
}
