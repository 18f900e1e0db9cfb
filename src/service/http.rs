//! HTTP client for the route computation service.
//!
//! - Optional Basic authentication from an API key
//! - Automatic retry with exponential backoff on 429 and transport errors
//! - A blocking [`RoutingService`] implementation driven by its own runtime

use std::time::{Duration, Instant};

use base64::Engine;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::runtime::Runtime;

use super::RoutingService;
use crate::error::{Result, SessionError};
use crate::{RoutingContext, RoutingRequest};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_error(message: impl Into<String>, status_code: Option<u16>) -> SessionError {
    SessionError::Http {
        message: message.into(),
        status_code,
    }
}

/// Backoff before retry number `attempt` (1-based): 500ms, 1s, 2s, 4s...
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1 << attempt.saturating_sub(1).min(4)))
}

/// Route computation service reached over HTTP.
pub struct HttpRoutingService {
    client: Client,
    endpoint: String,
    auth_header: Option<String>,
    runtime: Runtime,
}

impl HttpRoutingService {
    /// Create a client posting requests to `endpoint`.
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
        let auth_header = api_key.map(|key| {
            let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", key));
            format!("Basic {}", auth)
        });

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| http_error(format!("Failed to create HTTP client: {}", e), None))?;

        let runtime = Runtime::new()
            .map_err(|e| http_error(format!("Failed to create runtime: {}", e), None))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            auth_header,
            runtime,
        })
    }

    /// Compute one request.
    pub async fn compute_async(&self, request: &RoutingRequest) -> Result<RoutingContext> {
        let start = Instant::now();
        let mut retries = 0;

        loop {
            let mut builder = self.client.post(&self.endpoint).json(request);
            if let Some(auth) = &self.auth_header {
                builder = builder.header("Authorization", auth);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(http_error("Max retries exceeded (429)", Some(429)));
                        }
                        let wait = backoff(retries);
                        warn!(
                            "[RoutingService] 429 for {}, retry {} after {:?}",
                            request.request_id, retries, wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    if !status.is_success() {
                        return Err(http_error(
                            status.canonical_reason().unwrap_or("request failed"),
                            Some(status.as_u16()),
                        ));
                    }

                    let context = resp
                        .json::<RoutingContext>()
                        .await
                        .map_err(|e| http_error(format!("Parse error: {}", e), Some(status.as_u16())))?;
                    info!(
                        "[RoutingService] Computed {} in {:.2}s ({} entries)",
                        request.request_id,
                        start.elapsed().as_secs_f64(),
                        context.len()
                    );
                    return Ok(context);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(http_error(
                            format!("Request error: {}", e),
                            e.status().map(|s| s.as_u16()),
                        ));
                    }
                    let wait = backoff(retries);
                    warn!(
                        "[RoutingService] Error for {}: {}, retry {} after {:?}",
                        request.request_id, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Compute several requests concurrently, results in input order.
    pub async fn compute_many(&self, requests: &[RoutingRequest]) -> Vec<Result<RoutingContext>> {
        debug!("[RoutingService] Computing {} requests", requests.len());
        futures::future::join_all(requests.iter().map(|r| self.compute_async(r))).await
    }
}

impl RoutingService for HttpRoutingService {
    fn compute(&self, request: &RoutingRequest) -> Result<RoutingContext> {
        self.runtime.block_on(self.compute_async(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(1000));
        assert_eq!(backoff(3), Duration::from_millis(2000));
        assert_eq!(backoff(10), Duration::from_millis(8000));
    }

    #[test]
    fn test_api_key_becomes_basic_auth() {
        let service = HttpRoutingService::new("http://127.0.0.1:9/route", Some("secret")).unwrap();
        // base64("API_KEY:secret")
        assert_eq!(
            service.auth_header.as_deref(),
            Some("Basic QVBJX0tFWTpzZWNyZXQ=")
        );

        let anonymous = HttpRoutingService::new("http://127.0.0.1:9/route", None).unwrap();
        assert!(anonymous.auth_header.is_none());
    }

    #[test]
    fn test_unreachable_endpoint_reports_error() {
        let service = HttpRoutingService::new("http://127.0.0.1:9/route", None).unwrap();
        let request = RoutingRequest::new(
            "route",
            crate::Waypoint::new(45.0, 5.0),
            vec![crate::Waypoint::new(45.1, 5.1)],
        );
        assert!(matches!(
            service.compute(&request),
            Err(SessionError::Http { .. })
        ));
    }
}
