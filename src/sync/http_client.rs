//! HTTP client for the paginated upstream API
//!
//! This module defines the `UpstreamSource` seam synchronizers fetch pages
//! through and a reqwest-based implementation that maps HTTP failures onto
//! `SyncError` so the rate limiter can tell rate limits from other errors.

use crate::config::UpstreamConfig;
use crate::error::SyncError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameters of one page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Index of the first item
    pub offset: usize,
    /// Maximum number of items
    pub limit: usize,
    /// Year filter for year-scoped resources
    pub year: Option<i32>,
}

impl PageRequest {
    /// First page with the given size
    pub fn first(limit: usize, year: Option<i32>) -> Self {
        Self {
            offset: 0,
            limit,
            year,
        }
    }

    /// Request for the page following one that returned `received` items
    pub fn next(&self, received: usize) -> Self {
        Self {
            offset: self.offset + received,
            ..*self
        }
    }
}

/// One page of upstream items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Raw items
    pub items: Vec<Value>,
    /// Whether another page follows
    pub has_more: bool,
}

/// Paginated upstream data source
///
/// Implementations must be safe to call repeatedly with the same request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch one page of a resource
    async fn fetch_page(&self, resource: &str, request: &PageRequest) -> Result<Page, SyncError>;
}

/// reqwest-based upstream client
///
/// Sends `GET {base_url}/{resource}?offset=..&limit=..[&year=..]` with an
/// optional bearer token.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    rate_limit_wait_secs: u64,
}

impl UpstreamClient {
    /// Create a new upstream client
    pub fn new(config: &UpstreamConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config))
    }

    /// Create an upstream client with a custom reqwest Client
    pub fn with_client(client: Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            rate_limit_wait_secs: config.rate_limit_wait_secs,
        }
    }

    fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }
}

#[async_trait]
impl UpstreamSource for UpstreamClient {
    async fn fetch_page(&self, resource: &str, request: &PageRequest) -> Result<Page, SyncError> {
        let url = self.resource_url(resource);

        let mut query = vec![
            ("offset", request.offset.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(year) = request.year {
            query.push(("year", year.to_string()));
        }

        let mut builder = self.client.get(&url).query(&query);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        debug!(
            url = %url,
            offset = request.offset,
            limit = request.limit,
            "Fetching upstream page"
        );

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::NetworkTimeout
            } else if e.is_connect() {
                SyncError::ConnectionRefused
            } else {
                SyncError::Network(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| SyncError::InvalidData(format!("Malformed body: {}", e)))?;
                parse_page(body, request.limit)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                // Handle rate limiting with Retry-After header
                let wait = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(self.rate_limit_wait_secs);

                warn!(url = %url, retry_after = wait, "Rate limited by upstream");
                Err(SyncError::RateLimited(wait))
            }
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "Resource not found (404)");
                Err(SyncError::NotFound)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(url = %url, status = ?response.status(), "Unauthorized");
                Err(SyncError::Unauthorized)
            }
            status => {
                warn!(url = %url, status = status.as_u16(), "Unexpected status");
                Err(SyncError::ServerError(status.as_u16()))
            }
        }
    }
}

/// Accept `{"items": [...], "has_more": bool}` or a bare array
///
/// Without an explicit flag, a full page means another one may follow.
fn parse_page(body: Value, limit: usize) -> Result<Page, SyncError> {
    match body {
        Value::Array(items) => {
            let has_more = items.len() >= limit;
            Ok(Page { items, has_more })
        }
        Value::Object(mut obj) => {
            let items = match obj.remove("items") {
                Some(Value::Array(items)) => items,
                Some(_) => {
                    return Err(SyncError::InvalidData(
                        "\"items\" is not an array".to_string(),
                    ))
                }
                None => return Err(SyncError::InvalidData("Missing \"items\"".to_string())),
            };
            let has_more = obj
                .get("has_more")
                .and_then(Value::as_bool)
                .unwrap_or(items.len() >= limit);
            Ok(Page { items, has_more })
        }
        _ => Err(SyncError::InvalidData(
            "Expected an object or an array".to_string(),
        )),
    }
}
