//! External API client for form submissions to remote management APIs.
//!
//! No retries: a transport failure is returned as an `Http` error and halts the
//! step. HTTP error statuses come back as an [`ApiResponse`] so the caller
//! decides what they mean.

use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::ProvisionError;

/// Decoded response. Bodies that are not JSON are kept as a string value.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// Whether any string in the body mentions `needle`.
    pub fn body_mentions(&self, needle: &str) -> bool {
        value_mentions(&self.body, needle)
    }
}

fn value_mentions(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items.iter().any(|item| value_mentions(item, needle)),
        Value::Object(map) => map.values().any(|item| value_mentions(item, needle)),
        _ => false,
    }
}

/// Abstraction over HTTP so steps can run against scripted fakes.
pub trait ApiClient {
    /// POST `fields` as `application/x-www-form-urlencoded` to `endpoint`,
    /// with `query` appended to the URL.
    fn submit_form(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        fields: &[(&str, &str)],
    ) -> Result<ApiResponse>;
}

/// Blocking client backed by `ureq`.
pub struct UreqApiClient {
    agent: ureq::Agent,
}

impl UreqApiClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl ApiClient for UreqApiClient {
    #[instrument(skip_all, fields(endpoint))]
    fn submit_form(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        fields: &[(&str, &str)],
    ) -> Result<ApiResponse> {
        let mut request = self.agent.post(endpoint);
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = match request.send_form(fields) {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(ProvisionError::Http {
                    endpoint: endpoint.to_string(),
                    reason: transport.to_string(),
                }
                .into());
            }
        };
        let status = response.status();
        let text = response.into_string().map_err(|err| ProvisionError::Http {
            endpoint: endpoint.to_string(),
            reason: format!("read body: {err}"),
        })?;
        debug!(status, bytes = text.len(), "response received");
        Ok(ApiResponse {
            status,
            body: decode_body(&text),
        })
    }
}

/// Decode permissively: JSON when possible, otherwise the raw text.
pub fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
