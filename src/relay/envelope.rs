//! Relay Envelopes
//!
//! The request envelope travels over the durable queue to a worker; the
//! response envelope travels back over the point-to-point channel to the
//! listener named in `return_address`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::rate_limit::RateLimitSnapshot;

/// Correlation id linking a request to its response (128-bit random)
pub type CorrelationId = Uuid;

/// Generate a fresh correlation id
pub fn new_correlation_id() -> CorrelationId {
    Uuid::new_v4()
}

/// What a caller wants executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// HTTP method
    pub method: String,

    /// Absolute target URL
    pub target_url: String,

    /// Request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Opaque request body
    #[serde(default)]
    pub body: Vec<u8>,

    /// Explicit bucket id (derived from the route template when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<String>,
}

impl RequestSpec {
    /// Create a request with no headers or body
    pub fn new(method: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target_url: target_url.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            bucket_id: None,
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Pin the request to a bucket
    pub fn with_bucket(mut self, bucket_id: impl Into<String>) -> Self {
        self.bucket_id = Some(bucket_id.into());
        self
    }
}

/// Unit placed on the queue; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id
    pub correlation_id: CorrelationId,

    /// Bucket the request was admitted on
    pub bucket_id: String,

    /// HTTP method
    pub method: String,

    /// Absolute target URL
    pub target_url: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// Opaque request body
    pub body: Vec<u8>,

    /// host:port of the listener that must receive the result
    pub return_address: String,

    /// Enqueue timestamp
    pub enqueued_at: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Build an envelope from a request spec
    pub fn new(
        correlation_id: CorrelationId,
        bucket_id: String,
        spec: RequestSpec,
        return_address: String,
    ) -> Self {
        Self {
            correlation_id,
            bucket_id,
            method: spec.method,
            target_url: spec.target_url,
            headers: spec.headers,
            body: spec.body,
            return_address,
            enqueued_at: Utc::now(),
        }
    }

    /// Queue representation (JSON)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the queue representation
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outcome class of an executed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Remote call succeeded
    Success,
    /// Remote call failed
    Failure,
    /// Remote API rate limited the call
    RateLimited,
}

/// Unit sent back over the point-to-point channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id of the originating request
    pub correlation_id: CorrelationId,

    /// Outcome class
    pub status: ResponseStatus,

    /// HTTP status code, if the remote answered
    #[serde(default)]
    pub http_status: Option<u16>,

    /// Response body (success)
    #[serde(default)]
    pub payload: Option<Vec<u8>>,

    /// Error description (failure / rate limited)
    #[serde(default)]
    pub error_detail: Option<String>,

    /// Retry hint reported with a rate-limited status
    #[serde(default)]
    pub retry_after_ms: Option<u64>,

    /// Limits observed on the remote call
    #[serde(default)]
    pub rate_limit_snapshot: Option<RateLimitSnapshot>,
}

impl ResponseEnvelope {
    /// Successful response
    pub fn success(correlation_id: CorrelationId, http_status: u16, payload: Vec<u8>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Success,
            http_status: Some(http_status),
            payload: Some(payload),
            error_detail: None,
            retry_after_ms: None,
            rate_limit_snapshot: None,
        }
    }

    /// Failed response
    pub fn failure(
        correlation_id: CorrelationId,
        http_status: Option<u16>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Failure,
            http_status,
            payload: None,
            error_detail: Some(detail.into()),
            retry_after_ms: None,
            rate_limit_snapshot: None,
        }
    }

    /// Rate-limited response
    pub fn rate_limited(correlation_id: CorrelationId, retry_after: Option<Duration>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::RateLimited,
            http_status: Some(429),
            payload: None,
            error_detail: Some("rate limited by remote".to_string()),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            rate_limit_snapshot: None,
        }
    }

    /// Attach the limits observed on the remote call
    pub fn with_snapshot(mut self, snapshot: Option<RateLimitSnapshot>) -> Self {
        self.rate_limit_snapshot = snapshot;
        self
    }

    /// Convert into the caller-facing result
    pub fn into_result(self) -> Result<Response> {
        match self.status {
            ResponseStatus::Success => Ok(Response {
                correlation_id: self.correlation_id,
                http_status: self.http_status.unwrap_or(200),
                body: self.payload.unwrap_or_default(),
                rate_limit: self.rate_limit_snapshot,
            }),
            ResponseStatus::Failure => Err(RelayError::RemoteFailure {
                status_code: self.http_status,
                detail: self
                    .error_detail
                    .unwrap_or_else(|| "unknown remote failure".to_string()),
            }),
            ResponseStatus::RateLimited => Err(RelayError::RemoteRateLimited {
                retry_after: self.retry_after_ms.map(Duration::from_millis),
            }),
        }
    }
}

/// Settled response handed back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id
    pub correlation_id: CorrelationId,

    /// HTTP status code
    pub http_status: u16,

    /// Response body
    pub body: Vec<u8>,

    /// Limits observed on the remote call
    pub rate_limit: Option<RateLimitSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_from_spec() {
        let id = new_correlation_id();
        let spec = RequestSpec::new("POST", "https://api.test/channels/1/messages")
            .with_header("Content-Type", "application/json")
            .with_body(b"{}".to_vec());

        let envelope = RequestEnvelope::new(
            id,
            "POST /channels/1/messages".to_string(),
            spec,
            "10.0.0.5:7450".to_string(),
        );

        assert_eq!(envelope.correlation_id, id);
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.body, b"{}");
        assert_eq!(envelope.return_address, "10.0.0.5:7450");

        let parsed = RequestEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_malformed_request_bytes() {
        let err = RequestEnvelope::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_success_into_response() {
        let id = new_correlation_id();
        let response = ResponseEnvelope::success(id, 201, b"ok".to_vec())
            .into_result()
            .unwrap();
        assert_eq!(response.http_status, 201);
        assert_eq!(response.body, b"ok");
    }

    #[test]
    fn test_failure_into_remote_failure() {
        let err = ResponseEnvelope::failure(new_correlation_id(), Some(404), "Not Found")
            .into_result()
            .unwrap_err();
        match err {
            RelayError::RemoteFailure { status_code, detail } => {
                assert_eq!(status_code, Some(404));
                assert_eq!(detail, "Not Found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limited_into_error() {
        let err = ResponseEnvelope::rate_limited(new_correlation_id(), Some(Duration::from_millis(1500)))
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::RemoteRateLimited { retry_after: Some(d) } if d == Duration::from_millis(1500)
        ));
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
