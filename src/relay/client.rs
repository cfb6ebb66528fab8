//! Relay Client
//!
//! Hands request envelopes to the durable queue. Delivery is at-least-once
//! and unordered; the client only reports whether the transport accepted the
//! bytes.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::envelope::RequestEnvelope;
use crate::error::{RelayError, Result};
use crate::metrics;

/// Opaque publish channel to the queue
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publish one message; `Ok` means the queue acknowledged it
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Transport name for logs
    fn name(&self) -> &str;
}

/// In-process bounded queue
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<Vec<u8>>,
}

impl ChannelTransport {
    /// Create a queue holding up to `capacity` messages
    ///
    /// Returns the transport and the consuming half for a worker.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl QueueTransport for ChannelTransport {
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| anyhow!("queue consumer has shut down"))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Queue reached through an HTTP ingest endpoint
#[derive(Debug, Clone)]
pub struct HttpQueueTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpQueueTransport {
    /// Create a transport posting to `endpoint`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build queue HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Endpoint messages are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl QueueTransport for HttpQueueTransport {
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach queue at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("queue at {} rejected message: {}", self.endpoint, status));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Relay client
#[derive(Clone)]
pub struct RelayClient {
    transport: Arc<dyn QueueTransport>,
}

impl RelayClient {
    /// Create a client over `transport`
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    /// Publish `envelope` to the queue
    ///
    /// # Errors
    ///
    /// [`RelayError::RelayUnavailable`] if the envelope cannot be encoded or
    /// the transport rejects it.
    pub async fn send(&self, envelope: &RequestEnvelope) -> Result<()> {
        let payload = envelope
            .to_bytes()
            .map_err(|e| RelayError::RelayUnavailable(format!("encode failed: {}", e)))?;

        match self.transport.publish(payload).await {
            Ok(()) => {
                debug!(
                    "Relayed {} via {} transport",
                    envelope.correlation_id,
                    self.transport.name()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Relay of {} via {} transport failed: {:#}",
                    envelope.correlation_id,
                    self.transport.name(),
                    e
                );
                metrics::RELAY_SEND_FAILURES_TOTAL.inc();
                Err(RelayError::RelayUnavailable(format!("{:#}", e)))
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("transport", &self.transport.name())
            .finish()
    }
}
