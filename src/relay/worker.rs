//! Reference Worker
//!
//! Consumes request envelopes from the queue, executes them against the
//! remote API, feeds observed limits back into the bucket store and sends
//! the response envelope to the caller's return address.
//!
//! ```text
//!   queue ──► Worker::process ──► RequestExecutor (HTTP)
//!                  │                     │
//!                  │        rate-limit headers ──► BucketStore (best effort)
//!                  ▼
//!            ResponseSender ──TCP frames──► ResponseListener
//! ```

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::write_frame;
use super::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{RelayError, Result};
use crate::rate_limit::bucket::retry_after_from_headers;
use crate::rate_limit::{apply_limits_best_effort, BucketStore, RateLimitSnapshot};

/// Default connect timeout for response connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of envelopes a worker executes at once
pub const DEFAULT_WORKER_CONCURRENCY: usize = 32;

/// Raw result of executing a request
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Vec<u8>,
}

/// Performs the remote call described by an envelope
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Execute `request`; `Err` means no response was obtained
    async fn execute(&self, request: &RequestEnvelope) -> anyhow::Result<ExecutedResponse>;
}

/// `reqwest` based executor
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Create an executor with a per-request timeout
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP executor client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &RequestEnvelope) -> anyhow::Result<ExecutedResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method {}", request.method))?;

        let mut builder = self.client.request(method, &request.target_url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", request.target_url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .context("Failed to read response body")?
            .to_vec();

        Ok(ExecutedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Writes framed response envelopes to a return address
#[derive(Debug, Clone)]
pub struct ResponseSender {
    connect_timeout: Duration,
}

impl Default for ResponseSender {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ResponseSender {
    /// Create a sender with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Send one envelope
    pub async fn send(&self, return_address: &str, envelope: &ResponseEnvelope) -> Result<()> {
        self.send_batch(return_address, std::slice::from_ref(envelope))
            .await
    }

    /// Send several envelopes over one connection
    pub async fn send_batch(
        &self,
        return_address: &str,
        envelopes: &[ResponseEnvelope],
    ) -> Result<()> {
        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(return_address))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(RelayError::Network(format!(
                        "failed to connect to {}: {}",
                        return_address, e
                    )))
                }
                Err(_) => {
                    return Err(RelayError::Network(format!(
                        "connect to {} timed out after {:?}",
                        return_address, self.connect_timeout
                    )))
                }
            };

        for envelope in envelopes {
            write_frame(&mut stream, envelope).await?;
        }
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Executes queued envelopes and reports results back
#[derive(Clone)]
pub struct Worker {
    executor: Arc<dyn RequestExecutor>,
    store: Arc<dyn BucketStore>,
    sender: ResponseSender,
    concurrency: usize,
}

impl Worker {
    /// Create a worker
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        store: Arc<dyn BucketStore>,
        sender: ResponseSender,
    ) -> Self {
        Self {
            executor,
            store,
            sender,
            concurrency: DEFAULT_WORKER_CONCURRENCY,
        }
    }

    /// Limit the number of envelopes executed at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Handle one queue message
    ///
    /// Returns the response envelope that was sent back.
    ///
    /// # Errors
    ///
    /// [`RelayError::Serialization`] if the message is not a request envelope,
    /// [`RelayError::Network`] if the return address cannot be reached.
    pub async fn process(&self, message: &[u8]) -> Result<ResponseEnvelope> {
        let request = RequestEnvelope::from_bytes(message)?;
        let id = request.correlation_id;
        debug!("Executing {} {} for {}", request.method, request.target_url, id);

        let response = match self.executor.execute(&request).await {
            Ok(executed) => {
                let snapshot = RateLimitSnapshot::from_headers(&executed.headers, Utc::now());
                if let Some(snapshot) = &snapshot {
                    apply_limits_best_effort(self.store.as_ref(), &request.bucket_id, snapshot)
                        .await;
                }
                classify(&request, executed).with_snapshot(snapshot)
            }
            Err(e) => {
                warn!("Execution of {} failed: {:#}", id, e);
                ResponseEnvelope::failure(id, None, format!("{:#}", e))
            }
        };

        self.sender.send(&request.return_address, &response).await?;
        Ok(response)
    }

    /// Consume `queue` until `cancel` fires or the queue closes
    ///
    /// A closed queue drains in-flight envelopes first. Cancellation aborts them.
    pub async fn run(&self, mut queue: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        info!("Worker started (concurrency {})", self.concurrency);

        let cancelled = loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break false,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break false,
                },
            };
            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.process(&message).await {
                    warn!("Worker failed to process message: {}", e);
                }
            });

            while tasks.try_join_next().is_some() {}
        };

        if cancelled {
            debug!("Worker cancelled with {} envelopes in flight", tasks.len());
            tasks.shutdown().await;
        } else {
            while tasks.join_next().await.is_some() {}
        }
        info!("Worker stopped");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("sender", &self.sender)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Map an executed response to a response envelope
fn classify(request: &RequestEnvelope, executed: ExecutedResponse) -> ResponseEnvelope {
    let id = request.correlation_id;
    match executed.status {
        200..=299 => ResponseEnvelope::success(id, executed.status, executed.body),
        429 => {
            let retry_after = retry_after_from_headers(&executed.headers);
            debug!("Remote rate limited {} (retry after {:?})", id, retry_after);
            ResponseEnvelope::rate_limited(id, retry_after)
        }
        status => {
            let detail = String::from_utf8_lossy(&executed.body).into_owned();
            let detail = if detail.is_empty() {
                format!("remote returned status {}", status)
            } else {
                detail
            };
            ResponseEnvelope::failure(id, Some(status), detail)
        }
    }
}
