//! Request Orchestrator
//!
//! Caller-facing entry point. One `invoke` call walks an invocation through
//!
//! ```text
//! Admitting ──► Sent ──► Completed
//!     │          ├─────► TimedOut
//!     │          └─────► Cancelled
//!     ├──────────────────► TimedOut | Cancelled
//!     └──────────────────► SendFailed
//! ```
//!
//! The deadline covers both admission and the response wait. The pending
//! entry is removed from the correlation table on every exit path, including
//! when the caller drops the `invoke` future.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::RelayClient;
use super::correlation::{CorrelationTable, Settlement};
use super::envelope::{new_correlation_id, CorrelationId, RequestEnvelope, RequestSpec, Response};
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::rate_limit::{AdmissionController, RouteTemplate};

/// Default time an invocation may take end to end
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Waiting for bucket capacity
    Admitting,
    /// Envelope handed to the queue, waiting for the response
    Sent,
    /// A response envelope settled the invocation
    Completed,
    /// Deadline elapsed first
    TimedOut,
    /// Cancellation token fired first
    Cancelled,
    /// The envelope never reached the queue
    SendFailed,
}

impl InvocationState {
    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationState::Admitting | InvocationState::Sent)
    }

    /// Metric label
    pub fn label(self) -> &'static str {
        match self {
            InvocationState::Admitting => "admitting",
            InvocationState::Sent => "sent",
            InvocationState::Completed => "completed",
            InvocationState::TimedOut => "timed_out",
            InvocationState::Cancelled => "cancelled",
            InvocationState::SendFailed => "send_failed",
        }
    }
}

/// Tracks the state of one invocation
///
/// Terminal states are final: any transition out of one is refused.
#[derive(Debug)]
pub struct Invocation {
    correlation_id: CorrelationId,
    state: InvocationState,
}

impl Invocation {
    /// Start tracking a new invocation in `Admitting`
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            state: InvocationState::Admitting,
        }
    }

    /// Correlation id
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Current state
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Move to `next`; returns false if the current state is terminal
    pub fn transition(&mut self, next: InvocationState) -> bool {
        if self.state.is_terminal() {
            warn!(
                "Invocation {} refused transition {:?} -> {:?}",
                self.correlation_id, self.state, next
            );
            return false;
        }
        debug!(
            "Invocation {}: {:?} -> {:?}",
            self.correlation_id, self.state, next
        );
        self.state = next;
        true
    }
}

/// Removes the table entry when dropped
struct Registration<'a> {
    table: &'a CorrelationTable,
    id: CorrelationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.deregister(self.id);
    }
}

enum Wake {
    Cancelled,
    Deadline,
    Settled(Settlement),
}

/// Request orchestrator
#[derive(Debug, Clone)]
pub struct RequestOrchestrator {
    /// Admission gate
    admission: AdmissionController,

    /// Pending entries of this process
    table: Arc<CorrelationTable>,

    /// Queue hand-off
    relay: RelayClient,

    /// Route template used when a request names no bucket
    routes: RouteTemplate,

    /// Address of this process's response listener
    return_address: String,

    /// Timeout used when `invoke` is given none
    default_timeout: Duration,
}

impl RequestOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        admission: AdmissionController,
        table: Arc<CorrelationTable>,
        relay: RelayClient,
        return_address: impl Into<String>,
    ) -> Self {
        Self {
            admission,
            table,
            relay,
            routes: RouteTemplate::default(),
            return_address: return_address.into(),
            default_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    /// Use a custom route template
    pub fn with_routes(mut self, routes: RouteTemplate) -> Self {
        self.routes = routes;
        self
    }

    /// Set the timeout used when `invoke` is given none
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Correlation table shared with the response listener
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Address embedded in every envelope
    pub fn return_address(&self) -> &str {
        &self.return_address
    }

    /// Execute `spec` through the relay and wait for its response
    ///
    /// # Errors
    ///
    /// - [`RelayError::Timeout`] if the deadline passes before a response
    /// - [`RelayError::Cancelled`] if `cancel` fires first
    /// - [`RelayError::RelayUnavailable`] if the queue rejects the envelope
    /// - [`RelayError::RemoteFailure`] / [`RelayError::RemoteRateLimited`]
    ///   when the delivered response carries a failure status
    pub async fn invoke(
        &self,
        spec: RequestSpec,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let started = Instant::now();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut invocation = Invocation::new(new_correlation_id());

        let result = self
            .drive(&mut invocation, spec, started + timeout, timeout, cancel)
            .await;

        let state = invocation.state();
        metrics::INVOCATIONS_TOTAL
            .with_label_values(&[state.label()])
            .inc();
        metrics::INVOCATION_DURATION_SECONDS
            .with_label_values(&[state.label()])
            .observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(response) => info!(
                "Invocation {} completed with status {} in {:?}",
                invocation.correlation_id(),
                response.http_status,
                started.elapsed()
            ),
            Err(e) => debug!(
                "Invocation {} ended {:?}: {}",
                invocation.correlation_id(),
                state,
                e
            ),
        }
        result
    }

    async fn drive(
        &self,
        invocation: &mut Invocation,
        spec: RequestSpec,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let id = invocation.correlation_id();
        let timed_out = || RelayError::Timeout(id, timeout.as_millis() as u64);

        let bucket_id = match &spec.bucket_id {
            Some(bucket_id) => bucket_id.clone(),
            None => match self.routes.bucket_id_for(&spec.method, &spec.target_url) {
                Ok(bucket_id) => bucket_id,
                Err(e) => {
                    invocation.transition(InvocationState::SendFailed);
                    return Err(e);
                }
            },
        };

        // Admission stops at the deadline between store calls. The race only
        // abandons a store call that outlives the deadline, and a unit that call
        // committed stays consumed without a send.
        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(timed_out()),
            grant = self.admission.await_admission_until(&bucket_id, deadline, cancel) => {
                match grant {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(timed_out()),
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = admitted {
            invocation.transition(match e {
                RelayError::Cancelled => InvocationState::Cancelled,
                RelayError::Timeout(..) => InvocationState::TimedOut,
                _ => InvocationState::SendFailed,
            });
            return Err(e);
        }

        let mut pending = match self.table.register(id, deadline) {
            Ok(pending) => pending,
            Err(e) => {
                invocation.transition(InvocationState::SendFailed);
                return Err(e);
            }
        };
        let _registration = Registration {
            table: &self.table,
            id,
        };

        let envelope = RequestEnvelope::new(id, bucket_id, spec, self.return_address.clone());
        if let Err(e) = self.relay.send(&envelope).await {
            invocation.transition(InvocationState::SendFailed);
            return Err(e);
        }
        invocation.transition(InvocationState::Sent);

        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            settlement = pending.settled() => Wake::Settled(settlement),
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
        };

        let settlement = match wake {
            Wake::Cancelled => Settlement::Abandoned,
            Wake::Settled(settlement) => settlement,
            Wake::Deadline => {
                if self.table.expire(id) {
                    Settlement::Expired
                } else {
                    // Settled between the timer firing and the expiry
                    pending.try_settlement().unwrap_or(Settlement::Expired)
                }
            }
        };

        match settlement {
            Settlement::Completed(envelope) => {
                invocation.transition(InvocationState::Completed);
                envelope.into_result()
            }
            Settlement::Expired => {
                invocation.transition(InvocationState::TimedOut);
                Err(timed_out())
            }
            Settlement::Abandoned => {
                invocation.transition(InvocationState::Cancelled);
                Err(RelayError::Cancelled)
            }
        }
    }
}
