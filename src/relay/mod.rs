//! Request/Response Relay Module
//!
//! Decouples callers from the remote API: a request is admitted against its
//! bucket, published to a durable queue, executed by a worker elsewhere, and
//! its response is delivered back to the exact process that asked for it.
//!
//! # Architecture
//!
//! ```text
//!  caller ──invoke──► RequestOrchestrator ──► AdmissionController
//!                           │    ▲
//!                 register  │    │ settled
//!                           ▼    │
//!                     CorrelationTable ◄──resolve── ResponseListener ◄──┐
//!                           │                                           │
//!                      RelayClient ──► queue ──► Worker ──TCP frames────┘
//! ```

pub mod client;
pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod listener;
pub mod orchestrator;
pub mod worker;

pub use client::{ChannelTransport, HttpQueueTransport, QueueTransport, RelayClient};
pub use codec::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
pub use correlation::{CorrelationTable, PendingEntry, ResolveOutcome, Settlement};
pub use envelope::{
    new_correlation_id, CorrelationId, RequestEnvelope, RequestSpec, Response, ResponseEnvelope,
    ResponseStatus,
};
pub use listener::ResponseListener;
pub use orchestrator::{Invocation, InvocationState, RequestOrchestrator};
pub use worker::{ExecutedResponse, HttpExecutor, RequestExecutor, ResponseSender, Worker};
