//! Correlation Table
//!
//! Concurrent map from correlation id to a single-shot completion handle.
//! Every entry is owned by the table from `register` until `deregister` or
//! `expire` removes it; the invoking task only holds the receiving half.
//!
//! # Settlement
//!
//! Each slot carries an `Option<oneshot::Sender>`. Settling takes the sender
//! out of the slot, so the first `resolve` (or `expire`) wins and every later
//! attempt observes `None` and becomes a no-op.
//!
//! ```text
//!  register ──► Pending ──resolve──► Settled ──deregister──► (gone)
//!                  │                    ▲
//!                  └──────expire────────┴──────────────────► (gone)
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::envelope::{CorrelationId, ResponseEnvelope};
use crate::error::{RelayError, Result};
use crate::metrics;

/// How a pending entry was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// A response envelope arrived
    Completed(ResponseEnvelope),
    /// The deadline passed with no response
    Expired,
    /// The slot was dropped without being settled
    Abandoned,
}

/// Result of a `resolve` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This call settled the entry
    Settled,
    /// The entry had already been settled; nothing changed
    AlreadySettled,
    /// No entry is registered under the id
    Unknown,
}

struct Slot {
    tx: Option<oneshot::Sender<Settlement>>,
    deadline: Instant,
}

/// Awaitable half of a registered entry
#[derive(Debug)]
pub struct PendingEntry {
    /// Correlation id
    pub correlation_id: CorrelationId,

    /// Absolute deadline
    pub deadline: Instant,

    rx: oneshot::Receiver<Settlement>,
}

impl PendingEntry {
    /// Wait for the entry to settle
    pub async fn settled(&mut self) -> Settlement {
        (&mut self.rx).await.unwrap_or(Settlement::Abandoned)
    }

    /// Settlement if one has already been delivered
    pub fn try_settlement(&mut self) -> Option<Settlement> {
        match self.rx.try_recv() {
            Ok(settlement) => Some(settlement),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Settlement::Abandoned),
        }
    }
}

/// Process-local correlation table
#[derive(Default)]
pub struct CorrelationTable {
    entries: DashMap<CorrelationId, Slot>,
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry
    ///
    /// # Errors
    ///
    /// [`RelayError::DuplicateCorrelationId`] if `id` is already live.
    pub fn register(&self, id: CorrelationId, deadline: Instant) -> Result<PendingEntry> {
        let rx = match self.entries.entry(id) {
            Entry::Occupied(_) => {
                warn!("Duplicate correlation id {}", id);
                return Err(RelayError::DuplicateCorrelationId(id));
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(Slot {
                    tx: Some(tx),
                    deadline,
                });
                rx
            }
        };
        self.update_gauge();
        trace!("Registered correlation id {}", id);

        Ok(PendingEntry {
            correlation_id: id,
            deadline,
            rx,
        })
    }

    /// Settle the entry for `id` with `response`
    ///
    /// Only the first call settles; repeats are no-ops.
    pub fn resolve(&self, id: CorrelationId, response: ResponseEnvelope) -> ResolveOutcome {
        let tx = match self.entries.get_mut(&id) {
            Some(mut slot) => slot.tx.take(),
            None => {
                debug!("Response for unknown correlation id {}", id);
                metrics::UNKNOWN_RESPONSES_TOTAL.inc();
                return ResolveOutcome::Unknown;
            }
        };

        match tx {
            Some(tx) => {
                // The receiver may be gone if the invocation was cancelled;
                // the slot is still settled either way.
                let _ = tx.send(Settlement::Completed(response));
                trace!("Resolved correlation id {}", id);
                ResolveOutcome::Settled
            }
            None => {
                debug!("Duplicate response for correlation id {} ignored", id);
                metrics::DUPLICATE_RESPONSES_TOTAL.inc();
                ResolveOutcome::AlreadySettled
            }
        }
    }

    /// Settle `id` as expired and remove it, if it is still pending
    ///
    /// Returns true when this call expired the entry. Settled entries are left
    /// for their owner to deregister.
    pub fn expire(&self, id: CorrelationId) -> bool {
        let removed = self.entries.remove_if(&id, |_, slot| slot.tx.is_some());
        match removed {
            Some((_, mut slot)) => {
                if let Some(tx) = slot.tx.take() {
                    let _ = tx.send(Settlement::Expired);
                }
                self.update_gauge();
                debug!("Expired correlation id {}", id);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id`
    pub fn deregister(&self, id: CorrelationId) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            self.update_gauge();
            trace!("Deregistered correlation id {}", id);
        }
        removed
    }

    /// Whether `id` is live
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expire every pending entry whose deadline has passed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|slot| slot.tx.is_some() && slot.deadline <= now)
            .map(|slot| *slot.key())
            .collect();

        let expired = overdue.into_iter().filter(|id| self.expire(*id)).count();
        if expired > 0 {
            debug!("Sweep expired {} correlation entries", expired);
        }
        expired
    }

    /// Run `sweep_expired` every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        table: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        table.sweep_expired();
                    }
                }
            }
            debug!("Correlation sweeper stopped");
        })
    }

    fn update_gauge(&self) {
        metrics::PENDING_ENTRIES.set(self.entries.len() as i64);
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}
