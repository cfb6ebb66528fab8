//! Rate Limiting and Admission Control Module
//!
//! This module tracks per-route quota state shared by every caller and gates
//! outbound sends on it.
//!
//! # Features
//!
//! - Fixed-window buckets keyed by route template
//! - Transactional `try_consume` (in-memory or SQLite, shared across processes)
//! - Authoritative corrections from remote rate-limit headers
//! - Cooperative admission waiting with capped, jittered backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Admission Controller                      │
//! │        await_admission ── backoff ── cancellation           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐    ┌──────────────────────────┐   │
//! │  │ MemoryBucketStore    │    │ SqliteBucketStore        │   │
//! │  │ (single process)     │    │ (BEGIN IMMEDIATE per op) │   │
//! │  └──────────────────────┘    └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod backoff;
pub mod bucket;
pub mod route;
pub mod sqlite;
pub mod store;

pub use admission::{AdmissionController, AdmissionGrant};
pub use backoff::BackoffConfig;
pub use bucket::{Bucket, BucketDefaults, ConsumeOutcome, RateLimitSnapshot};
pub use route::RouteTemplate;
pub use sqlite::SqliteBucketStore;
pub use store::{apply_limits_best_effort, BucketStore, MemoryBucketStore};
