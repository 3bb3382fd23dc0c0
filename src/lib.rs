//! # vendorsync
//!
//! Synchronization core between a property-management platform and external
//! vendor platforms. The crate owns the full lifecycle of a vendor link:
//!
//! - [`connections`]: OAuth authorization, encrypted token storage,
//!   proactive single-flight refresh, revocation
//! - [`client`]: one resilient execution path for every vendor API call,
//!   with retries, rate-limit compliance, and read caching
//! - [`mapping`]: declarative field translation between local and vendor
//!   schemas
//! - [`orchestrator`]: push/pull/bidirectional sync jobs with per-org
//!   mutual exclusion, batching, conflict resolution, and a worker pool
//! - [`reconciliation`]: windowed two-sided verification with discrepancy
//!   reports and limited auto-fixing
//! - [`audit`]: append-only trail of every mutating operation
//! - [`webhooks`]: vendor change events funneled into selective pull jobs
//!
//! Persistence is a seam, not an engine: every record family goes through
//! the traits in [`store`], with an in-memory implementation included.
//! HTTP serving, vendor-specific parsing, and scheduling stay with the
//! embedder.

pub mod audit;
pub mod client;
pub mod config;
pub mod connections;
pub mod crypto;
pub mod error;
pub mod mapping;
pub mod models;
pub mod orchestrator;
pub mod reconciliation;
pub mod store;
pub mod telemetry;
pub mod webhooks;

pub use error::{Error, Result};
