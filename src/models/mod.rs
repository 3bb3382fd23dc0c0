//! Domain models
//!
//! Plain serde records persisted through the `store` traits.

pub mod audit;
pub mod conflict;
pub mod connection;
pub mod discrepancy;
pub mod oauth_state;
pub mod record;
pub mod sync_job;
