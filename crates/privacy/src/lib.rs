//! Protection of personal data in the course-management application.
//!
//! - [`crypto`]: AES-256-GCM-SIV field cipher and key ring.
//! - [`codec`]: applies the cipher to the sensitive attributes of profiles.
//! - [`ledger`]: per-student consent state, history and statistics.
//! - [`store`]: persistence interface the ledger runs against.
//! - [`server`]: thin HTTP adapter used by the `privacy-svc` binary.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod ledger;
pub mod server;
pub mod store;
pub mod telemetry;
