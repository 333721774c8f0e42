//! Axum HTTP adapter over the codec and the consent ledger.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Read the caller identity set by the upstream auth layer.
//! - Translate ledger and cipher errors into status codes and error bodies.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
