//! Structured logging and optional OpenTelemetry trace export.
//!
//! Logs are JSON on stdout. Spans are exported over OTLP/gRPC only when a
//! collector endpoint is configured.
//!
//! # Telemetry invariants
//!
//! - **No plaintext profile field, secret or derived key** may appear in any
//!   span attribute or log field. Cipher failures log the field name only.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`), and
//!   `RUST_LOG` takes precedence when set.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
