//! `privacy-svc` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP export).
//! 3. Build the field cipher from the configured key secrets.
//! 4. Build the consent ledger over the store and optional IP lookup.
//! 5. Build the Axum router and start the HTTP server.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use privacy::codec::ProfileCodec;
use privacy::config::Config;
use privacy::ledger::ConsentLedger;
use privacy::server::{self, state::AppState};
use privacy::store::MemoryStore;
use privacy::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        "privacy-svc starting"
    );

    // -----------------------------------------------------------------------
    // 3. Field cipher
    // -----------------------------------------------------------------------
    let cipher = Arc::new(cfg.cipher()?);
    info!(
        mode = cipher.mode_name(),
        keys_loaded = cipher.key_count(),
        "field cipher ready"
    );
    let codec = ProfileCodec::new(cipher);

    // -----------------------------------------------------------------------
    // 4. Consent ledger
    // -----------------------------------------------------------------------
    let store = Arc::new(MemoryStore::with_schema());
    let mut ledger = ConsentLedger::new(store, codec.clone(), cfg.consent_text.as_str());
    if let Some(lookup) = cfg.ip_lookup() {
        info!("IP lookup enabled");
        ledger = ledger.with_ip_lookup(Arc::new(lookup));
    }

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(ledger, codec, cfg.default_page_size);
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry::shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
