// =============================================================================
// Meridian FX — Main Entry Point
// =============================================================================
//
// One process drives one simulated account: the deadline scheduler chains
// session cycles, the price stream feeds TP/SL alerts, and the admin API
// exposes a read-only view of the account and scheduler.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian_fx::api;
use meridian_fx::config::{Settings, TRADING_PAIRS};
use meridian_fx::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian FX — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::from_env();
    if settings.polygon_api_key.is_empty() {
        warn!("POLYGON_API_KEY is empty — bar fetches and the quote stream will fail");
    }
    if settings.anthropic_api_key.is_empty() {
        warn!("ANTHROPIC_API_KEY is empty — predictions will fail");
    }
    info!(pairs = TRADING_PAIRS.len(), "configured trading pairs");

    // ── 2. Build & start the engine ──────────────────────────────────────
    let engine = Arc::new(Engine::new(settings.clone())?);
    engine.start();

    // ── 3. Admin API ─────────────────────────────────────────────────────
    let api_engine = Arc::clone(&engine);
    let bind_addr = settings.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind admin API");
        info!(addr = %bind_addr, "admin API listening");
        axum::serve(listener, app).await.expect("admin API failed");
    });

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    engine.stop().await;
    info!("Meridian FX shut down complete.");
    Ok(())
}
