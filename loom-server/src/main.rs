//! loom-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or pretty, per config).
//! 3. Load the model backend.
//! 4. Build shared state and the Axum router.
//! 5. Start the HTTP server.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use loom_engine::Model;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "loom-server starting");
    info!(
        bind = %cfg.bind_address,
        model = %cfg.model_path,
        n_ctx = cfg.n_ctx,
        gpu_layers = cfg.n_gpu_layers,
        slots = cfg.max_slots,
        "configuration loaded"
    );

    // ── 3. Model backend ───────────────────────────────────────────────────────
    let model = load_model(&cfg)?;

    // ── 4. Shared state and router ─────────────────────────────────────────────
    let state = AppState::new(cfg.clone(), model);
    let app = routes::build(Arc::clone(&state));

    // ── 5. HTTP server ─────────────────────────────────────────────────────────
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "llama-cpp")]
fn load_model(cfg: &Config) -> anyhow::Result<Arc<dyn Model>> {
    let backend_cfg = loom_engine::backend::LlamaCppConfig {
        model_path: cfg.model_path.clone().into(),
        n_ctx: cfg.n_ctx,
        n_gpu_layers: cfg.n_gpu_layers,
        ..Default::default()
    };
    let model = loom_engine::backend::LlamaCppModel::load(&backend_cfg)?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "llama-cpp"))]
fn load_model(cfg: &Config) -> anyhow::Result<Arc<dyn Model>> {
    anyhow::bail!(
        "no model backend compiled in; rebuild with `--features llama-cpp` \
         to serve {} (LOOM_MODEL)",
        cfg.model_path
    )
}
