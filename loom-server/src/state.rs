//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use tokio::sync::Semaphore;

use loom_engine::Model;

use crate::config::Config;

/// State shared across all HTTP handlers.
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The loaded model; shared-immutable across requests.
    pub model: Arc<dyn Model>,
    /// Caps concurrently started inference slots.  Each permit stands for
    /// one live KV cache.
    pub slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config, model: Arc<dyn Model>) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_slots));
        Arc::new(Self {
            config: Arc::new(config),
            model,
            slots,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("slots", &self.slots)
            .finish()
    }
}
