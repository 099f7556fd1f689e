//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for loom-server.
///
/// Every field has a default so the server works out-of-the-box without
/// any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8080"`).
    pub bind_address: String,

    /// Path to the GGUF model file (default: `"model.gguf"`).
    pub model_path: String,

    /// Model id reported by `GET /v1/models` (default: `"default"`).
    pub model_id: String,

    /// Per-request context window in tokens.
    pub n_ctx: u32,

    /// Layers offloaded to the GPU (0 = CPU only).
    pub n_gpu_layers: u32,

    /// Maximum concurrently started inference slots.  Each started slot
    /// owns a KV cache, so this bounds memory as well as parallelism.
    pub max_slots: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origin allowlist; unset = wildcard.
    pub cors_allowed_origins: Option<String>,

    /// Expose Swagger UI under `/swagger-ui`.
    pub enable_swagger: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_owned(),
            model_path: "model.gguf".to_owned(),
            model_id: "default".to_owned(),
            n_ctx: 4096,
            n_gpu_layers: 0,
            max_slots: 4,
            log_level: "info".to_owned(),
            log_json: false,
            cors_allowed_origins: None,
            enable_swagger: true,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            bind_address: env_or("LOOM_BIND", &defaults.bind_address),
            model_path: env_or("LOOM_MODEL", &defaults.model_path),
            model_id: env_or("LOOM_MODEL_ID", &defaults.model_id),
            n_ctx: parse_env("LOOM_CTX", defaults.n_ctx),
            n_gpu_layers: parse_env("LOOM_GPU_LAYERS", defaults.n_gpu_layers),
            max_slots: parse_env("LOOM_MAX_SLOTS", defaults.max_slots),
            log_level: env_or("LOOM_LOG", &defaults.log_level),
            log_json: std::env::var("LOOM_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("LOOM_CORS_ORIGINS").ok(),
            enable_swagger: std::env::var("LOOM_ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(defaults.enable_swagger),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
