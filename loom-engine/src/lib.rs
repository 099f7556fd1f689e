//! Inference engine for the loom chat-completion server.
//!
//! The crate is organized around a small set of seams:
//!
//! - [`Model`] / [`Decoder`] — the boundary to the loaded weights and the
//!   low-level decode kernel.  The server only ever holds an
//!   `Arc<dyn Model>`, so tests can substitute
//!   [`testing::StubModel`] and production builds can enable the
//!   `llama-cpp` feature for a real GGUF backend.
//! - [`Slot`] — a per-request inference worker owning a decode context and
//!   its KV cache.
//! - [`Sampler`] — temperature / top-p / penalty / seeded sampling with an
//!   optional grammar constraint for structured output.
//! - [`Grammar`] — JSON-schema-derived grammars and the state machine that
//!   enforces them during generation.
//! - [`template`] — chat-template application (named formats plus custom
//!   Jinja templates).

mod error;
pub mod grammar;
mod model;
mod sampler;
mod slot;
pub mod template;
pub mod testing;
mod token;

#[cfg(feature = "llama-cpp")]
pub mod backend;

pub use error::EngineError;
pub use grammar::Grammar;
pub use model::{Decoder, Model};
pub use sampler::{Sampler, SamplerParams};
pub use slot::Slot;
pub use template::{ChatMessage, ChatTemplate, TemplateFormat};
pub use token::{Pos, Token};
