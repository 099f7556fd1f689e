//! Native model backends.

mod llama;

pub use llama::{LlamaCppConfig, LlamaCppModel};
