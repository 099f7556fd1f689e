use crate::token::Token;

/// Errors that can occur inside the inference engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Loading the model weights failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Chat-template rendering failed.
    #[error("chat template rendering failed: {0}")]
    Template(String),

    /// Tokenization failed.
    #[error("tokenization failed: {0}")]
    Tokenize(String),

    /// A token id has no text piece in the vocabulary.
    #[error("token {0} has no text piece")]
    TokenToPiece(Token),

    /// Allocating a decode context (KV cache) failed.
    #[error("failed to create decode context: {0}")]
    DecoderCreate(String),

    /// The decode kernel reported an error.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A slot primitive was called before [`crate::Slot::start`].
    #[error("slot not started")]
    SlotNotStarted,

    /// The context window is full; no further token can be evaluated.
    #[error("context window exhausted ({n_ctx} tokens)")]
    ContextExhausted { n_ctx: usize },

    /// A grammar failed validation or has no viable continuation.
    #[error("invalid grammar: {0}")]
    Grammar(String),

    /// A JSON schema could not be compiled into a grammar.
    #[error("invalid json schema: {0}")]
    JsonSchema(String),
}
