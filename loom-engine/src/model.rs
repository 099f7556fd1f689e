use crate::error::EngineError;
use crate::template::ChatMessage;
use crate::token::{Pos, Token};

/// A loaded causal language model.
///
/// The handle is shared-immutable across requests (`Arc<dyn Model>`); all
/// mutable per-request state lives in the [`Decoder`] returned by
/// [`Model::new_decoder`].  Keeping this a trait rather than a concrete
/// type lets tests substitute [`crate::testing::StubModel`] and keeps the
/// decode kernel an external collaborator.
pub trait Model: Send + Sync {
    /// Number of tokens in the vocabulary.
    fn n_vocab(&self) -> usize;

    /// Maximum context window supported by a decode context.
    fn n_ctx(&self) -> usize;

    /// Render the conversation into the prompt text the model expects.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError>;

    /// Tokenize a UTF-8 string.
    ///
    /// # Arguments
    /// * `add_bos`       – prepend the beginning-of-sequence token.
    /// * `parse_special` – recognize special tokens (e.g. `<|user|>`) in the text.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, EngineError>;

    /// Convert a token id to its text piece.
    ///
    /// With `render_special = false`, special tokens render as the empty
    /// string instead of their marker text.
    fn token_to_piece(&self, token: Token, render_special: bool) -> Result<String, EngineError>;

    /// Returns `true` if `token` is an end-of-generation token.
    fn token_is_eog(&self, token: Token) -> bool;

    /// Allocate a fresh decode context with its own KV cache.
    fn new_decoder(&self) -> Result<Box<dyn Decoder>, EngineError>;
}

/// A decode context bound to one [`Model`].
///
/// Exclusively owned by a single request; never shared.
pub trait Decoder: Send {
    /// Feed `tokens` at positions `pos .. pos + tokens.len()` into the KV
    /// cache, computing logits for the last fed position.
    fn decode(&mut self, tokens: &[Token], pos: Pos) -> Result<(), EngineError>;

    /// Logits over the vocabulary for the last decoded position.
    fn last_logits(&self) -> &[f32];

    /// Context window size of this decode context.
    fn n_ctx(&self) -> usize;
}
