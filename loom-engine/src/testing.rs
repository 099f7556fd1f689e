//! Deterministic model stub for tests.
//!
//! [`StubModel`] implements [`Model`] over a byte-level vocabulary (token
//! id = byte value) plus any extra pieces registered with
//! [`StubModel::add_piece`].  Its decoder replays a scripted sequence of
//! logit rows — one row per decode call — and emits an end-of-generation
//! one-hot once the script is exhausted, so request pipelines can be
//! exercised end to end without any model weights.

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{Decoder, Model};
use crate::template::{ChatMessage, ChatTemplate, TemplateFormat};
use crate::token::{Pos, Token};

/// A scriptable in-memory model.
pub struct StubModel {
    pieces: Vec<String>,
    rows: Vec<Vec<f32>>,
    n_ctx: usize,
    template: ChatTemplate,
    fail_decoder_create: bool,
    fail_decode: bool,
}

impl StubModel {
    /// Byte tokens plus the end-of-generation token.
    pub const BASE_VOCAB: usize = 257;
    /// End-of-generation token id (piece is the empty string).
    pub const EOG: Token = 256;
    /// Beginning-of-sequence token id.
    pub const BOS: Token = 1;

    pub fn new() -> Self {
        let mut pieces: Vec<String> = (0u8..=255).map(|b| (b as char).to_string()).collect();
        pieces.push(String::new());
        Self {
            pieces,
            rows: Vec::new(),
            n_ctx: 4096,
            template: ChatTemplate::Format(TemplateFormat::Raw),
            fail_decoder_create: false,
            fail_decode: false,
        }
    }

    /// Register an extra piece and return its token id.
    pub fn add_piece(&mut self, piece: &str) -> Token {
        self.pieces.push(piece.to_string());
        (self.pieces.len() - 1) as Token
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = template;
        self
    }

    /// Script the decoder with explicit logit rows, one per decode call
    /// (the first row answers the prefill).
    pub fn with_logit_rows(mut self, rows: Vec<Vec<f32>>) -> Self {
        self.rows = rows;
        self
    }

    /// Script the decoder to deterministically yield `tokens` in order.
    /// Register extra pieces before calling this: rows are sized to the
    /// vocabulary at call time.
    pub fn with_script(mut self, tokens: &[Token]) -> Self {
        let n_vocab = self.pieces.len();
        self.rows = tokens.iter().map(|&t| one_hot(n_vocab, t)).collect();
        self
    }

    /// Make [`Model::new_decoder`] fail, for slot-start error paths.
    pub fn with_failing_decoder_create(mut self) -> Self {
        self.fail_decoder_create = true;
        self
    }

    /// Make every decode call fail, for prefill error paths.
    pub fn with_failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    /// Convenience: the stub wrapped for handler state.
    pub fn into_model(self) -> Arc<dyn Model> {
        Arc::new(self)
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for StubModel {
    fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        self.template.apply(messages)
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(Self::BOS);
        }
        for c in text.chars() {
            let code = c as u32;
            tokens.push(if code < 256 { code as Token } else { 0 });
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, _render_special: bool) -> Result<String, EngineError> {
        self.pieces
            .get(token as usize)
            .cloned()
            .ok_or(EngineError::TokenToPiece(token))
    }

    fn token_is_eog(&self, token: Token) -> bool {
        token == Self::EOG
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>, EngineError> {
        if self.fail_decoder_create {
            return Err(EngineError::DecoderCreate(
                "stub configured to fail".to_string(),
            ));
        }
        Ok(Box::new(StubDecoder {
            rows: self.rows.clone(),
            step: 0,
            logits: Vec::new(),
            n_vocab: self.pieces.len(),
            n_ctx: self.n_ctx,
            fail_decode: self.fail_decode,
        }))
    }
}

struct StubDecoder {
    rows: Vec<Vec<f32>>,
    step: usize,
    logits: Vec<f32>,
    n_vocab: usize,
    n_ctx: usize,
    fail_decode: bool,
}

impl Decoder for StubDecoder {
    fn decode(&mut self, tokens: &[Token], pos: Pos) -> Result<(), EngineError> {
        if self.fail_decode {
            return Err(EngineError::Decode("stub configured to fail".to_string()));
        }
        if pos as usize + tokens.len() > self.n_ctx {
            return Err(EngineError::ContextExhausted { n_ctx: self.n_ctx });
        }
        self.logits = self
            .rows
            .get(self.step)
            .cloned()
            .unwrap_or_else(|| one_hot(self.n_vocab, StubModel::EOG));
        self.step += 1;
        Ok(())
    }

    fn last_logits(&self) -> &[f32] {
        &self.logits
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }
}

fn one_hot(n_vocab: usize, token: Token) -> Vec<f32> {
    let mut row = vec![-30.0; n_vocab];
    if let Some(l) = row.get_mut(token as usize) {
        *l = 1.0;
    }
    row
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    fn argmax(logits: &[f32]) -> Token {
        let mut best = 0usize;
        for (i, &l) in logits.iter().enumerate() {
            if l > logits[best] {
                best = i;
            }
        }
        best as Token
    }

    #[test]
    fn tokenize_maps_bytes_and_prepends_bos() {
        let model = StubModel::new();
        let tokens = model.tokenize("AB", true, false).unwrap();
        assert_eq!(tokens, vec![StubModel::BOS, 65, 66]);
        assert_eq!(model.tokenize("AB", false, false).unwrap(), vec![65, 66]);
    }

    #[test]
    fn scripted_decoder_replays_then_ends_generation() {
        let mut stub = StubModel::new();
        let ok = stub.add_piece("ok");
        let model = stub.with_script(&[ok]);
        let mut decoder = model.new_decoder().unwrap();

        decoder.decode(&[65], 0).unwrap();
        let first = argmax(decoder.last_logits());
        assert_eq!(first, ok);

        decoder.decode(&[first], 1).unwrap();
        let second = argmax(decoder.last_logits());
        assert!(model.token_is_eog(second));
    }
}
