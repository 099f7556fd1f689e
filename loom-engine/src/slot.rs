//! Per-request inference slot.
//!
//! A [`Slot`] owns a decode context (and with it, the KV cache) for the
//! lifetime of one request.  The context is allocated lazily by
//! [`Slot::start`] so that acquiring a slot and paying for the KV cache
//! are distinct, individually fallible steps.  Dropping the slot releases
//! the cache on every exit path.

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{Decoder, Model};
use crate::token::{Pos, Token};

/// An inference worker bound to one request.
pub struct Slot {
    model: Arc<dyn Model>,
    decoder: Option<Box<dyn Decoder>>,
    n_past: Pos,
}

impl Slot {
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self {
            model,
            decoder: None,
            n_past: 0,
        }
    }

    /// Allocate the decode context and KV cache.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.decoder = Some(self.model.new_decoder()?);
        self.n_past = 0;
        Ok(())
    }

    /// The model this slot decodes with.
    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    /// Context window size.  Falls back to the model's window when the
    /// slot has not been started yet.
    pub fn n_ctx(&self) -> usize {
        self.decoder
            .as_ref()
            .map_or_else(|| self.model.n_ctx(), |d| d.n_ctx())
    }

    /// Number of tokens already decoded into the KV cache.
    pub fn n_past(&self) -> Pos {
        self.n_past
    }

    /// Submit the whole prompt so the KV cache reflects it before
    /// generation begins.
    pub fn prefill(&mut self, tokens: &[Token]) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::Decode(
                "cannot prefill an empty token sequence".to_string(),
            ));
        }
        let n_ctx = self.n_ctx();
        let decoder = self.decoder.as_mut().ok_or(EngineError::SlotNotStarted)?;
        if tokens.len() > n_ctx {
            return Err(EngineError::ContextExhausted { n_ctx });
        }
        decoder.decode(tokens, 0)?;
        self.n_past = tokens.len() as Pos;
        Ok(())
    }

    /// Advance the cache by a single generated token.
    pub fn eval_token(&mut self, token: Token) -> Result<(), EngineError> {
        let n_ctx = self.n_ctx();
        let decoder = self.decoder.as_mut().ok_or(EngineError::SlotNotStarted)?;
        if (self.n_past as usize) + 1 > n_ctx {
            return Err(EngineError::ContextExhausted { n_ctx });
        }
        decoder.decode(&[token], self.n_past)?;
        self.n_past += 1;
        Ok(())
    }

    /// Logits for the last decoded position.
    pub fn logits(&self) -> Result<&[f32], EngineError> {
        self.decoder
            .as_ref()
            .map(|d| d.last_logits())
            .ok_or(EngineError::SlotNotStarted)
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("started", &self.decoder.is_some())
            .field("n_past", &self.n_past)
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::StubModel;

    fn started_slot(n_ctx: usize) -> Slot {
        let model: Arc<dyn Model> = Arc::new(StubModel::new().with_n_ctx(n_ctx));
        let mut slot = Slot::new(model);
        slot.start().expect("start failed");
        slot
    }

    #[test]
    fn primitives_require_start() {
        let model: Arc<dyn Model> = Arc::new(StubModel::new());
        let mut slot = Slot::new(model);
        assert!(matches!(
            slot.prefill(&[65]),
            Err(EngineError::SlotNotStarted)
        ));
        assert!(slot.logits().is_err());
    }

    #[test]
    fn prefill_advances_position() {
        let mut slot = started_slot(16);
        slot.prefill(&[65, 66, 67]).expect("prefill failed");
        assert_eq!(slot.n_past(), 3);
        assert!(slot.logits().is_ok());
    }

    #[test]
    fn eval_token_fails_when_window_is_full() {
        let mut slot = started_slot(4);
        slot.prefill(&[65, 66, 67]).expect("prefill failed");
        slot.eval_token(68).expect("one more token should fit");
        assert!(matches!(
            slot.eval_token(69),
            Err(EngineError::ContextExhausted { n_ctx: 4 })
        ));
        assert_eq!(slot.n_past(), 4);
    }

    #[test]
    fn prefill_rejects_prompts_larger_than_the_window() {
        let mut slot = started_slot(2);
        assert!(matches!(
            slot.prefill(&[65, 66, 67]),
            Err(EngineError::ContextExhausted { .. })
        ));
    }
}
