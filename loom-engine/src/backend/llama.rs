//! GGUF inference through llama.cpp (`llama-cpp-2`).
//!
//! One [`LlamaCppModel`] holds the backend and the loaded weights; every
//! request gets its own `LlamaContext` (KV cache) through
//! [`Model::new_decoder`].  The context borrows the model, so the decoder
//! keeps an `Arc` to the shared state and the borrow is lifetime-extended
//! the same way the rest of the ecosystem does it: the `Arc` guarantees
//! the model outlives the context, and field order guarantees the context
//! drops first.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::model::{Decoder, Model};
use crate::template::{ChatMessage, ChatTemplate, TemplateFormat};
use crate::token::{Pos, Token};

/// Loading configuration for a GGUF model.
#[derive(Debug, Clone)]
pub struct LlamaCppConfig {
    pub model_path: PathBuf,
    /// Context window per request; clamped to the model's training window.
    pub n_ctx: u32,
    /// Prompt-processing batch size.
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    pub n_threads: i32,
}

impl Default for LlamaCppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            n_ctx: 4096,
            n_batch: 512,
            n_gpu_layers: 0,
            n_threads: optimal_threads(),
        }
    }
}

struct Shared {
    backend: LlamaBackend,
    model: LlamaModel,
    n_ctx: u32,
    n_batch: u32,
    n_threads: i32,
}

/// A loaded llama.cpp model implementing the engine's [`Model`] seam.
pub struct LlamaCppModel {
    shared: Arc<Shared>,
}

impl LlamaCppModel {
    pub fn load(config: &LlamaCppConfig) -> Result<Self, EngineError> {
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        let params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let train_ctx = model.n_ctx_train();
        let n_ctx = config.n_ctx.min(train_ctx);
        info!(
            path = %config.model_path.display(),
            n_vocab = model.n_vocab(),
            train_ctx,
            n_ctx,
            "model loaded"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                model,
                n_ctx,
                n_batch: config.n_batch.min(n_ctx),
                n_threads: config.n_threads,
            }),
        })
    }
}

impl Model for LlamaCppModel {
    fn n_vocab(&self) -> usize {
        self.shared.model.n_vocab() as usize
    }

    fn n_ctx(&self) -> usize {
        self.shared.n_ctx as usize
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        match native_template(&self.shared.model, messages) {
            Ok(prompt) => Ok(prompt),
            Err(e) => {
                warn!(error = %e, "model chat template failed; falling back to raw format");
                ChatTemplate::Format(TemplateFormat::Raw).apply(messages)
            }
        }
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .shared
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: Token, render_special: bool) -> Result<String, EngineError> {
        let special = if render_special {
            Special::Tokenize
        } else {
            Special::Plaintext
        };
        let bytes = self
            .shared
            .model
            .token_to_bytes(llama_cpp_2::token::LlamaToken(token), special)
            .map_err(|_| EngineError::TokenToPiece(token))?;
        // Pieces can split multi-byte characters; lossy decoding keeps the
        // stream flowing instead of failing mid-generation.
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_is_eog(&self, token: Token) -> bool {
        self.shared
            .model
            .is_eog_token(llama_cpp_2::token::LlamaToken(token))
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>, EngineError> {
        let shared = Arc::clone(&self.shared);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(shared.n_ctx))
            .with_n_batch(shared.n_batch)
            .with_n_threads(shared.n_threads)
            .with_n_threads_batch(shared.n_threads);

        // SAFETY: the context borrows `shared.model`; `shared` is kept
        // alive by the Arc in the decoder, and `ctx` is declared before
        // `_shared` so it drops first.
        let model_ref: &'static LlamaModel =
            unsafe { &*(&shared.model as *const LlamaModel) };
        let ctx = model_ref
            .new_context(&shared.backend, ctx_params)
            .map_err(|e| EngineError::DecoderCreate(e.to_string()))?;

        Ok(Box::new(LlamaCppDecoder {
            ctx,
            batch_capacity: shared.n_batch as usize,
            logits: Vec::new(),
            _shared: shared,
        }))
    }
}

fn native_template(model: &LlamaModel, messages: &[ChatMessage]) -> Result<String, EngineError> {
    let template = model
        .chat_template(None)
        .map_err(|e| EngineError::Template(e.to_string()))?;
    let mut chat: Vec<LlamaChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        chat.push(
            LlamaChatMessage::new(msg.role.clone(), msg.content.clone())
                .map_err(|e| EngineError::Template(e.to_string()))?,
        );
    }
    model
        .apply_chat_template(&template, &chat, true)
        .map_err(|e| EngineError::Template(e.to_string()))
}

struct LlamaCppDecoder {
    ctx: LlamaContext<'static>,
    batch_capacity: usize,
    logits: Vec<f32>,
    _shared: Arc<Shared>,
}

// The context is only ever driven from one blocking task at a time.
unsafe impl Send for LlamaCppDecoder {}

impl Decoder for LlamaCppDecoder {
    fn decode(&mut self, tokens: &[Token], pos: Pos) -> Result<(), EngineError> {
        let total = tokens.len();
        if total == 0 {
            return Err(EngineError::Decode("empty token batch".to_string()));
        }
        let mut batch = LlamaBatch::new(self.batch_capacity.min(total), 1);

        for (chunk_index, chunk) in tokens.chunks(self.batch_capacity).enumerate() {
            batch.clear();
            let offset = chunk_index * self.batch_capacity;
            for (i, &token) in chunk.iter().enumerate() {
                let global = offset + i;
                let is_last = global + 1 == total;
                batch
                    .add(
                        llama_cpp_2::token::LlamaToken(token),
                        pos + global as Pos,
                        &[0],
                        is_last,
                    )
                    .map_err(|e| EngineError::Decode(e.to_string()))?;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }

        let last = batch.n_tokens() - 1;
        self.logits = self.ctx.get_logits_ith(last).to_vec();
        Ok(())
    }

    fn last_logits(&self) -> &[f32] {
        &self.logits
    }

    fn n_ctx(&self) -> usize {
        self._shared.n_ctx as usize
    }
}

fn optimal_threads() -> i32 {
    let logical = std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(4);
    (logical / 2).clamp(2, 16)
}
