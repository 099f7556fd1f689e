//! OpenAI-compatible chat-completion request / response types and the
//! request-parameter validation ladder.
//!
//! The request body is validated field by field against the raw JSON
//! value rather than serde-derived, because the endpoint contract
//! distinguishes missing, null, mistyped and out-of-range fields with
//! specific single-line error messages, rejects a set of documented but
//! unsupported OpenAI fields, and tokenizes `stop` strings against the
//! loaded model while parsing.  [`ChatCompletionRequest`] documents the
//! accepted shape for the OpenAPI spec and for building request bodies in
//! tests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use utoipa::ToSchema;

use loom_engine::{ChatMessage as EngineMessage, Grammar, Model, SamplerParams, Token};

use crate::error::ServerError;

// ── Wire types ────────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// The role of the message author (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// The content of the message.
    pub content: String,
}

/// Request body for `POST /v1/chat/completions`.
///
/// Recognized keys only; unrecognized keys are ignored by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// The model identifier; echoed back in the response.
    pub model: String,
    /// Conversation history, in order.
    pub messages: Vec<ChatMessage>,
    /// When `true`, the response is streamed as server-sent events.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    /// Upper bound on generated tokens; negative means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    /// Synonym for `max_tokens`; takes precedence when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    /// Seed for best-effort deterministic sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Nucleus sampling mass in (0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Sampling temperature in [0, 2].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Presence penalty in [-2, 2].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Frequency penalty in [-2, 2].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// End-user identifier for abuse monitoring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// A stop string, or an array of up to four stop strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub stop: Option<Value>,
    /// `"auto"`, `{"type":"json_object"}`, or
    /// `{"type":"json_schema","json_schema":{…}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub response_format: Option<Value>,
}

/// A single choice in the buffered completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    /// Zero-based index of this choice.
    pub index: u32,
    /// Always `null`; log-probability reporting is not supported.
    #[schema(value_type = Option<Object>)]
    pub logprobs: Option<Value>,
    /// `"stop"` or `"length"`.
    pub finish_reason: Option<String>,
    /// The generated message.
    pub message: ChatMessage,
}

/// Token accounting attached to buffered responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Response body for `POST /v1/chat/completions` with `stream: false`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    /// Unique identifier for this completion.
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp of when the response was created.
    pub created: i64,
    /// Model that produced the completion (echoed from the request).
    pub model: String,
    /// Single-element array of generated choices.
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

/// The incremental part of one streamed event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatDelta {
    /// `"assistant"` on the opening event only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// The piece of generated text carried by this event.
    pub content: String,
}

/// A single choice in a streamed event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChunkChoice {
    pub index: u32,
    /// Always `null`.
    #[schema(value_type = Option<Object>)]
    pub logprobs: Option<Value>,
    /// Populated on the final event only.
    pub finish_reason: Option<String>,
    pub delta: ChatDelta,
}

/// One server-sent event of a streamed completion.  Same envelope as the
/// buffered response, with `delta` in place of `message`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp; stamped per event.
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Opening event: announces the assistant role with empty content.
    pub fn open(id: &str, model: &str) -> Self {
        Self::with_delta(id, model, Some("assistant".to_owned()), String::new(), None)
    }

    /// Intermediate event carrying one generated piece.
    pub fn piece(id: &str, model: &str, piece: &str) -> Self {
        Self::with_delta(id, model, None, piece.to_owned(), None)
    }

    /// Final event: empty content with the finish reason populated.
    pub fn finish(id: &str, model: &str, finish_reason: &str) -> Self {
        Self::with_delta(id, model, None, String::new(), Some(finish_reason.to_owned()))
    }

    fn with_delta(
        id: &str,
        model: &str,
        role: Option<String>,
        content: String,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion".to_owned(),
            created: Utc::now().timestamp(),
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                logprobs: None,
                finish_reason,
                delta: ChatDelta { role, content },
            }],
        }
    }
}

// ── Validated request parameters ──────────────────────────────────────────────

/// OpenAI fields the endpoint knows about but refuses.
const UNSUPPORTED_FIELDS: &[(&str, &str)] = &[
    ("n", "OpenAI n field not supported"),
    ("tools", "OpenAI tools field not supported"),
    ("audio", "OpenAI audio field not supported"),
    ("logprobs", "OpenAI logprobs field not supported"),
    ("functions", "OpenAI functions field not supported"),
    ("modalities", "OpenAI modalities field not supported"),
    ("tool_choice", "OpenAI tool_choice field not supported"),
    ("top_logprobs", "OpenAI top_logprobs field not supported"),
    ("function_call", "OpenAI function_call field not supported"),
    ("parallel_tool_calls", "parallel_tool_calls field not supported"),
];

const MAX_STOP_SEQUENCES: usize = 4;
const MAX_STOP_BYTES: usize = 50;

/// Fully validated and defaulted parameters for one completion request.
///
/// Stop strings are stored in token-sequence form, tokenized against the
/// active model at parse time.  The seed is materialized here — before
/// any sampling — so repeated requests with equal seed and parameters
/// replay the same draws.
#[derive(Debug)]
pub struct CompletionParams {
    pub stream: bool,
    pub max_tokens: i64,
    pub seed: u64,
    pub top_p: f64,
    pub temperature: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub user: String,
    pub model: String,
    pub messages: Vec<EngineMessage>,
    pub stop: Vec<Vec<Token>>,
    pub grammar: Option<Grammar>,
}

fn is_legal_role(role: &str) -> bool {
    role == "system" || role == "user" || role == "assistant"
}

fn bad(message: impl Into<String>) -> ServerError {
    ServerError::BadRequest(message.into())
}

fn field<'a>(json: &'a Value, key: &str) -> &'a Value {
    json.get(key).unwrap_or(&Value::Null)
}

impl CompletionParams {
    /// Validate a parsed JSON body.  `json` must already be known to be an
    /// object.
    pub fn parse(json: &Value, model: &dyn Model) -> Result<Self, ServerError> {
        let mut params = CompletionParams {
            stream: false,
            max_tokens: -1,
            seed: rand::random(),
            top_p: 1.0,
            temperature: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            user: String::new(),
            model: String::new(),
            messages: Vec::new(),
            stop: Vec::new(),
            grammar: None,
        };

        // Fields OpenAI documents that we don't support yet.
        for &(key, message) in UNSUPPORTED_FIELDS {
            if !field(json, key).is_null() {
                return Err(bad(message));
            }
        }

        // model: string
        match field(json, "model").as_str() {
            Some(name) if !name.is_empty() => params.model = name.to_owned(),
            _ => return Err(bad("JSON missing model string")),
        }

        // messages: array<object<role:string, content:string>>
        let messages = field(json, "messages")
            .as_array()
            .ok_or_else(|| bad("JSON missing messages array"))?;
        for message in messages {
            let message = message
                .as_object()
                .ok_or_else(|| bad("messages array must hold objects"))?;
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("message must have string role"))?;
            if !is_legal_role(role) {
                return Err(bad("message role not system user assistant"));
            }
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("message must have string content"))?;
            params.messages.push(EngineMessage::new(role, content));
        }

        // stream: bool|null
        let stream = field(json, "stream");
        if !stream.is_null() {
            params.stream = stream
                .as_bool()
                .ok_or_else(|| bad("stream field must be boolean"))?;
        }

        // max_tokens: integer|null, with max_completion_tokens as the
        // preferred synonym.
        let max_tokens = field(json, "max_tokens");
        if !max_tokens.is_null() {
            params.max_tokens = max_tokens
                .as_i64()
                .ok_or_else(|| bad("max_tokens must be integer"))?;
        }
        let max_completion_tokens = field(json, "max_completion_tokens");
        if !max_completion_tokens.is_null() {
            params.max_tokens = max_completion_tokens
                .as_i64()
                .ok_or_else(|| bad("max_completion_tokens must be integer"))?;
        }

        // top_p: number|null
        let top_p = field(json, "top_p");
        if !top_p.is_null() {
            params.top_p = top_p.as_f64().ok_or_else(|| bad("top_p must be number"))?;
        }

        // temperature: number|null in [0, 2]
        let temperature = field(json, "temperature");
        if !temperature.is_null() {
            params.temperature = temperature
                .as_f64()
                .ok_or_else(|| bad("temperature must be number"))?;
            if !(0.0..=2.0).contains(&params.temperature) {
                return Err(bad("temperature must be between 0 and 2"));
            }
        }

        // seed: integer|null
        let seed = field(json, "seed");
        if !seed.is_null() {
            params.seed = seed
                .as_i64()
                .map(|v| v as u64)
                .or_else(|| seed.as_u64())
                .ok_or_else(|| bad("seed must be integer"))?;
        }

        // presence_penalty: number|null in [-2, 2]
        let presence_penalty = field(json, "presence_penalty");
        if !presence_penalty.is_null() {
            params.presence_penalty = presence_penalty
                .as_f64()
                .ok_or_else(|| bad("presence_penalty must be number"))?;
            if !(-2.0..=2.0).contains(&params.presence_penalty) {
                return Err(bad("presence_penalty must be between -2 and 2"));
            }
        }

        // frequency_penalty: number|null in [-2, 2]
        let frequency_penalty = field(json, "frequency_penalty");
        if !frequency_penalty.is_null() {
            params.frequency_penalty = frequency_penalty
                .as_f64()
                .ok_or_else(|| bad("frequency_penalty must be number"))?;
            if !(-2.0..=2.0).contains(&params.frequency_penalty) {
                return Err(bad("frequency_penalty must be -2 through 2"));
            }
        }

        // user: string|null
        let user = field(json, "user");
        if !user.is_null() {
            params.user = user
                .as_str()
                .ok_or_else(|| bad("JSON missing user string"))?
                .to_owned();
        }

        // stop: string|array<string>|null, stored in token form
        let stop = field(json, "stop");
        if !stop.is_null() {
            if let Some(text) = stop.as_str() {
                if text.len() > MAX_STOP_BYTES {
                    return Err(bad("stop string too long"));
                }
                params.add_stop(model, text)?;
            } else if let Some(items) = stop.as_array() {
                if items.len() > MAX_STOP_SEQUENCES {
                    return Err(bad("stop array must have 4 items or fewer"));
                }
                for item in items {
                    let text = item
                        .as_str()
                        .ok_or_else(|| bad("stop array item must be string"))?;
                    if text.len() > MAX_STOP_BYTES {
                        return Err(bad("stop array string too long"));
                    }
                    params.add_stop(model, text)?;
                }
            } else {
                return Err(bad("stop field must be string or string array"));
            }
        }

        // response_format: "auto" | {type:"json_object"}
        //                | {type:"json_schema", json_schema:{...}}
        let response_format = field(json, "response_format");
        if !response_format.is_null() {
            if let Some(text) = response_format.as_str() {
                if text != "auto" {
                    return Err(bad("response_format not supported"));
                }
            } else if response_format.is_object() {
                let format_type = field(response_format, "type")
                    .as_str()
                    .ok_or_else(|| bad("response_format.type must be string"))?;
                match format_type {
                    "json_object" => {
                        params.grammar =
                            Some(compile_schema_grammar(r#"{"type": "object"}"#)?);
                    }
                    "json_schema" => {
                        let schema = field(response_format, "json_schema");
                        if !schema.is_object() {
                            return Err(bad("response_format.json_schema must be object"));
                        }
                        params.grammar = Some(compile_schema_grammar(&schema.to_string())?);
                    }
                    _ => return Err(bad("response_format.type unsupported")),
                }
            } else {
                return Err(bad("response_format must be string or object"));
            }
        }

        Ok(params)
    }

    fn add_stop(&mut self, model: &dyn Model, text: &str) -> Result<(), ServerError> {
        let tokens = model.tokenize(text, false, false)?;
        self.stop.push(tokens);
        Ok(())
    }

    /// Sampling configuration derived from these parameters.  Takes the
    /// grammar, so call it once.
    pub fn sampler_params(&mut self) -> SamplerParams {
        SamplerParams {
            temperature: self.temperature as f32,
            top_p: self.top_p as f32,
            frequency_penalty: self.frequency_penalty as f32,
            presence_penalty: self.presence_penalty as f32,
            seed: self.seed,
            grammar: self.grammar.take(),
        }
    }
}

/// Compile a JSON schema into a sampling grammar.  The compiler's message
/// is logged, not echoed.
fn compile_schema_grammar(schema: &str) -> Result<Grammar, ServerError> {
    Grammar::from_json_schema(schema).map_err(|e| {
        warn!(error = %e, "couldn't compile json schema");
        bad("bad json schema")
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
