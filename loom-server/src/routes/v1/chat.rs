//! OpenAI-compatible chat completions (`POST /v1/chat/completions`).
//!
//! The request pipeline runs in ordered stages — validate parameters,
//! render the chat template, tokenize, acquire and start a slot, build
//! the sampler, prefill, then generate — and every early return releases
//! whatever was acquired before it, by scope.  Generation itself runs on
//! a blocking task: buffered requests accumulate the pieces and answer
//! with a single JSON body, streaming requests push one SSE frame per
//! piece through a channel and abort silently when the client goes away.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;

use loom_engine::{Sampler, Slot, Token};

use crate::error::ServerError;
use crate::schemas::v1::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChunkChoice, CompletionParams, Usage,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatCompletionChunk,
        ChatChoice,
        ChatDelta,
        ChatMessage,
        ChunkChoice,
        Usage,
    ))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// With `stream: true` the response is a `text/event-stream` of
/// `data: <json>` frames, one per generated piece, terminated by a
/// `data: [DONE]` sentinel.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Backend error"),
        (status = 501, description = "Unsupported content type"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    if !has_json_content_type(&headers) {
        return Err(ServerError::NotImplemented(
            "Content Type Not Implemented".to_owned(),
        ));
    }
    let json: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    if !json.is_object() {
        return Err(ServerError::BadRequest(
            "JSON body must be an object".to_owned(),
        ));
    }
    let mut params = CompletionParams::parse(&json, state.model.as_ref())?;

    debug!(
        model = %params.model,
        messages = params.messages.len(),
        stream = params.stream,
        seed = params.seed,
        "chat completion request"
    );

    // Render and tokenize the prompt before committing a slot.
    let model = Arc::clone(&state.model);
    let prompt = model.apply_chat_template(&params.messages)?;
    let prompt_tokens = model.tokenize(&prompt, true, false)?;

    // One permit per live KV cache.
    let permit = Arc::clone(&state.slots)
        .acquire_owned()
        .await
        .map_err(|_| ServerError::Internal("server is shutting down".to_owned()))?;

    let mut slot = Slot::new(Arc::clone(&model));
    if let Err(e) = slot.start() {
        error!(error = %e, "failed to start inference slot");
        return Err(ServerError::Internal(
            "failed to start inference slot".to_owned(),
        ));
    }

    if prompt_tokens.len() + 1 > slot.n_ctx() {
        return Err(ServerError::BadRequest(
            "prompt too big for model context size".to_owned(),
        ));
    }

    let mut sampler = match Sampler::new(params.sampler_params()) {
        Ok(sampler) => sampler,
        Err(e) => {
            error!(error = %e, "failed to create sampler");
            return Err(ServerError::Internal("failed to create sampler".to_owned()));
        }
    };

    if let Err(e) = slot.prefill(&prompt_tokens) {
        error!(error = %e, "prompt prefill failed");
        return Err(ServerError::Internal("prompt prefill failed".to_owned()));
    }

    let id = completion_id();
    let n_prompt = prompt_tokens.len();

    if params.stream {
        Ok(stream_completion(id, params, slot, sampler, permit))
    } else {
        buffered_completion(id, params, slot, sampler, n_prompt, permit).await
    }
}

// ── Buffered mode ─────────────────────────────────────────────────────────────

async fn buffered_completion(
    id: String,
    params: CompletionParams,
    mut slot: Slot,
    mut sampler: Sampler,
    n_prompt: usize,
    permit: OwnedSemaphorePermit,
) -> Result<Response, ServerError> {
    let model_name = params.model.clone();

    let (content, outcome) = tokio::task::spawn_blocking(move || {
        let mut content = String::new();
        let outcome = run_sampling_loop(&mut slot, &mut sampler, &params, |piece| {
            content.push_str(piece);
            true
        });
        // Sampler goes before the slot's decode context.
        drop(sampler);
        drop(slot);
        drop(permit);
        (content, outcome)
    })
    .await
    .map_err(|e| ServerError::Internal(format!("generation task failed: {e}")))?;

    info!(
        model = %model_name,
        completion_tokens = outcome.completion_tokens,
        finish_reason = outcome.finish_reason.as_str(),
        "chat completion done"
    );

    let response = ChatCompletionResponse {
        id,
        object: "chat.completion".to_owned(),
        created: Utc::now().timestamp(),
        model: model_name,
        choices: vec![ChatChoice {
            index: 0,
            logprobs: None,
            finish_reason: Some(outcome.finish_reason.as_str().to_owned()),
            message: ChatMessage {
                role: "assistant".to_owned(),
                content,
            },
        }],
        usage: Usage {
            prompt_tokens: n_prompt,
            completion_tokens: outcome.completion_tokens,
            total_tokens: n_prompt + outcome.completion_tokens,
        },
    };
    Ok(Json(response).into_response())
}

// ── Streaming mode ────────────────────────────────────────────────────────────

/// Sends completion events as SSE frames.  Every send answers whether the
/// client is still there; the generation loop stops on the first failed
/// write.
struct SseSink {
    tx: mpsc::Sender<Event>,
    id: String,
    model: String,
}

impl SseSink {
    fn send(&self, chunk: &ChatCompletionChunk) -> bool {
        match serde_json::to_string(chunk) {
            Ok(json) => self.tx.blocking_send(Event::default().data(json)).is_ok(),
            Err(e) => {
                error!(error = %e, "failed to serialize SSE chunk");
                false
            }
        }
    }

    fn open(&self) -> bool {
        self.send(&ChatCompletionChunk::open(&self.id, &self.model))
    }

    fn emit_piece(&self, piece: &str) -> bool {
        self.send(&ChatCompletionChunk::piece(&self.id, &self.model, piece))
    }

    fn finish(&self, finish_reason: &str) {
        if self.send(&ChatCompletionChunk::finish(&self.id, &self.model, finish_reason)) {
            let _ = self.tx.blocking_send(Event::default().data("[DONE]"));
        }
    }
}

fn stream_completion(
    id: String,
    params: CompletionParams,
    mut slot: Slot,
    mut sampler: Sampler,
    permit: OwnedSemaphorePermit,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let sink = SseSink {
        tx,
        id,
        model: params.model.clone(),
    };

    tokio::task::spawn_blocking(move || {
        if sink.open() {
            let outcome =
                run_sampling_loop(&mut slot, &mut sampler, &params, |piece| sink.emit_piece(piece));
            if outcome.aborted {
                debug!("client went away; stream aborted");
            } else {
                sink.finish(outcome.finish_reason.as_str());
                info!(
                    model = %params.model,
                    completion_tokens = outcome.completion_tokens,
                    finish_reason = outcome.finish_reason.as_str(),
                    "chat completion streamed"
                );
            }
        }
        drop(sampler);
        drop(slot);
        drop(permit);
    });

    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).into_response()
}

// ── Sampling loop ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

struct LoopOutcome {
    finish_reason: FinishReason,
    completion_tokens: usize,
    aborted: bool,
}

/// The autoregressive core: sample, accept, emit, evaluate — strictly in
/// order, until an end-of-generation token, a stop sequence, the token
/// budget, the context window, or a dead connection ends it.
fn run_sampling_loop(
    slot: &mut Slot,
    sampler: &mut Sampler,
    params: &CompletionParams,
    mut emit: impl FnMut(&str) -> bool,
) -> LoopOutcome {
    let model = Arc::clone(slot.model());
    let mut generated: Vec<Token> = Vec::new();
    let mut completion_tokens = 0usize;
    let mut finish_reason = FinishReason::Length;
    let mut aborted = false;

    while params.max_tokens < 0 || (completion_tokens as i64) < params.max_tokens {
        let token = match sampler.sample(slot) {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "sampling failed");
                break;
            }
        };
        sampler.accept(slot, token, true);
        if model.token_is_eog(token) {
            finish_reason = FinishReason::Stop;
            break;
        }
        completion_tokens += 1;
        generated.push(token);
        let piece = match model.token_to_piece(token, false) {
            Ok(piece) => piece,
            Err(e) => {
                error!(error = %e, "token has no piece");
                break;
            }
        };
        if !emit(&piece) {
            aborted = true;
            break;
        }
        if params
            .stop
            .iter()
            .any(|stop| !stop.is_empty() && generated.ends_with(stop))
        {
            finish_reason = FinishReason::Stop;
            break;
        }
        if let Err(e) = slot.eval_token(token) {
            warn!(error = %e, "ran out of context window");
            break;
        }
    }

    LoopOutcome {
        finish_reason,
        completion_tokens,
        aborted,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        == Some("application/json")
}

const ID_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Fresh completion id: `chatcmpl-` plus two 64-bit draws rendered as
/// twelve base-32 characters each.
fn completion_id() -> String {
    let mut id = String::with_capacity(9 + 24);
    id.push_str("chatcmpl-");
    for _ in 0..2 {
        let mut word: u64 = rand::random();
        for _ in 0..12 {
            id.push(ID_ALPHABET[(word & 31) as usize] as char);
            word >>= 5;
        }
    }
    id
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::routes;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use loom_engine::testing::StubModel;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app_with(model: StubModel) -> Router {
        let config = Config {
            enable_swagger: false,
            ..Config::default()
        };
        routes::build(AppState::new(config, model.into_model()))
    }

    /// A model scripted to say "ok" and stop.
    fn ok_model() -> StubModel {
        let mut stub = StubModel::new();
        let ok = stub.add_piece("ok");
        stub.with_script(&[ok])
    }

    fn request_body(stream: bool) -> Value {
        serde_json::to_value(ChatCompletionRequest {
            model: "m".to_owned(),
            messages: vec![ChatMessage {
                role: "user".to_owned(),
                content: "hi".to_owned(),
            }],
            stream,
            ..Default::default()
        })
        .unwrap()
    }

    fn post(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.expect("request failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collect failed")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, request).await;
        let json = serde_json::from_str(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn error_message(body: &Value) -> &str {
        body["error"].as_str().unwrap_or("")
    }

    /// Raw-template prompt token count for a single-user-message request:
    /// one token per byte plus BOS.
    fn prompt_tokens_for(content: &str) -> usize {
        format!("User: {content}\nAssistant: ").len() + 1
    }

    #[tokio::test]
    async fn get_method_is_rejected() {
        let request = Request::builder()
            .method("GET")
            .uri("/v1/chat/completions")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app_with(ok_model()), request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn non_json_content_type_is_not_implemented() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send_json(app_with(ok_model()), request).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(error_message(&body), "Content Type Not Implemented");
    }

    #[tokio::test]
    async fn json_charset_parameter_is_accepted() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(request_body(false).to_string()))
            .unwrap();
        let (status, _) = send_json(app_with(ok_model()), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{nope"))
            .unwrap();
        let (status, _) = send(app_with(ok_model()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_object_body_is_bad_request() {
        let (status, body) = send_json(app_with(ok_model()), post(&json!([1, 2]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "JSON body must be an object");
    }

    #[tokio::test]
    async fn validation_errors_surface_through_http() {
        let (status, body) = send_json(
            app_with(ok_model()),
            post(&json!({"messages": [{"role": "user", "content": "x"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "JSON missing model string");

        let (status, body) = send_json(
            app_with(ok_model()),
            post(&json!({"model": "m", "messages": [{"role": "bot", "content": "x"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "message role not system user assistant");

        let mut with_tools = request_body(false);
        with_tools["tools"] = json!([{"type": "function"}]);
        let (status, body) = send_json(app_with(ok_model()), post(&with_tools)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "OpenAI tools field not supported");
    }

    #[tokio::test]
    async fn buffered_completion_matches_the_contract() {
        let (status, body) = send_json(app_with(ok_model()), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "m");
        assert!(body["created"].as_i64().unwrap() > 0);

        let id = body["id"].as_str().unwrap();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 24);
        assert!(id["chatcmpl-".len()..]
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='5')));

        let choices = body["choices"].as_array().unwrap();
        assert_eq!(choices.len(), 1);
        let choice = &choices[0];
        assert_eq!(choice["index"], 0);
        assert!(choice.get("logprobs").unwrap().is_null());
        assert_eq!(choice["finish_reason"], "stop");
        assert_eq!(choice["message"]["role"], "assistant");
        assert_eq!(choice["message"]["content"], "ok");

        let expected_prompt = prompt_tokens_for("hi");
        assert_eq!(body["usage"]["prompt_tokens"], expected_prompt as i64);
        assert_eq!(body["usage"]["completion_tokens"], 1);
        assert_eq!(body["usage"]["total_tokens"], (expected_prompt + 1) as i64);
    }

    #[tokio::test]
    async fn completion_ids_are_distinct() {
        let (_, first) = send_json(app_with(ok_model()), post(&request_body(false))).await;
        let (_, second) = send_json(app_with(ok_model()), post(&request_body(false))).await;
        assert_ne!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn streaming_completion_emits_the_frame_sequence() {
        let response = app_with(ok_model())
            .oneshot(post(&request_body(true)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .starts_with("text/event-stream"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.strip_prefix("data: ").expect("frame must be data:"))
            .collect();
        assert!(frames.len() >= 4, "expected at least 4 frames: {frames:?}");

        let open: Value = serde_json::from_str(frames[0]).unwrap();
        assert_eq!(open["object"], "chat.completion");
        assert_eq!(open["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(open["choices"][0]["delta"]["content"], "");
        assert!(open["choices"][0]["finish_reason"].is_null());

        let final_frame: Value = serde_json::from_str(frames[frames.len() - 2]).unwrap();
        assert_eq!(final_frame["choices"][0]["finish_reason"], "stop");
        assert_eq!(final_frame["choices"][0]["delta"]["content"], "");

        assert_eq!(*frames.last().unwrap(), "[DONE]");

        // Concatenated deltas reproduce the buffered content.
        let mut streamed = String::new();
        for frame in &frames[..frames.len() - 1] {
            let chunk: Value = serde_json::from_str(frame).unwrap();
            streamed.push_str(chunk["choices"][0]["delta"]["content"].as_str().unwrap());
        }
        assert_eq!(streamed, "ok");
    }

    #[tokio::test]
    async fn max_tokens_zero_generates_nothing() {
        let mut body = request_body(false);
        body["max_tokens"] = json!(0);
        let (status, body) = send_json(app_with(ok_model()), post(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "");
        assert_eq!(body["choices"][0]["finish_reason"], "length");
        assert_eq!(body["usage"]["completion_tokens"], 0);
    }

    #[tokio::test]
    async fn max_tokens_caps_generation_as_length() {
        let model = StubModel::new().with_script(&[97, 98, 99]);
        let mut body = request_body(false);
        body["max_tokens"] = json!(2);
        let (status, body) = send_json(app_with(model), post(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ab");
        assert_eq!(body["choices"][0]["finish_reason"], "length");
        assert_eq!(body["usage"]["completion_tokens"], 2);
    }

    #[tokio::test]
    async fn prompt_filling_all_but_one_token_is_accepted() {
        let n_ctx = prompt_tokens_for("hi") + 1;
        let mut stub = StubModel::new().with_n_ctx(n_ctx);
        let ok = stub.add_piece("ok");
        let model = stub.with_script(&[ok]);
        let (status, body) = send_json(app_with(model), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
    }

    #[tokio::test]
    async fn prompt_filling_the_whole_window_is_rejected() {
        let n_ctx = prompt_tokens_for("hi");
        let model = StubModel::new().with_n_ctx(n_ctx);
        let (status, body) = send_json(app_with(model), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "prompt too big for model context size");
    }

    #[tokio::test]
    async fn context_exhaustion_mid_generation_finishes_as_length() {
        // Room for the prompt plus exactly one evaluated token: the second
        // generated piece still goes out, then its eval hits the window and
        // the loop exits with "length".
        let n_ctx = prompt_tokens_for("hi") + 1;
        let model = StubModel::new()
            .with_n_ctx(n_ctx)
            .with_script(&[97, 98, 99]);
        let (status, body) = send_json(app_with(model), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ab");
        assert_eq!(body["choices"][0]["finish_reason"], "length");
        assert_eq!(body["usage"]["completion_tokens"], 2);
    }

    #[tokio::test]
    async fn slot_start_failure_is_internal_error() {
        let model = StubModel::new().with_failing_decoder_create();
        let (status, _) = send_json(app_with(model), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn prefill_failure_is_internal_error() {
        let model = StubModel::new().with_failing_decode();
        let (status, body) = send_json(app_with(model), post(&request_body(false))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_message(&body), "prompt prefill failed");
    }

    #[tokio::test]
    async fn stop_sequence_halts_generation() {
        let model = StubModel::new().with_script(&[97, 98, 99]);
        let mut body = request_body(false);
        body["stop"] = json!("b");
        let (status, body) = send_json(app_with(model), post(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ab");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["completion_tokens"], 2);
    }

    #[tokio::test]
    async fn json_object_response_format_constrains_output() {
        let n = StubModel::BASE_VOCAB;
        let mut rows = Vec::new();
        // The script pushes hard for plain text; the grammar must redirect
        // it to a JSON object.
        let mut row0 = vec![-10.0f32; n];
        row0[b'x' as usize] = 5.0;
        row0[b'{' as usize] = 4.0;
        let mut row1 = vec![-10.0f32; n];
        row1[b'x' as usize] = 5.0;
        row1[b'}' as usize] = 4.0;
        rows.push(row0);
        rows.push(row1);
        rows.push(vec![-10.0f32; n]);
        let model = StubModel::new().with_logit_rows(rows);

        let mut body = request_body(false);
        body["temperature"] = json!(0);
        body["response_format"] = json!({"type": "json_object"});
        let (status, body) = send_json(app_with(model), post(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "{}");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn bad_json_schema_is_bad_request() {
        let mut body = request_body(false);
        body["response_format"] = json!({"type": "json_schema", "json_schema": {"type": "frob"}});
        let (status, body) = send_json(app_with(ok_model()), post(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_message(&body), "bad json schema");
    }

    #[tokio::test]
    async fn identical_seeds_replay_identical_outputs() {
        fn sampled_model() -> StubModel {
            let n = StubModel::BASE_VOCAB;
            let mut row = vec![-10.0f32; n];
            row[97] = 1.0;
            row[98] = 0.9;
            row[99] = 0.8;
            StubModel::new().with_logit_rows(vec![row; 6])
        }

        let mut contents = Vec::new();
        for _ in 0..2 {
            let mut body = request_body(false);
            body["temperature"] = json!(0.9);
            body["seed"] = json!(11);
            body["max_tokens"] = json!(6);
            let (status, body) = send_json(app_with(sampled_model()), post(&body)).await;
            assert_eq!(status, StatusCode::OK);
            contents.push(body["choices"][0]["message"]["content"].clone());
        }
        assert_eq!(contents[0], contents[1]);
    }

    #[tokio::test]
    async fn models_route_lists_the_configured_model() {
        let request = Request::builder()
            .method("GET")
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(app_with(ok_model()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "default");
        assert_eq!(body["data"][0]["object"], "model");
    }
}
