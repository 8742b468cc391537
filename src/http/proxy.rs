use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::BytesMut;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

use crate::breaker::BreakerOpen;
use crate::metrics::GatewayMetrics;
use crate::store::{CounterStore, Tenant, UsageRecord, UsageSink};
use crate::supervisor::Supervisor;

use super::middleware::ModelLabel;
use super::{error_response, GatewayState};

/// Hard cap applied before parsing, to keep one caller from holding the
/// gateway's memory hostage.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MAX_MESSAGES: usize = 50;

const DEFAULT_RETRY_MAX: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 100;
const RETRY_FACTOR: f64 = 2.0;

const RETRY_MAX_HEADER: &str = "x-llm-retry-max";
const RETRY_BACKOFF_HEADER: &str = "x-llm-retry-backoff-ms";

const USAGE_APPEND_ATTEMPTS: u32 = 3;

/// The fields the gateway inspects. Everything else in the body passes
/// through to the upstream untouched, because the original bytes are
/// forwarded, not a re-serialization.
#[derive(Debug, Default, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    #[allow(dead_code)]
    role: String,
    #[serde(default)]
    #[allow(dead_code)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: String,
}

pub(crate) async fn chat_completions(
    State(state): State<GatewayState>,
    req: Request,
) -> Response {
    let start = Instant::now();
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    let Some(tenant) = req.extensions().get::<Arc<Tenant>>().cloned() else {
        error!(path = %req.uri().path(), "tenant context missing");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Tenant context missing");
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match read_body_capped(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(BodyError::TooLarge) => {
            warn!(tenant_id = %tenant.tenant_id, "request body too large");
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (limit: 10MB)",
            );
        }
        Err(BodyError::Read(err)) => {
            error!(error = %err, "failed to read body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let chat: ChatRequest = match serde_json::from_slice(&body_bytes) {
        Ok(chat) => chat,
        Err(err) => {
            warn!(error = %err, tenant_id = %tenant.tenant_id, "invalid JSON body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
        }
    };

    if chat.messages.len() > MAX_MESSAGES {
        warn!(
            count = chat.messages.len(),
            tenant_id = %tenant.tenant_id,
            "too many messages"
        );
        return error_response(
            StatusCode::BAD_REQUEST,
            "Too many messages in conversation (max: 50)",
        );
    }

    if !tenant.allows_model(&chat.model) {
        warn!(tenant_id = %tenant.tenant_id, model = %chat.model, "model not allowed for this tenant");
        return error_response(StatusCode::FORBIDDEN, "Model not allowed for this tenant");
    }

    let descriptor = match state.catalog.lookup(&chat.model).await {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            warn!(tenant_id = %tenant.tenant_id, model = %chat.model, "model configuration not found");
            return error_response(StatusCode::NOT_FOUND, "Model configuration not found");
        }
        Err(err) => {
            error!(error = %err, model = %chat.model, "failed to resolve model config");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to resolve model config",
            );
        }
    };
    if descriptor.base_urls.is_empty() {
        error!(model = %chat.model, "no base URLs configured for model");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Misconfigured model: no base URLs",
        );
    }

    let credential = std::env::var(&descriptor.api_key_env).unwrap_or_default();
    if credential.is_empty() {
        warn!(env_var = %descriptor.api_key_env, model = %chat.model, "API key env var not set for model");
    }

    let policy = RetryPolicy::from_headers(&parts.headers);
    let mut upstream_headers = parts.headers.clone();
    sanitize_upstream_headers(&mut upstream_headers, &credential);

    // Retry with failover: rotate through the candidate URLs on each
    // failure and wrap around while the attempt budget lasts.
    let mut attempt: u32 = 0;
    let mut url_index: usize = 0;
    let mut last_error: Option<String> = None;
    let mut upstream_response: Option<reqwest::Response> = None;

    while attempt <= policy.retry_max {
        let url = &descriptor.base_urls[url_index % descriptor.base_urls.len()];
        info!(
            attempt,
            url = %url,
            stream = chat.stream,
            tenant_id = %tenant.tenant_id,
            "attempting upstream"
        );

        match state.breaker.acquire() {
            Err(BreakerOpen) => {
                warn!(model = %chat.model, "circuit breaker open");
                last_error = Some(BreakerOpen.to_string());
                upstream_response = None;
                break;
            }
            Ok(permit) => {
                let result = state
                    .client
                    .post(url)
                    .headers(upstream_headers.clone())
                    .body(body_bytes.clone())
                    .send()
                    .await;
                match result {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        permit.record(status < 500 && status != 429);
                        last_error = None;
                        upstream_response = Some(response);
                    }
                    Err(err) => {
                        permit.record(false);
                        last_error = Some(err.to_string());
                        upstream_response = None;
                    }
                }
            }
        }

        if last_error.is_none() {
            if let Some(response) = upstream_response.as_ref() {
                let status = response.status().as_u16();
                if status < 500 && status != 429 {
                    break;
                }
            }
        }

        attempt += 1;
        url_index += 1;

        if attempt <= policy.retry_max {
            let rate_limited = upstream_response
                .as_ref()
                .is_some_and(|response| response.status().as_u16() == 429);
            if rate_limited {
                // Fail fast to the backup provider; its quota is
                // independent of the one that was just exhausted.
                info!(url = %url, "rate limited (429), failing over immediately");
                continue;
            }
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    if let Some(err) = last_error {
        error!(error = %err, model = %chat.model, "upstream provider failed after retries");
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "Upstream provider failed", "details": err })),
        )
            .into_response();
    }
    let upstream = match upstream_response {
        Some(response) if response.status().as_u16() >= 500 => {
            let status = response.status().as_u16();
            error!(status, model = %chat.model, "upstream provider returned 5xx after retries");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "Upstream provider error", "status": status })),
            )
                .into_response();
        }
        Some(response) => response,
        None => return error_response(StatusCode::BAD_GATEWAY, "Upstream provider failed"),
    };

    info!(
        status = upstream.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        tenant_id = %tenant.tenant_id,
        model = %chat.model,
        "proxy request completed"
    );

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let input_tokens = (body_bytes.len() / 4) as u64;

    let guard = UsageGuard {
        supervisor: state.supervisor.clone(),
        counters: state.counters.clone(),
        usage: state.usage.clone(),
        metrics: state.metrics.clone(),
        tenant_id: tenant.tenant_id.clone(),
        model_id: chat.model.clone(),
        timestamp,
        input_tokens,
        output_tokens: 0,
    };

    let body = if chat.stream {
        let reader = BufReader::new(StreamReader::new(
            upstream.bytes_stream().map_err(std::io::Error::other),
        ));
        streaming_body(reader.lines(), guard, start)
    } else {
        let bytes = upstream.bytes().await.unwrap_or_default();
        let mut guard = guard;
        guard.add_output_tokens((bytes.len() / 4) as u64);
        drop(guard);
        Body::from(bytes)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response.extensions_mut().insert(ModelLabel(chat.model));
    response
}

enum BodyError {
    TooLarge,
    Read(axum::Error),
}

async fn read_body_capped(body: Body, max_bytes: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffered = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buffered.len().saturating_add(chunk.len()) > max_bytes {
            return Err(BodyError::TooLarge);
        }
        buffered.extend_from_slice(&chunk);
    }
    Ok(buffered.freeze())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RetryPolicy {
    retry_max: u32,
    backoff_ms: u64,
}

impl RetryPolicy {
    /// Header overrides, clipped to sane ranges; out-of-range values
    /// fall back to the defaults rather than erroring.
    fn from_headers(headers: &HeaderMap) -> Self {
        let mut policy = Self {
            retry_max: DEFAULT_RETRY_MAX,
            backoff_ms: DEFAULT_BACKOFF_MS,
        };
        if let Some(value) = header_i64(headers, RETRY_MAX_HEADER) {
            if (0..=10).contains(&value) {
                policy.retry_max = value as u32;
            }
        }
        if let Some(value) = header_i64(headers, RETRY_BACKOFF_HEADER) {
            if value >= 0 {
                policy.backoff_ms = value as u64;
            }
        }
        policy
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = RETRY_FACTOR.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.backoff_ms as f64 * factor) as u64)
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Strips hop-by-hop and gateway-internal headers and swaps the caller's
/// credential for the upstream one. Content-Length is recomputed by the
/// client for the forwarded body.
fn sanitize_upstream_headers(headers: &mut HeaderMap, credential: &str) {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(RETRY_MAX_HEADER);
    headers.remove(RETRY_BACKOFF_HEADER);
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {credential}")) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// Approximate tokens carried by one SSE line: `len/4` over
/// `choices[0].delta.content` of a `data: ` payload. Counting must never
/// break the stream, so anything unparseable contributes zero.
fn delta_content_tokens(line: &str) -> u64 {
    let Some(payload) = line.strip_prefix("data: ") else {
        return 0;
    };
    if payload == "[DONE]" {
        return 0;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .first()
            .map(|choice| (choice.delta.content.len() / 4) as u64)
            .unwrap_or(0),
        Err(_) => 0,
    }
}

struct StreamPump<R> {
    lines: Lines<R>,
    guard: UsageGuard,
    start: Instant,
    saw_first_line: bool,
}

/// Line-by-line SSE passthrough. Each upstream line is forwarded with a
/// trailing newline as soon as it arrives; TTFT is observed on the first
/// one. When the pump winds down (normal end, upstream error, or the
/// caller going away) the guard it owns fires the deferred bookkeeping
/// with whatever was accumulated.
fn streaming_body<R>(lines: Lines<R>, guard: UsageGuard, start: Instant) -> Body
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    let pump = StreamPump {
        lines,
        guard,
        start,
        saw_first_line: false,
    };
    Body::from_stream(stream::unfold(pump, |mut pump| async move {
        match pump.lines.next_line().await {
            Ok(Some(line)) => {
                if !pump.saw_first_line {
                    pump.saw_first_line = true;
                    pump.guard.record_ttft(pump.start.elapsed().as_secs_f64());
                }
                pump.guard.add_output_tokens(delta_content_tokens(&line));
                let mut chunk = line.into_bytes();
                chunk.push(b'\n');
                Some((Ok::<_, std::io::Error>(Bytes::from(chunk)), pump))
            }
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "upstream stream ended early");
                None
            }
        }
    }))
}

/// Carries the accounting payload across the task boundary. Dropping the
/// guard (response delivered or abandoned) records token metrics and
/// schedules the background task: one best-effort TPM increment, then
/// the usage append with bounded retry. Only business data crosses over,
/// never the caller's context, so client disconnect cannot lose usage.
struct UsageGuard {
    supervisor: Supervisor,
    counters: Arc<dyn CounterStore>,
    usage: Arc<dyn UsageSink>,
    metrics: Arc<GatewayMetrics>,
    tenant_id: String,
    model_id: String,
    timestamp: String,
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageGuard {
    fn add_output_tokens(&mut self, tokens: u64) {
        self.output_tokens += tokens;
    }

    fn record_ttft(&self, seconds: f64) {
        self.metrics
            .record_ttft(&self.tenant_id, &self.model_id, seconds);
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.metrics.record_tokens(
            &self.tenant_id,
            &self.model_id,
            self.input_tokens,
            self.output_tokens,
        );

        let record = UsageRecord {
            tenant_id: std::mem::take(&mut self.tenant_id),
            timestamp: std::mem::take(&mut self.timestamp),
            request_id: uuid::Uuid::new_v4().to_string(),
            model_id: std::mem::take(&mut self.model_id),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        };
        let counters = self.counters.clone();
        let usage = self.usage.clone();
        self.supervisor
            .spawn(async move { write_usage(counters, usage, record).await });
    }
}

async fn write_usage(
    counters: Arc<dyn CounterStore>,
    usage: Arc<dyn UsageSink>,
    record: UsageRecord,
) {
    let total = (record.input_tokens + record.output_tokens) as i64;
    if let Err(err) = counters.increment_tpm(&record.tenant_id, total).await {
        error!(error = %err, tenant_id = %record.tenant_id, "failed to increment TPM");
    }

    for attempt in 1..=USAGE_APPEND_ATTEMPTS {
        match usage.append(&record).await {
            Ok(()) => return,
            Err(err) => {
                error!(attempt, error = %err, "failed to log usage, retrying");
                if attempt < USAGE_APPEND_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }
    }
    error!(
        tenant_id = %record.tenant_id,
        request_id = %record.request_id,
        "usage record dropped after retries"
    );
}
