use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use serde_json::json;
use tracing::{error, warn};

use crate::metrics::GatewayMetrics;
use crate::store::Tenant;

use super::{error_response, GatewayState};

/// Response-extension labels consumed by the metrics middleware. The
/// auth filter attaches the tenant, the proxy handler the model; absent
/// labels render as "unknown".
#[derive(Clone)]
pub(crate) struct TenantLabel(pub String);

#[derive(Clone)]
pub(crate) struct ModelLabel(pub String);

/// Outermost middleware: observes status, latency and label context for
/// every request. The observation fires when the response body closes
/// (normal end or abandonment), so streamed responses count their full
/// wall time.
pub(crate) async fn observe(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();

    let response = next.run(req).await;

    let recorder = RequestRecorder {
        metrics: state.metrics.clone(),
        method,
        status: response.status().as_u16(),
        tenant_id: label(&response, |l: &TenantLabel| l.0.clone()),
        model: label(&response, |l: &ModelLabel| l.0.clone()),
        start,
    };
    let (parts, body) = response.into_parts();
    let body = Body::from_stream(ObservedBody {
        inner: body.into_data_stream(),
        _recorder: recorder,
    });
    Response::from_parts(parts, body)
}

fn label<L: Send + Sync + 'static>(response: &Response, get: impl Fn(&L) -> String) -> String {
    response
        .extensions()
        .get::<L>()
        .map(get)
        .unwrap_or_else(|| "unknown".to_string())
}

struct RequestRecorder {
    metrics: Arc<GatewayMetrics>,
    method: String,
    status: u16,
    tenant_id: String,
    model: String,
    start: Instant,
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        self.metrics.record_request(
            &self.method,
            self.status,
            &self.tenant_id,
            &self.model,
            self.start.elapsed(),
        );
    }
}

struct ObservedBody {
    inner: BodyDataStream,
    _recorder: RequestRecorder,
}

impl Stream for ObservedBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Requires `Authorization: Bearer <key>` (exactly two tokens) and a
/// known, active tenant. Unknown key and inactive tenant produce the
/// same response.
pub(crate) async fn authenticate(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let Some(header) = req.headers().get(header::AUTHORIZATION) else {
        return unauthorized("Missing Authorization header");
    };
    let Ok(header) = header.to_str() else {
        return unauthorized("Invalid Authorization header format");
    };
    let parts: Vec<&str> = header.split(' ').collect();
    if parts.len() != 2 || parts[0] != "Bearer" {
        return unauthorized("Invalid Authorization header format");
    }

    let tenant = match state.directory.lookup(parts[1]).await {
        Ok(tenant) => tenant,
        Err(err) => {
            warn!(error = %err, ip = %client_ip, "failed to validate tenant");
            return unauthorized("Invalid API Key");
        }
    };
    let Some(tenant) = tenant else {
        warn!(ip = %client_ip, "tenant not found for key");
        return unauthorized("Invalid API Key");
    };

    let tenant_id = tenant.tenant_id.clone();
    req.extensions_mut().insert(Arc::new(tenant));

    let mut response = next.run(req).await;
    response.extensions_mut().insert(TenantLabel(tenant_id));
    response
}

fn unauthorized(message: &str) -> Response {
    error_response(StatusCode::UNAUTHORIZED, message)
}

/// Fixed-window admission. RPM is incremented before the check, so a
/// rejected request still consumes quota; callers observing 429s are
/// expected to back off. TPM gates on consumption from prior requests
/// in the same minute (the current request's size is unknown here).
/// Counter-store errors fail closed.
pub(crate) async fn admit(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let Some(tenant) = req.extensions().get::<Arc<Tenant>>().cloned() else {
        error!(path = %req.uri().path(), "tenant context missing");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Tenant context missing");
    };

    let current_rpm = match state.counters.increment_rpm(&tenant.tenant_id).await {
        Ok(count) => count,
        Err(err) => {
            error!(error = %err, tenant_id = %tenant.tenant_id, "rate limit check failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Rate limit check failed");
        }
    };
    if current_rpm > i64::from(tenant.rpm_limit) {
        warn!(
            tenant_id = %tenant.tenant_id,
            limit = tenant.rpm_limit,
            current = current_rpm,
            "rate limit exceeded (RPM)"
        );
        return quota_exceeded("RPM", tenant.rpm_limit);
    }

    let current_tpm = match state.counters.get_tpm(&tenant.tenant_id).await {
        Ok(count) => count,
        Err(err) => {
            error!(error = %err, tenant_id = %tenant.tenant_id, "rate limit check failed (TPM)");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Rate limit check failed (TPM)",
            );
        }
    };
    if current_tpm > i64::from(tenant.tpm_limit) {
        warn!(
            tenant_id = %tenant.tenant_id,
            limit = tenant.tpm_limit,
            current = current_tpm,
            "rate limit exceeded (TPM)"
        );
        return quota_exceeded("TPM", tenant.tpm_limit);
    }

    next.run(req).await
}

fn quota_exceeded(kind: &str, limit: u32) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": format!("Rate limit exceeded ({kind})"),
            "limit": limit,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    response
}
