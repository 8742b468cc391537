use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::error;

use crate::store::Tenant;

use super::{error_response, GatewayState};

const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    tenant_id: String,
    name: String,
    api_key: String,
    #[serde(default)]
    rpm_limit: u32,
    #[serde(default)]
    tpm_limit: u32,
    #[serde(default)]
    allowed_models: Vec<String>,
}

/// `POST /admin/tenants`. Only mounted when an admin key is configured;
/// the router never exposes this path otherwise.
pub(crate) async fn create_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if state.admin_key.as_deref() != presented {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid Admin Key");
    }

    let request: CreateTenantRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };
    if request.tenant_id.is_empty() || request.name.is_empty() || request.api_key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "tenant_id, name and api_key are required",
        );
    }

    let tenant = Tenant {
        tenant_id: request.tenant_id,
        name: request.name,
        api_key: request.api_key,
        rpm_limit: request.rpm_limit,
        tpm_limit: request.tpm_limit,
        allowed_models: request.allowed_models,
        active: true,
    }
    .with_defaults();

    if let Err(err) = state.directory.create(tenant.clone()).await {
        error!(error = %err, tenant_id = %tenant.tenant_id, "failed to create tenant");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create tenant");
    }

    (StatusCode::CREATED, Json(tenant)).into_response()
}
