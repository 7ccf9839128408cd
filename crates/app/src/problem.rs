use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use tenant_router_core::ContextError;
use tenant_router_storage::{RegistryError, StoreError};

use crate::admin::AdminError;
use crate::directory::ResolveError;
use crate::identity::IdentityError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    fn from_error(status: StatusCode, problem_type: &'static str, err: &dyn std::fmt::Display) -> Self {
        Self::new(status, problem_type, err.to_string())
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<IdentityError> for ProblemResponse {
    fn from(err: IdentityError) -> Self {
        let (status, kind) = match &err {
            IdentityError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
            IdentityError::InvalidIdentifier { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_tenant_identifier")
            }
            IdentityError::Missing => (StatusCode::BAD_REQUEST, "tenant_identity_missing"),
        };
        Self::from_error(status, kind, &err)
    }
}

impl From<ResolveError> for ProblemResponse {
    fn from(err: ResolveError) -> Self {
        let (status, kind) = match &err {
            ResolveError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "tenant_not_found"),
            ResolveError::TenantInactive(_) => (StatusCode::FORBIDDEN, "tenant_inactive"),
            ResolveError::RegistryUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "registry_unavailable")
            }
            ResolveError::Registry(_) => (StatusCode::INTERNAL_SERVER_ERROR, "registry_error"),
        };
        Self::from_error(status, kind, &err)
    }
}

impl From<ContextError> for ProblemResponse {
    fn from(err: ContextError) -> Self {
        let kind = match &err {
            ContextError::NoTenantContext => "no_tenant_context",
            ContextError::TenantSwitch { .. } => "tenant_switch_rejected",
        };
        Self::from_error(StatusCode::INTERNAL_SERVER_ERROR, kind, &err)
    }
}

impl From<StoreError> for ProblemResponse {
    fn from(err: StoreError) -> Self {
        let (status, kind) = match &err {
            StoreError::NoTenantContext => (StatusCode::INTERNAL_SERVER_ERROR, "no_tenant_context"),
            StoreError::Connect { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "tenant_store_unavailable")
            }
            StoreError::TargetMismatch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "tenant_store_mismatch")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "tenant_store_error"),
        };
        Self::from_error(status, kind, &err)
    }
}

impl From<AdminError> for ProblemResponse {
    fn from(err: AdminError) -> Self {
        let (status, kind) = match &err {
            AdminError::NotFound => (StatusCode::NOT_FOUND, "tenant_not_found"),
            AdminError::InvalidSlug { .. } => (StatusCode::BAD_REQUEST, "invalid_slug"),
            AdminError::InvalidDomain(_) => (StatusCode::BAD_REQUEST, "invalid_domain"),
            AdminError::Conflict(_) => (StatusCode::CONFLICT, "tenant_conflict"),
            AdminError::TargetInUse { .. } => (StatusCode::CONFLICT, "data_store_in_use"),
            AdminError::Provision(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "tenant_provisioning_failed")
            }
            AdminError::Registry(inner) if inner.is_transient() => {
                (StatusCode::SERVICE_UNAVAILABLE, "registry_unavailable")
            }
            AdminError::Registry(_) => (StatusCode::INTERNAL_SERVER_ERROR, "registry_error"),
        };
        Self::from_error(status, kind, &err)
    }
}

impl From<RegistryError> for ProblemResponse {
    fn from(err: RegistryError) -> Self {
        Self::from(AdminError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tenant_router_core::TenantSlug;

    async fn render(problem: ProblemResponse) -> (StatusCode, serde_json::Value) {
        let response = problem.into_response();
        let status = response.status();
        assert_eq!(
            response.headers()["content-type"],
            "application/problem+json"
        );
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn resolution_failures_map_to_distinct_statuses() {
        let (status, body) =
            render(ResolveError::TenantNotFound("slug:ghost".to_string()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "tenant_not_found");

        let inactive = ResolveError::TenantInactive(TenantSlug::parse("acme").expect("slug"));
        let (status, body) = render(inactive.into()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["title"], "Forbidden");

        let unavailable = ResolveError::RegistryUnavailable {
            attempts: 3,
            reason: "pool closed".to_string(),
        };
        let (status, _) = render(unavailable.into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn missing_context_is_a_server_error() {
        let (status, body) = render(StoreError::NoTenantContext.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["type"], "no_tenant_context");
    }
}
