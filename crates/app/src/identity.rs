use std::str::FromStr;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use tenant_router_core::{context, TenantId, TenantSlug};

use crate::directory::LookupKey;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Validates bearer tokens carrying a `tenant_switch` claim.
#[derive(Clone)]
pub struct TenantClaimsValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TenantClaimsValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Returns the tenant the token switches to, if it names one.
    pub fn tenant_switch(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, IdentityError> {
        let claims = decode::<TenantClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))?
            .claims;

        let now_ts = now.timestamp();
        if let Some(nbf) = claims.nbf {
            if now_ts < nbf {
                return Err(IdentityError::InvalidToken("token_not_yet_valid".to_string()));
            }
        }
        if now_ts >= claims.exp {
            return Err(IdentityError::InvalidToken("token_expired".to_string()));
        }

        Ok(claims
            .tenant_switch
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TenantClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    /// Tenant id or slug the caller acts for.
    #[serde(default)]
    pub tenant_switch: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid bearer token: {0}")]
    InvalidToken(String),
    #[error("invalid tenant identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },
    #[error("request does not identify a tenant")]
    Missing,
}

/// Picks the tenant identity of a request.
///
/// Precedence: `tenant_switch` claim of a valid bearer token, then the `Host`
/// header (custom domain before subdomain). Unsigned headers never select a
/// tenant.
pub fn extract_identity(
    headers: &HeaderMap,
    claims: Option<&TenantClaimsValidator>,
    now: DateTime<Utc>,
) -> Result<LookupKey, IdentityError> {
    if let (Some(validator), Some(token)) = (claims, bearer_token(headers)) {
        if let Some(switch) = validator.tenant_switch(token, now)? {
            return Ok(match TenantId::from_str(&switch) {
                Ok(id) => LookupKey::Id(id),
                Err(_) => LookupKey::Slug(parse_slug(&switch)?),
            });
        }
    }

    if let Some(host) = header_value(headers, header::HOST.as_str()) {
        return Ok(LookupKey::host(host));
    }

    Err(IdentityError::Missing)
}

fn parse_slug(value: &str) -> Result<TenantSlug, IdentityError> {
    TenantSlug::parse(value).map_err(|err| IdentityError::InvalidIdentifier {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_value(headers, header::AUTHORIZATION.as_str())?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves the request's tenant and runs the rest of the stack inside its scope.
pub async fn tenant_scope(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = match extract_identity(request.headers(), state.claims(), state.now()) {
        Ok(key) => key,
        Err(err) => {
            debug!(stage = "identity", error = %err, "request identity rejected");
            return ProblemResponse::from(err).into_response();
        }
    };

    let tenant = match state.directory().resolve(&key).await {
        Ok(tenant) => tenant,
        Err(err) => {
            warn!(stage = "identity", key = %key, reason = err.reason(), error = %err, "tenant resolution failed");
            return ProblemResponse::from(err).into_response();
        }
    };

    debug!(stage = "context", tenant = %tenant.slug(), scope_id = %tenant.scope_id(), version = tenant.record_version(), "tenant context established");
    let span = info_span!(
        "tenant_request",
        tenant = %tenant.slug(),
        scope_id = %tenant.scope_id()
    );
    match context::establish(tenant, next.run(request))
        .instrument(span)
        .await
    {
        Ok(response) => response,
        Err(err) => ProblemResponse::from(err).into_response(),
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &[u8], claims: &TenantClaims) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).expect("sign token")
}
