use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    AppState,
    config::Env,
    error::ApiError,
    models::Document,
};

/// Claims
///
/// Payload expected inside a bearer JWT issued by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the id of a `User` instance.
    pub sub: Uuid,
    /// Expiration Time (exp): always validated.
    pub exp: usize,
    /// Issued At (iat).
    pub iat: usize,
}

/// Principal
///
/// The authenticated identity of a request: a live instance of the user
/// resource.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub user: Document,
}

/// MaybePrincipal
///
/// Resolves request credentials to a principal or to "none". Bad or missing
/// credentials are not an error at this stage; the generated routes decide
/// whether authentication is required. Store failures are surfaced as
/// `Upstream`.
#[derive(Debug, Clone)]
pub struct MaybePrincipal(pub Option<Principal>);

impl<S> FromRequestParts<S> for MaybePrincipal
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let Some(users) = state.registry.user_resource() else {
            return Ok(MaybePrincipal(None));
        };

        // 1. Local bypass, only when it names an existing user.
        if let Some(user_id) = bypass_subject(parts, &state) {
            if let Some(user) = state.repo.find_by_id(users.name(), user_id).await? {
                return Ok(MaybePrincipal(Some(Principal { id: user.id, user })));
            }
            tracing::debug!(%user_id, "x-user-id names no user, trying bearer token");
        }

        // 2. Bearer token. A valid token for a deleted user authenticates nobody.
        let Some(user_id) = bearer_subject(parts, &state) else {
            return Ok(MaybePrincipal(None));
        };
        let principal = state
            .repo
            .find_by_id(users.name(), user_id)
            .await?
            .map(|user| Principal { id: user.id, user });
        Ok(MaybePrincipal(principal))
    }
}

/// Principal Extractor
///
/// For handlers that always require a logged-in user; rejects with 401.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let MaybePrincipal(principal) = MaybePrincipal::from_request_parts(parts, state).await?;
        principal.ok_or_else(ApiError::unauthorized)
    }
}

/// The `x-user-id` header, honored in `Env::Local` only.
fn bypass_subject(parts: &Parts, state: &AppState) -> Option<Uuid> {
    if state.config.env != Env::Local {
        return None;
    }
    parts
        .headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// bearer_subject
///
/// The user id claimed by an HS256 JWT signed with the configured secret,
/// `exp` enforced.
fn bearer_subject(parts: &Parts, state: &AppState) -> Option<Uuid> {
    let token = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))?;

    let decoding_key = DecodingKey::from_secret(state.config.jwt_secret.as_bytes());
    let mut validation = Validation::default();
    validation.validate_exp = true;

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(data) => Some(data.claims.sub),
        Err(e) => {
            tracing::debug!("rejected bearer token: {:?}", e.kind());
            None
        }
    }
}
