use axum::{
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::AppError, models::Caller, state::AppState};

/// Claims asserted by the identity service about the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
    pub username: String,
    pub project_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub claims: CallerClaims,
}

impl AuthContext {
    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.claims.sub.clone(),
            username: self.claims.username.clone(),
            project_id: self.claims.project_id.clone(),
            roles: self.claims.roles.clone(),
        }
    }
}

pub fn decode_caller_token(token: &str, config: &Config) -> Result<AuthContext, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[config.jwt_audience.clone()]);
    validation.set_issuer(&[config.jwt_issuer.clone()]);
    validation.leeway = 30;

    let decoded = decode::<CallerClaims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::Unauthorized(format!("invalid token: {e}")))?;

    Ok(AuthContext {
        claims: decoded.claims,
    })
}

pub async fn caller_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;
    let auth = decode_caller_token(&token, &state.config)?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

/// For routes open to anonymous callers: absent credentials are fine,
/// invalid ones are not.
pub fn optional_caller(headers: &HeaderMap, config: &Config) -> Result<Option<Caller>, AppError> {
    if !headers.contains_key(header::AUTHORIZATION) {
        return Ok(None);
    }
    let token = bearer_token(headers)?;
    Ok(Some(decode_caller_token(&token, config)?.caller()))
}

pub fn issue_caller_token(claims: &CallerClaims, jwt_secret: &str) -> Result<String, AppError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("failed to sign caller token: {e}")))
}

pub fn make_caller_claims(
    issuer: &str,
    audience: &str,
    caller: &Caller,
    ttl_seconds: i64,
) -> CallerClaims {
    let now = Utc::now().timestamp() as usize;
    let exp = (Utc::now() + chrono::Duration::seconds(ttl_seconds)).timestamp() as usize;

    CallerClaims {
        iss: issuer.to_string(),
        sub: caller.user_id.clone(),
        aud: audience.to_string(),
        iat: now,
        exp,
        username: caller.username.clone(),
        project_id: caller.project_id.clone(),
        roles: caller.roles.clone(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("authorization must be Bearer token".to_string()))?;

    Ok(token.to_string())
}
