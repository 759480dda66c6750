//! Token auth and password hashing.
//!
//! HS256 JWTs with a 24 hour expiry. The signing secret comes from
//! `RS_JWT_SECRET`; when unset a random per-process secret is generated and
//! never persisted, so every issued token dies with the process.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;

pub const BCRYPT_COST: u32 = 12;
const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Use the configured secret or generate a random 32-byte one.
pub fn load_or_generate_secret(configured: Option<&str>) -> Vec<u8> {
    match configured {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            tracing::warn!(
                "RS_JWT_SECRET not set - using a random secret, tokens expire on restart"
            );
            let mut bytes = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        }
    }
}

pub fn generate_token(secret: &[u8], username: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: username.to_string(),
        exp: (Utc::now() + chrono::Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, BCRYPT_COST)
}

pub fn verify_password(hashed: &str, raw: &str) -> bool {
    bcrypt::verify(raw, hashed).unwrap_or(false)
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Middleware requiring a valid bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized("Authorization header required");
    };

    match verify_token(&state.jwt_secret, token) {
        Ok(_) => next.run(request).await,
        Err(_) => unauthorized("Invalid or expired token"),
    }
}

/// Middleware refusing everything but the setup allow-list until the first
/// user exists.
pub async fn setup_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.store.has_any_user() {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if matches!(path, "/api/v1/need-setup" | "/api/v1/setup" | "/login") {
        return next.run(request).await;
    }

    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "Setup required" })),
    )
        .into_response()
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let secret = b"test-secret";
        let token = generate_token(secret, "admin").unwrap();
        let claims = verify_token(secret, &token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > Utc::now().timestamp() as usize);
    }

    #[test]
    fn test_token_rejects_wrong_secret() {
        let token = generate_token(b"secret-a", "admin").unwrap();
        assert!(verify_token(b"secret-b", &token).is_err());
    }

    #[test]
    fn test_generated_secrets_differ() {
        let a = load_or_generate_secret(None);
        let b = load_or_generate_secret(None);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_configured_secret_used_verbatim() {
        let s = load_or_generate_secret(Some("fixed"));
        assert_eq!(s, b"fixed".to_vec());
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password(&hash, "hunter22"));
        assert!(!verify_password(&hash, "hunter23"));
    }
}
