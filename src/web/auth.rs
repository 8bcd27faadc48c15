//! Bearer-token authentication: login endpoint and request middleware.

use super::{ApiError, ApiJson, AppState};
use crate::config::Settings;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{Json, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

/// Issue an HS256 access token for the given subject.
pub fn create_access_token(
    settings: &Settings,
    subject: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expires = Utc::now() + ChronoDuration::minutes(settings.auth_token_minutes);
    let claims = Claims {
        sub: subject.to_string(),
        exp: expires.timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.auth_secret.as_bytes()),
    )
}

/// Check the admin credentials without leaking timing information.
pub fn verify_credentials(settings: &Settings, username: &str, password: &str) -> bool {
    constant_time_eq(username, &settings.admin_username)
        & constant_time_eq(password, &settings.admin_password)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// `POST /auth/login`: exchange admin credentials for a bearer token.
pub async fn handle_login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if !verify_credentials(&state.settings, &payload.username, &payload.password) {
        return Err(ApiError::Unauthenticated("Invalid credentials".to_string()));
    }

    let token = create_access_token(&state.settings, &payload.username)
        .map_err(|_| ApiError::Internal("Internal server error".to_string()))?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

/// Middleware requiring a valid bearer token on every protected route.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthenticated("Missing credentials".to_string()))?;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.settings.auth_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthenticated("Invalid token".to_string()))?;

    Ok(next.run(request).await)
}
