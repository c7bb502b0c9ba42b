//! Authentication: JWT validation and the request identity extension
//!
//! Account management (registration, login, 2FA) lives outside this service;
//! the API only validates bearer tokens issued by the identity provider and
//! attributes each request to a user and company.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use botforge_shared::UserRole;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// JWT claims structure for Botforge-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Company ID, absent until the user belongs to a company
    pub company_id: Option<Uuid>,
    /// User role
    pub role: String,
    /// Email
    pub email: Option<String>,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Authenticated request identity, inserted as an axum extension
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub company_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: UserRole,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    /// Generate an access token
    pub fn generate_token(
        &self,
        user_id: Uuid,
        company_id: Option<Uuid>,
        role: UserRole,
        email: Option<&str>,
    ) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.expiry_hours);

        let claims = Claims {
            sub: user_id,
            company_id,
            role: role.to_string(),
            email: email.map(|e| e.to_string()),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to encode JWT");
            ApiError::Internal
        })
    }

    /// Validate a token and extract the request identity
    pub fn validate_token(&self, token: &str) -> Result<AuthUser, ApiError> {
        let validation = Validation::new(Algorithm::HS256);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| ApiError::InvalidToken)?;

        let claims = token_data.claims;
        Ok(AuthUser {
            user_id: claims.sub,
            company_id: claims.company_id,
            email: claims.email,
            role: UserRole::from_str_lossy(&claims.role),
        })
    }
}

/// Require a valid bearer token; inserts [`AuthUser`] for downstream handlers
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let auth_user = state.jwt.validate_token(token)?;

    req.extensions_mut().insert(auth_user);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    #[test]
    fn test_token_round_trip() {
        let manager = JwtManager::new(TEST_SECRET, 24);
        let user_id = Uuid::new_v4();
        let company_id = Uuid::new_v4();

        let token = manager
            .generate_token(
                user_id,
                Some(company_id),
                UserRole::Owner,
                Some("owner@example.com"),
            )
            .unwrap();

        let auth_user = manager.validate_token(&token).unwrap();
        assert_eq!(auth_user.user_id, user_id);
        assert_eq!(auth_user.company_id, Some(company_id));
        assert_eq!(auth_user.role, UserRole::Owner);
        assert_eq!(auth_user.email.as_deref(), Some("owner@example.com"));
    }

    #[test]
    fn test_token_with_wrong_secret_is_rejected() {
        let manager = JwtManager::new(TEST_SECRET, 24);
        let other = JwtManager::new("another-secret-that-is-also-32-characters", 24);

        let token = manager
            .generate_token(Uuid::new_v4(), None, UserRole::Member, None)
            .unwrap();

        assert!(matches!(
            other.validate_token(&token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        let manager = JwtManager::new(TEST_SECRET, 24);
        assert!(matches!(
            manager.validate_token("not-a-jwt"),
            Err(ApiError::InvalidToken)
        ));
    }
}
