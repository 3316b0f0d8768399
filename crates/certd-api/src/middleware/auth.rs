//! JWT Authentication Middleware
//!
//! Management endpoints require an HS256 bearer token signed with the key
//! derived from the cluster's shared secret. The middleware validates it and
//! makes the caller available to handlers via Axum's Extension.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::ErrorResponse;

/// Token audience; rejects tokens minted for anything else
pub const TOKEN_AUDIENCE: &str = "certd-management";

/// Claims carried by a management token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiClaims {
    /// Operator or service name
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller extracted from the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub subject: String,
}

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);

        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<ApiClaims, jsonwebtoken::errors::Error> {
        decode::<ApiClaims>(token, &self.decoding, &self.validation).map(|data| data.claims)
    }
}

/// Mint a management token for `subject`.
pub fn issue_token(
    secret: &[u8],
    subject: &str,
    validity: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = ApiClaims {
        sub: subject.to_string(),
        aud: TOKEN_AUDIENCE.to_string(),
        iat: now.timestamp(),
        exp: (now + validity).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

fn unauthorized(error: String, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error,
            code: Some(code.to_string()),
            retryable: false,
        }),
    )
}

/// Authentication middleware for the management API
///
/// Expects "Authorization: Bearer <token>", validates signature, audience and
/// expiration, and injects [`AuthUser`] into request extensions.
///
/// # Errors
/// Returns 401 Unauthorized if the header is missing, malformed, or the
/// token does not validate.
pub async fn require_auth(
    state: axum::extract::State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header".to_string(), "MISSING_AUTH"))?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        unauthorized(
            "Invalid Authorization header format. Expected 'Bearer <token>'".to_string(),
            "INVALID_AUTH_FORMAT",
        )
    })?;

    let claims = state
        .validate(token)
        .map_err(|e| unauthorized(format!("Invalid or expired token: {}", e), "INVALID_TOKEN"))?;

    request.extensions_mut().insert(AuthUser {
        subject: claims.sub,
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use tower::ServiceExt; // For oneshot()

    async fn protected_handler(axum::Extension(user): axum::Extension<AuthUser>) -> Json<AuthUser> {
        Json(user)
    }

    fn create_test_app(jwt_secret: &[u8]) -> Router {
        let jwt_state = Arc::new(JwtState::new(jwt_secret));

        Router::new()
            .route("/protected", get(protected_handler))
            .layer(middleware::from_fn_with_state(
                jwt_state.clone(),
                require_auth,
            ))
            .with_state(jwt_state)
    }

    async fn call(app: Router, authorization: Option<String>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().uri("/protected");
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_auth_middleware_valid_token() {
        let secret = b"test-secret-key";
        let token = issue_token(secret, "ops", Duration::hours(1)).unwrap();

        let (status, body) = call(create_test_app(secret), Some(format!("Bearer {}", token))).await;

        assert_eq!(status, StatusCode::OK);
        let user: AuthUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.subject, "ops");
    }

    #[tokio::test]
    async fn test_auth_middleware_missing_authorization_header() {
        let (status, body) = call(create_test_app(b"test-secret-key"), None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("MISSING_AUTH"));
    }

    #[tokio::test]
    async fn test_auth_middleware_invalid_format() {
        let (status, body) = call(
            create_test_app(b"test-secret-key"),
            Some("Basic dXNlcjpwYXNz".to_string()),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("INVALID_AUTH_FORMAT"));
    }

    #[tokio::test]
    async fn test_auth_middleware_wrong_secret() {
        let token = issue_token(b"other-secret", "ops", Duration::hours(1)).unwrap();

        let (status, body) = call(
            create_test_app(b"test-secret-key"),
            Some(format!("Bearer {}", token)),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("INVALID_TOKEN"));
    }

    #[tokio::test]
    async fn test_auth_middleware_expired_token() {
        let secret = b"test-secret-key";
        let token = issue_token(secret, "ops", Duration::hours(-2)).unwrap();

        let (status, _) = call(create_test_app(secret), Some(format!("Bearer {}", token))).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
