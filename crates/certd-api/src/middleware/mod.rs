//! API Middleware

pub mod auth;

pub use auth::{issue_token, require_auth, ApiClaims, AuthUser, JwtState};
