//! Token authentication.
//!
//! Callers send `Authorization: token <value>` (a `Bearer` scheme is also
//! accepted). Tokens are looked up in the configured token table.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::error::AppError;
use super::state::AppState;
use crate::api::Principal;

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

/// Extract the token from an `Authorization` header value.
pub fn parse_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    (scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer")).then_some(token)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;
        let token = parse_token(header)
            .ok_or_else(|| AppError::Unauthorized("Expected 'Authorization: token <value>'".into()))?;
        state
            .principal_for(token)
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized("Unknown API token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("token abc"), Some("abc"));
        assert_eq!(parse_token("Bearer abc"), Some("abc"));
        assert_eq!(parse_token("  token   abc "), Some("abc"));
        assert_eq!(parse_token("Basic abc"), None);
        assert_eq!(parse_token("token "), None);
        assert_eq!(parse_token("abc"), None);
    }
}
