/// Bearer-key authentication for the API routes
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::errors::ApiError;

/// A String whose equality check runs in constant time, so key comparison does not leak how
/// much of a guess was right.
#[derive(Clone, Debug)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

pub type KeySet = HashSet<ConstantTimeString>;

pub fn key_set<I, S>(keys: I) -> KeySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter()
        .map(Into::into)
        .filter(|k: &String| !k.is_empty())
        .map(ConstantTimeString::from)
        .collect()
}

pub fn validate_bearer_token(keys: &KeySet, token: &str) -> bool {
    keys.contains(&ConstantTimeString::from(token))
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Middleware rejecting requests without a valid bearer key. An empty key set disables the
/// check.
pub async fn require_bearer(
    State(keys): State<Arc<KeySet>>,
    request: Request,
    next: Next,
) -> Response {
    if keys.is_empty() {
        return next.run(request).await;
    }
    let authorized = bearer_token(&request).map(|token| validate_bearer_token(&keys, token));
    match authorized {
        Some(true) => next.run(request).await,
        Some(false) => {
            debug!(path = %request.uri().path(), "Rejected invalid API key");
            ApiError::unauthorized("Invalid API key").into_response()
        }
        None => {
            debug!(path = %request.uri().path(), "Rejected request without API key");
            ApiError::unauthorized("Missing bearer token").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bearer_token() {
        let keys = key_set(["sk-one", "sk-two"]);
        assert!(validate_bearer_token(&keys, "sk-one"));
        assert!(validate_bearer_token(&keys, "sk-two"));
        assert!(!validate_bearer_token(&keys, "sk-on"));
        assert!(!validate_bearer_token(&keys, ""));
    }

    #[test]
    fn test_empty_keys_are_dropped() {
        let keys = key_set(["", "sk-one", ""]);
        assert_eq!(keys.len(), 1);
    }
}
