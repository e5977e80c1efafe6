//! Shared-token auth for every route.
//!
//! API clients send `Authorization: Bearer <token>`. A browser opens the UI
//! once with `?token=<token>` and gets a `daemon_token` cookie back, which
//! authenticates later requests.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub const COOKIE_NAME: &str = "daemon_token";
const COOKIE_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Clone)]
pub struct AuthToken(Arc<str>);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    fn matches(&self, candidate: &str) -> bool {
        *self.0 == *candidate
    }
}

#[derive(Deserialize)]
struct TokenParam {
    token: Option<String>,
}

pub async fn require_token(State(auth): State<AuthToken>, req: Request, next: Next) -> Response {
    let headers = req.headers();

    if let Some(value) = headers.get(AUTHORIZATION) {
        let presented = value.to_str().map(strip_bearer).unwrap_or_default();
        if auth.matches(presented) {
            return next.run(req).await;
        }
        debug!(path = %req.uri().path(), "rejected bearer token");
        return unauthorized("Invalid token");
    }

    let query_token = Query::<TokenParam>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(p)| p.token);
    if query_token.as_deref().is_some_and(|t| auth.matches(t)) {
        let mut response = next.run(req).await;
        if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&auth.0)) {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        return response;
    }

    if cookie_value(headers, COOKIE_NAME).is_some_and(|t| auth.matches(t)) {
        return next.run(req).await;
    }

    unauthorized("Unauthorized. Provide Bearer token or ?token= parameter.")
}

fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim_start(),
        _ => raw,
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn session_cookie(token: &str) -> String {
    format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}")
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}
