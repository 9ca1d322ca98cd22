//! Admission gates in front of the API.
//!
//! `account_gate` authenticates the bearer key, charges one token against the
//! account's hourly plan quota and stores the `Account` in the request
//! extensions. `ip_gate` protects unauthenticated endpoints by client address.
//! Both stamp `X-RateLimit-*` headers on the response.

use crate::{
    errors::{AppError, ServiceError},
    services::rate_limiter::RateDecision,
    state::AppState,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, time::Duration};
use tracing::debug;

pub const WINDOW: Duration = Duration::from_secs(3600);

/// Key issuance allowance per client address and hour.
pub const KEY_ISSUANCE_PER_HOUR: u32 = 5;

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";

pub async fn account_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(api_key) = bearer_token(request.headers()) else {
        return AppError::unauthorized(
            "invalid_api_key",
            "Missing API key. Send `Authorization: Bearer <key>`.",
        )
        .into_response();
    };
    let account = match state.uploads.authenticate(api_key).await {
        Ok(account) => account,
        Err(ServiceError::InvalidCredential) => {
            debug!("rejected unknown API key");
            return AppError::from(ServiceError::InvalidCredential).into_response();
        }
        Err(err) => return AppError::from(err).into_response(),
    };

    let decision = state.account_limiter.allow(
        &account.id.to_string(),
        account.hourly_request_quota(),
        WINDOW,
    );
    if !decision.allowed {
        debug!(account = %account.id, "account over hourly request quota");
        return denied(&decision, "Hourly request limit reached for your plan.");
    }

    request.extensions_mut().insert(account);
    let mut response = next.run(request).await;
    stamp(response.headers_mut(), &decision);
    response
}

pub async fn ip_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let decision = state.ip_limiter.allow(&client, KEY_ISSUANCE_PER_HOUR, WINDOW);
    if !decision.allowed {
        debug!(%client, "client over key issuance limit");
        return denied(&decision, "Too many keys requested from this address.");
    }

    let mut response = next.run(request).await;
    stamp(response.headers_mut(), &decision);
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn denied(decision: &RateDecision, message: &str) -> Response {
    let retry_after = decision.retry_after.as_secs_f64().ceil().max(1.0) as u64;
    let mut response = AppError::rate_limited(message, retry_after).into_response();
    stamp(response.headers_mut(), decision);
    response
}

fn stamp(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(HeaderName::from_static(LIMIT), HeaderValue::from(decision.limit));
    headers.insert(HeaderName::from_static(REMAINING), HeaderValue::from(decision.remaining));
    headers.insert(HeaderName::from_static(RESET), HeaderValue::from(decision.reset_at.timestamp()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer ln_test_abc"));
        assert_eq!(bearer_token(&headers), Some("ln_test_abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  spaced "));
        assert_eq!(bearer_token(&headers), Some("spaced"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
