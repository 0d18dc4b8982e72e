use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sonic_rs::JsonValueTrait;

use crate::{error::AppError, state::AppState};

/// Login bodies are tiny; anything larger is not a login.
const LOGIN_BODY_LIMIT: usize = 16 * 1024;

/// Pulls the login name (`username`, else `email`) out of a JSON body.
fn extract_login_from_body(body_bytes: &[u8]) -> Option<String> {
    let json = sonic_rs::from_slice::<sonic_rs::Value>(body_bytes).ok()?;
    ["username", "email"]
        .into_iter()
        .filter_map(|field| json.get(field).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// A middleware that throttles failed logins per login name.
///
/// Once a name reaches the configured number of failures inside the window,
/// further attempts get `429` without reaching the password verifier. A
/// successful login clears the counter.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `req` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// The login `Response`, or `429` while the name is locked out.
pub async fn rate_limit_login(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, LOGIN_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return AppError::Validation("Request body too large".to_string()).into_response();
        }
    };

    let Some(login) = extract_login_from_body(&body_bytes) else {
        return next.run(Request::from_parts(parts, Body::from(body_bytes))).await;
    };

    let max_attempts = state.config.login_max_attempts;
    match state.attempts.failures(&login).await {
        Ok((count, ttl)) if count >= max_attempts => {
            tracing::warn!("⛔ Login locked out after {} failures", count);
            return AppError::RateLimitExceeded(format!(
                "Too many failed login attempts. Try again in {} minutes",
                ttl.div_ceil(60)
            ))
            .into_response();
        }
        Ok(_) => {}
        Err(e) => return e.into_response(),
    }

    let response = next.run(Request::from_parts(parts, Body::from(body_bytes))).await;

    let outcome = if response.status() == StatusCode::UNAUTHORIZED {
        state
            .attempts
            .record_failure(&login, state.config.login_window)
            .await
    } else if response.status().is_success() {
        state.attempts.reset(&login).await
    } else {
        Ok(())
    };

    if let Err(e) = outcome {
        tracing::error!("❌ Failed to update login attempts: {}", e);
    }

    response
}
