use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};

use crate::{
    error::AppError,
    models::{session::Identity, user::Role},
    state::AppState,
};

/// Extracts the bearer token from the `Authorization` header.
///
/// # Arguments
///
/// * `headers` - The request headers.
///
/// # Returns
///
/// An `Option` containing the token if the header is well formed.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// A middleware that requires a live session.
///
/// On success the caller's [`Identity`] is inserted into the request
/// extensions for the handlers behind it.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `request` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// The inner `Response`, or `401` when the token or session is not valid.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    tracing::debug!("🔐 Checking authentication...");

    let Some(token) = extract_bearer(request.headers()).map(str::to_string) else {
        tracing::debug!("No bearer token on request");
        return AppError::Unauthorized.into_response();
    };

    let identity = match state.authority.authenticate(&token).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    tracing::debug!("✅ User authenticated: {}", identity.user_id);
    request.extensions_mut().insert(identity);

    next.run(request).await
}

/// A middleware that admits only the given roles. Must run after
/// [`require_auth`].
///
/// # Arguments
///
/// * `allowed` - The roles that may pass.
/// * `identity` - The caller, set by `require_auth`.
/// * `request` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// The inner `Response`, or `403` for any other role.
pub async fn require_role(
    State(allowed): State<&'static [Role]>,
    Extension(identity): Extension<Identity>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !allowed.contains(&identity.role) {
        tracing::warn!(
            "⛔ Role {} denied for user {}",
            identity.role,
            identity.user_id
        );
        return AppError::Forbidden.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(extract_bearer(&headers("Bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(&headers("bearer  abc ")), Some("abc"));
    }

    #[test]
    fn rejects_other_shapes() {
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
        assert_eq!(extract_bearer(&headers("Basic abc")), None);
        assert_eq!(extract_bearer(&headers("Bearer")), None);
        assert_eq!(extract_bearer(&headers("Bearer   ")), None);
        assert_eq!(extract_bearer(&headers("abc")), None);
    }
}
