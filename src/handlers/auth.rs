use axum::{
    extract::{ConnectInfo, FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::{
    error::{AppError, Result},
    middleware_layer::auth::extract_bearer,
    models::{
        session::{ClientInfo, Identity, SessionRecord},
        user::Role,
    },
    services::auth::{Credentials, Registration},
    state::AppState,
    validation::auth::{validate_payload, ChangePasswordRequest, RegisterRequest},
};

/// The request payload for user login.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub password: String,
}

/// The response payload for a successful login.
#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
}

/// The response payload for a successful registration.
#[derive(Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user_id: i64,
}

/// The response payload for authentication-related requests.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> std::result::Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(ClientInfo { ip, user_agent })
    }
}

/// Builds the service input from a validated payload.
pub(crate) fn registration(payload: RegisterRequest, role: Role) -> Registration {
    Registration {
        name: payload.name.trim().to_string(),
        username: payload.username,
        email: payload.email,
        password: payload.password,
        role,
        major: payload.major,
        year: payload.year,
    }
}

/// Handles self-service registration. The account is always a student.
#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Response> {
    tracing::info!("📝 Register attempt for: {}", payload.username);
    validate_payload(&payload)?;

    let user = state
        .authority
        .register(registration(payload, Role::Student))
        .await?;

    let response = RegisterResponse {
        message: "Registration successful".to_string(),
        user_id: user.id,
    };

    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// Handles user login.
#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    let credentials = Credentials {
        username: payload.username,
        email: payload.email,
        password: payload.password,
    };

    let issued = state.authority.login(&credentials, client).await.inspect_err(|e| {
        if matches!(e, AppError::InvalidCredentials) {
            tracing::warn!("🔐 Failed login for: {}", credentials.login().unwrap_or_default());
        }
    })?;

    Ok((StatusCode::OK, Json(LoginResponse { token: issued.token })).into_response())
}

/// Handles user logout.
#[axum::debug_handler]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    let token = extract_bearer(&headers).ok_or(AppError::Unauthorized)?;
    state.authority.logout(token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Returns the caller's session record.
#[axum::debug_handler]
pub async fn me(Extension(identity): Extension<Identity>) -> Json<SessionRecord> {
    Json(identity.session)
}

/// Handles changing a user's password.
#[axum::debug_handler]
pub async fn change_password(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Response> {
    tracing::info!("🔑 Change password for user: {}", identity.user_id);
    validate_payload(&payload)?;

    state
        .authority
        .change_password(&identity, &payload.old_password, &payload.new_password)
        .await?;

    let response = AuthResponse {
        success: true,
        message: "Password changed successfully".to_string(),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}
