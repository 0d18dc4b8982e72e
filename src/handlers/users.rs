use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};

use crate::{
    error::Result,
    handlers::auth::{registration, RegisterResponse},
    models::{session::Identity, user::PublicProfile},
    state::AppState,
    validation::auth::{validate_payload, CreateUserRequest},
};

/// Returns another user's public profile. Mounted behind the staff role check.
#[axum::debug_handler]
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<PublicProfile>> {
    let user = state.authority.find_user(user_id).await?;
    Ok(Json(PublicProfile::from(&user)))
}

/// Creates an account with an explicit role. Mounted behind the admin role check.
#[axum::debug_handler]
pub async fn create_user(
    State(state): State<AppState>,
    Extension(admin): Extension<Identity>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Response> {
    validate_payload(&payload)?;
    tracing::info!(
        "👤 Admin {} creating {} account: {}",
        admin.user_id,
        payload.role,
        payload.account.username
    );

    let user = state
        .authority
        .register(registration(payload.account, payload.role))
        .await?;

    let response = RegisterResponse {
        message: "User created".to_string(),
        user_id: user.id,
    };

    Ok((StatusCode::CREATED, Json(response)).into_response())
}
