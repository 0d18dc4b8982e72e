use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use http::{header, Method};
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod password;
    pub mod token;
}

pub mod models {
    pub mod session;
    pub mod user;
}

pub mod repositories {
    pub mod login_attempts;
    pub mod session;
    pub mod user;
}

pub mod services {
    pub mod auth;
}

pub mod handlers {
    pub mod auth;
    pub mod health;
    pub mod users;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}

pub mod validation {
    pub mod auth;
}

use error::AppError;
use models::user::Role;
use state::AppState;

/// Roles allowed to look up other users.
pub const STAFF_ROLES: &[Role] = &[Role::Admin, Role::Lecturer];

/// Roles allowed to create accounts with a chosen role.
pub const ADMIN_ROLES: &[Role] = &[Role::Admin];

/// Largest accepted request body.
pub const BODY_LIMIT: usize = 64 * 1024;

/// Builds the HTTP router over `state`.
///
/// Connection-level concerns (per-IP limiting, connect info) are added by the
/// binary around this router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(86400));

    let public_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/logout", post(handlers::auth::logout))
        .with_state(state.clone());

    let login_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::rate_limit::rate_limit_login,
        ))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route(
            "/auth/change-password",
            post(handlers::auth::change_password),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    let staff_routes = Router::new()
        .route("/users/{id}", get(handlers::users::get_user))
        .route_layer(from_fn_with_state(
            STAFF_ROLES,
            middleware_layer::auth::require_role,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/users", post(handlers::users::create_user))
        .route_layer(from_fn_with_state(
            ADMIN_ROLES,
            middleware_layer::auth::require_role,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .merge(login_routes)
        .merge(protected_routes)
        .merge(staff_routes)
        .merge(admin_routes)
        .fallback(|| async { AppError::NotFound })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
}
