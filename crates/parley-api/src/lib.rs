pub mod auth;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod rooms;
pub mod users;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use parley_db::{Database, RoomStore, StoreError};
use parley_gateway::presence::PresenceRegistry;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub rooms: Arc<RoomStore>,
    pub presence: PresenceRegistry,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

/// REST surface. Everything except signup, login, OTP and password reset
/// needs a bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/signup", post(auth::signup))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/send-otp", post(auth::send_otp))
        .route("/api/auth/verify-otp", post(auth::verify_otp))
        .route("/api/auth/reset-password", put(auth::reset_password));

    let protected_routes = Router::new()
        .route("/api/auth/status", put(auth::update_status))
        .route("/api/auth/update", put(auth::update_profile))
        .route("/api/v1/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/api/v1/rooms/join", post(rooms::join_room))
        .route("/api/v1/rooms/leave", post(rooms::leave_room))
        .route("/api/v1/rooms/promote", post(rooms::promote))
        .route("/api/v1/rooms/demote", post(rooms::demote))
        .route("/api/v1/rooms/{room_id}", get(rooms::get_room))
        .route("/api/v1/rooms/{room_id}/messages", get(rooms::get_messages))
        .route("/api/users/active", get(users::active_users))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth));

    public_routes.merge(protected_routes).with_state(state)
}

/// Run blocking store work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
