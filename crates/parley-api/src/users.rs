use axum::{Json, extract::State};

use parley_types::models::Identity;

use crate::AppState;

/// Identities with at least one open gateway session.
pub async fn active_users(State(state): State<AppState>) -> Json<Vec<Identity>> {
    Json(state.presence.snapshot())
}
