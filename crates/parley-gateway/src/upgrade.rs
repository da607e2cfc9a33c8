use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::warn;

use crate::GatewayState;
use crate::connection;

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    pub token: Option<String>,
}

/// The `/ws` endpoint, ready to merge into the server's router.
pub fn router(state: GatewayState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Authenticate before upgrading so a bad credential gets a plain 401
/// instead of an opened-then-closed socket. The upgrade headers are checked
/// only after that.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let session = match state.authenticator.authenticate(&headers, query.token.as_deref()).await {
        Ok(session) => session,
        Err(e) => return (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| connection::handle_session(socket, state, session))
            .into_response(),
        Err(rejection) => {
            warn!("{} sent a non-upgrade request to /ws: {}", session.identity, rejection);
            rejection.into_response()
        }
    }
}
