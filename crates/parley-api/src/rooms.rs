use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use parley_db::history::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use parley_types::api::{Claims, RoomUserRequest};
use parley_types::models::{Message, Role, Room};

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiQuery};
use crate::{AppState, blocking};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_size")]
    pub size: i64,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

/// The creator becomes SUPER_ADMIN, so `userId` must be the caller.
pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<RoomUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let creator = claims.identity();
    if req.user_id != creator {
        return Err(ApiError::Forbidden(format!(
            "userId '{}' does not match the authenticated user",
            req.user_id
        )));
    }

    let rooms = state.rooms.clone();
    let room = blocking(move || rooms.create_room(&req.room_id, &creator)).await?;

    info!("{} created room {}", claims.sub, room.room_id);
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_rooms(State(state): State<AppState>) -> ApiResult<Json<Vec<Room>>> {
    let rooms = state.rooms.clone();
    Ok(Json(blocking(move || rooms.list_rooms()).await?))
}

pub async fn get_room(State(state): State<AppState>, Path(room_id): Path<String>) -> ApiResult<Json<Room>> {
    let rooms = state.rooms.clone();
    Ok(Json(blocking(move || rooms.get_room(&room_id)).await?))
}

pub async fn join_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<RoomUserRequest>,
) -> ApiResult<Json<Room>> {
    let rooms = state.rooms.clone();
    let actor = claims.identity();
    let room = blocking(move || rooms.add_participant(&req.room_id, &actor, &req.user_id, Role::Member)).await?;
    Ok(Json(room))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<RoomUserRequest>,
) -> ApiResult<Json<Room>> {
    let rooms = state.rooms.clone();
    let actor = claims.identity();
    let room = blocking(move || rooms.remove_participant(&req.room_id, &actor, &req.user_id)).await?;
    Ok(Json(room))
}

pub async fn promote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<RoomUserRequest>,
) -> ApiResult<Json<Room>> {
    set_role(state, claims, req, Role::Admin).await
}

pub async fn demote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<RoomUserRequest>,
) -> ApiResult<Json<Room>> {
    set_role(state, claims, req, Role::Member).await
}

async fn set_role(state: AppState, claims: Claims, req: RoomUserRequest, role: Role) -> ApiResult<Json<Room>> {
    let rooms = state.rooms.clone();
    let actor = claims.identity();
    let room = blocking(move || rooms.set_role(&req.room_id, &actor, &req.user_id, role)).await?;

    info!("{} set {} in {}", claims.sub, role, room.room_id);
    Ok(Json(room))
}

/// `page` counts back from the newest message; each page is in
/// chronological order.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let rooms = state.rooms.clone();
    let messages = blocking(move || rooms.get_page(&room_id, query.page, query.size)).await?;
    Ok(Json(messages))
}
