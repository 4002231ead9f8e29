use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use chattin_db::models::AvatarRow;
use chattin_types::api::{AvatarResponse, SelectAvatarRequest};
use chattin_types::models::User;

use crate::AppState;
use crate::blocking;
use crate::middleware::AuthUser;
use crate::users::announce_update;

const AVATAR_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// The content type if it is one of the accepted image formats.
fn avatar_type(headers: &HeaderMap) -> Option<&'static str> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim();
    AVATAR_TYPES
        .into_iter()
        .find(|t| t.eq_ignore_ascii_case(essence))
}

/// GET /avatars: ids of the caller's uploaded avatars.
pub async fn list_avatars(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Vec<Uuid>>, StatusCode> {
    let user_id = user.id;
    let ids = blocking(&state, move |db| db.list_avatar_ids(user_id)).await?;
    Ok(Json(ids))
}

/// POST /avatars: raw image body. Stores it and makes it the current avatar.
pub async fn upload_avatar(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let content_type = avatar_type(&headers).ok_or(StatusCode::UNSUPPORTED_MEDIA_TYPE)?;
    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let avatar_id = Uuid::new_v4();
    let user_id = user.id;
    let row = AvatarRow {
        id: avatar_id.to_string(),
        user_id: user_id.to_string(),
        content_type: content_type.to_owned(),
        data: body.to_vec(),
    };
    blocking(&state, move |db| {
        db.insert_avatar(&row)?;
        db.select_avatar(user_id, Some(avatar_id))
    })
    .await?;

    info!("{} ({}) uploaded avatar {}", user.login, user_id, avatar_id);
    announce_update(&state, user_id).await?;
    Ok((StatusCode::CREATED, Json(AvatarResponse { avatar_id })))
}

/// PUT /user/avatar: pick one of the caller's avatars, or `null` to clear.
pub async fn select_avatar(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<SelectAvatarRequest>,
) -> Result<Json<User>, StatusCode> {
    let user_id = user.id;
    let changed = blocking(&state, move |db| db.select_avatar(user_id, req.avatar_id)).await?;
    if changed == 0 {
        return Err(StatusCode::NOT_FOUND);
    }
    let user = announce_update(&state, user_id).await?;
    Ok(Json(user))
}

/// GET /avatars/{id}: image bytes with their stored type.
pub async fn get_avatar(
    State(state): State<AppState>,
    Path(avatar_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let avatar = blocking(&state, move |db| db.get_avatar(avatar_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::CONTENT_TYPE, avatar.content_type)], avatar.data))
}

/// DELETE /avatars/{id}: owner only.
pub async fn delete_avatar(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(avatar_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let user_id = user.id;
    let deleted = blocking(&state, move |db| db.delete_avatar(avatar_id, user_id)).await?;
    if deleted == 0 {
        return Err(StatusCode::NOT_FOUND);
    }
    if user.avatar_id == Some(avatar_id) {
        announce_update(&state, user_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
