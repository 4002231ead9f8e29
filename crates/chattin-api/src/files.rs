use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use tracing::{info, warn};
use uuid::Uuid;

use chattin_db::models::FileRow;
use chattin_types::api::{FileInfo, UploadQuery, UploadResponse};

use crate::AppState;
use crate::blocking;
use crate::middleware::AuthUser;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_FILE_NAME: &str = "file";

/// Keep a client-supplied name safe to echo back in a header.
fn sanitize_name(name: Option<&str>) -> String {
    let cleaned: String = name
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '\\' | '/'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// POST /files?name=: raw body, stored with the request's content type.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_owned();

    let file_id = Uuid::new_v4();
    let size = body.len() as u64;
    let row = FileRow {
        id: file_id.to_string(),
        user_id: user.id.to_string(),
        name: sanitize_name(query.name.as_deref()),
        content_type,
        size: size as i64,
        data: body.to_vec(),
    };
    let name = row.name.clone();
    blocking(&state, move |db| db.insert_file(&row)).await?;

    info!("{} ({}) uploaded {} ({} bytes)", user.login, user.id, name, size);
    Ok((StatusCode::CREATED, Json(UploadResponse { file_id, size })))
}

/// GET /files/{id}: inline, with the stored content type.
pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let file = blocking(&state, move |db| db.get_file(file_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::CONTENT_TYPE, file.content_type)], file.data))
}

/// GET /files/{id}/info
pub async fn file_info(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileInfo>, StatusCode> {
    let meta = blocking(&state, move |db| db.get_file_meta(file_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(FileInfo {
        name: meta.name,
        content_type: meta.content_type,
        size: meta.size.max(0) as u64,
    }))
}

/// GET /files/{id}/download: same bytes as an attachment.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let file = blocking(&state, move |db| db.get_file(file_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    let disposition = format!("attachment; filename=\"{}\"", sanitize_name(Some(&file.name)));
    if file.data.len() as i64 != file.size {
        warn!("File {} size mismatch: stored {}, actual {}", file.id, file.size, file.data.len());
    }
    Ok((
        [
            (header::CONTENT_TYPE, file.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.data,
    ))
}
