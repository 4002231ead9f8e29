use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::Response,
};

use chattin_types::models::User;

use crate::AppState;
use crate::blocking;

/// The account behind the request's token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

/// `Authorization: Bearer <token>`, or a bare `token` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value.to_str().ok()?.strip_prefix("Bearer ");
    }
    headers.get("token").and_then(|v| v.to_str().ok())
}

/// Resolve the request's token and attach the account as [`AuthUser`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers())
        .filter(|t| !t.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_owned();

    let user = blocking(&state, move |db| db.resolve_token(&token))
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}
