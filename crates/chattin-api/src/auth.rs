use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::SaltString,
};
use anyhow::Context;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use rand_core::OsRng;
use tracing::{error, info, warn};
use uuid::Uuid;

use chattin_db::{Database, is_unique_violation};
use chattin_gateway::{GatewayContext, HubHandle};
use chattin_types::api::{CredentialsRequest, TokenResponse};
use chattin_types::packet::ServerPacket;

use crate::blocking;
use crate::tokens::TokenIssuer;

const MAX_LOGIN_LEN: usize = 32;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Arc<GatewayContext>,
    pub hub: HubHandle,
    pub tokens: TokenIssuer,
}

/// Argon2id with a fresh OS-random salt, in PHC string form.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let login = req.login.trim().to_owned();
    if login.is_empty() || login.chars().count() > MAX_LOGIN_LEN || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let taken = login.clone();
    if blocking(&state, move |db| db.login_exists(&taken)).await? {
        return Err(StatusCode::CONFLICT);
    }

    let password_hash = hash_password(&req.password).map_err(|e| {
        error!("Password hashing failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let user_id = Uuid::new_v4();
    let token = state.tokens.issue();
    let issued = token.clone();
    // A concurrent registration can still win the login after the check above.
    let created = blocking(&state, move |db| {
        if let Err(e) = db.create_user(user_id, &login, &password_hash) {
            return if is_unique_violation(&e) { Ok(None) } else { Err(e) };
        }
        db.insert_token(&issued, user_id)?;
        db.get_user(user_id)?
            .map(Some)
            .context("user missing right after insert")
    })
    .await?;
    let Some(user) = created else {
        return Err(StatusCode::CONFLICT);
    };

    info!("Registered {} ({})", user.login, user.id);
    state.hub.broadcast(ServerPacket::AddUsers(vec![user]));

    Ok((StatusCode::CREATED, Json(TokenResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, StatusCode> {
    let login = req.login.trim().to_owned();
    let user = blocking(&state, move |db| db.get_user_by_login(&login))
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_password(&req.password, &user.password) {
        warn!("Failed login for {}", user.login);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let user_id: Uuid = user.id.parse().map_err(|e| {
        error!("Corrupt user id '{}': {}", user.id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = state.tokens.issue();
    let issued = token.clone();
    blocking(&state, move |db| db.insert_token(&issued, user_id)).await?;

    Ok(Json(TokenResponse { user_id, token }))
}
