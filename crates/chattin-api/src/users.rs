use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::info;
use uuid::Uuid;

use chattin_types::api::ProfileRequest;
use chattin_types::models::User;
use chattin_types::packet::ServerPacket;

use crate::blocking;
use crate::middleware::AuthUser;
use crate::{AppState, AppStateInner};

const MAX_NICKNAME_LEN: usize = 32;
const MAX_BIO_LEN: usize = 500;

pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, StatusCode> {
    let users = blocking(&state, |db| db.list_users()).await?;
    Ok(Json(users))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<User>, StatusCode> {
    let nickname = req.nickname.trim().to_owned();
    let bio = req.bio.trim().to_owned();
    if nickname.chars().count() > MAX_NICKNAME_LEN || bio.chars().count() > MAX_BIO_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user_id = user.id;
    let updated = blocking(&state, move |db| db.update_profile(user_id, &nickname, &bio))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    info!("{} ({}) updated profile", updated.login, updated.id);
    state.hub.broadcast(ServerPacket::UpdateUsers(vec![updated.clone()]));
    Ok(Json(updated))
}

/// Reload a user after a profile-visible change and tell every session.
pub(crate) async fn announce_update(
    state: &AppStateInner,
    user_id: Uuid,
) -> Result<User, StatusCode> {
    let user = blocking(state, move |db| db.get_user(user_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    state.hub.broadcast(ServerPacket::UpdateUsers(vec![user.clone()]));
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{account, state};

    async fn auth_user(state: &AppState, login: &str) -> AuthUser {
        let issued = account(state, login).await;
        AuthUser(state.db.get_user(issued.user_id).unwrap().unwrap())
    }

    #[tokio::test]
    async fn profile_update_is_stored() {
        let state = state();
        let alice = auth_user(&state, "alice").await;

        let Json(updated) = update_profile(
            State(state.clone()),
            Extension(alice),
            Json(ProfileRequest {
                nickname: " Al ".into(),
                bio: "hello".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(updated.nickname, "Al");
        let Json(users) = list_users(State(state)).await.unwrap();
        assert_eq!(users[0].bio, "hello");
    }

    #[tokio::test]
    async fn oversized_profile_is_rejected() {
        let state = state();
        let alice = auth_user(&state, "alice").await;

        let result = update_profile(
            State(state.clone()),
            Extension(alice),
            Json(ProfileRequest {
                nickname: "n".repeat(33),
                bio: String::new(),
            }),
        )
        .await;
        assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));
    }
}
