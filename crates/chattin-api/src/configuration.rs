use axum::{Json, extract::State, http::StatusCode};

use chattin_types::models::Configuration;

use crate::AppState;
use crate::blocking;

/// Server branding; public so clients can show it on the login screen.
pub async fn get_configuration(
    State(state): State<AppState>,
) -> Result<Json<Configuration>, StatusCode> {
    let config = blocking(&state, |db| db.get_configuration()).await?;
    Ok(Json(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::state;

    #[tokio::test]
    async fn returns_seeded_branding() {
        let Json(config) = get_configuration(State(state())).await.unwrap();
        assert_eq!(config.name, "Chattin");
    }
}
