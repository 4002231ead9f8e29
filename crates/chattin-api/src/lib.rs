//! HTTP surface: accounts, profiles, history, avatars and file storage.

pub mod auth;
pub mod avatars;
pub mod channels;
pub mod configuration;
pub mod files;
pub mod middleware;
pub mod tokens;
pub mod users;

use axum::http::StatusCode;
use tracing::error;

use chattin_db::Database;

pub use auth::{AppState, AppStateInner};

/// Run a database call on the blocking pool; failures become a logged 500.
pub(crate) async fn blocking<F, T>(state: &AppStateInner, f: F) -> Result<T, StatusCode>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    state.gateway.db(f).await.map_err(|e| {
        error!("Database error: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
