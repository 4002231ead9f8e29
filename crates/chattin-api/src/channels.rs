use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

use chattin_gateway::policy;
use chattin_types::api::MessageQuery;
use chattin_types::models::{Channel, Message};

use crate::AppState;
use crate::blocking;

pub async fn list_channels(State(state): State<AppState>) -> Json<Vec<Channel>> {
    Json(state.gateway.channels.clone())
}

/// Same paging as the socket query: newest first, `from` excluded.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    if state.gateway.channel(channel_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let limit = policy::page_size(query.count, state.gateway.settings.max_page_size);
    let messages = blocking(&state, move |db| {
        db.get_messages(channel_id, query.from, limit)
    })
    .await?;
    Ok(Json(messages))
}
