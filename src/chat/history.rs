use axum::{debug_handler, extract::{Query, State}, Json};
use serde::Deserialize;

use crate::{AppResult, AppState};

use super::Message;

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
}

#[debug_handler]
pub(crate) async fn messages(
    State(state): State<AppState>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let cap = state.config.history_limit;
    let limit = limit.unwrap_or(cap).min(cap);

    Ok(Json(state.store.recent(limit).await?))
}
