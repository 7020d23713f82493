use axum::{debug_handler, extract::{State, WebSocketUpgrade}, http::StatusCode, response::{IntoResponse, Response}};
use tower_sessions::Session;

use crate::{auth::Identity, session::IDENTITY, AppError, AppResult, AppState};

use super::handler::run as run_session;

#[debug_handler]
pub(crate) async fn chat_ws(
    State(state): State<AppState>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let identity = session.get::<Identity>(IDENTITY).await?;

    if identity.is_none() && !state.config.allow_anonymous {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, "login required"));
    }

    Ok(ws.on_upgrade(move |socket| run_session(socket, identity, state)).into_response())
}
