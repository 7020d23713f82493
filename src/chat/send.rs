use axum::{debug_handler, extract::State, http::StatusCode, Json};
use tower_sessions::Session;
use tracing::{debug, Instrument};

use crate::{auth::Identity, session::IDENTITY, AppError, AppResult, AppState};

use super::{Message, Submission};

/// One-shot submission for clients that poll `/messages` instead of holding a socket.
#[debug_handler]
pub(crate) async fn send(
    State(state): State<AppState>,
    session: Session,
    Json(submission): Json<Submission>,
) -> AppResult<Json<Message>> {
    let identity = session.get::<Identity>(IDENTITY).await?;

    if identity.is_none() && !state.config.allow_anonymous {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, "login required"));
    }

    let submission = submission.attribute(identity.as_ref());
    let broadcaster = state.broadcaster.clone();

    // the append finishes even if the client hangs up
    let message = tokio::spawn(async move { broadcaster.publish(submission).await }.in_current_span()).await??;
    debug!(id = message.id, "submitted over http");

    Ok(Json(message))
}
