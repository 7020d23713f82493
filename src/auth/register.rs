use axum::{debug_handler, extract::State, Json};
use tower_sessions::Session;

use crate::{session::IDENTITY, AppResult, AppState};

use super::{Credentials, Identity};

#[debug_handler]
pub(crate) async fn register(
    State(state): State<AppState>,
    session: Session,

    Json(Credentials { username, password }): Json<Credentials>,
) -> AppResult<Json<Identity>> {
    let identity = state.identities.register(&username, &password).await?;

    session.cycle_id().await?;
    session.insert(IDENTITY, &identity).await?;

    Ok(Json(identity))
}
