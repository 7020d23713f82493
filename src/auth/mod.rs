mod identity;
mod login;
mod logout;
mod register;

use axum::{routing::post, Router};
use serde::Deserialize;

use crate::AppState;

pub use identity::{AuthError, Identity, IdentityProvider, Role, SqliteIdentityProvider};

#[derive(Deserialize)]
pub(crate) struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register::register))
        .route("/login", post(login::login))
        .route("/logout", post(logout::logout))
}
