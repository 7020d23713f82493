pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing::error;

use auth::{AuthError, IdentityProvider, SqliteIdentityProvider};
use chat::{Broadcaster, ChatError, ConnectionRegistry, MessageStore, SqliteMessageStore};
use config::Config;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn MessageStore>,
    pub identities: Arc<dyn IdentityProvider>,
    pub registry: ConnectionRegistry,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(config: Config, db_pool: SqlitePool) -> AppState {
        let store = Arc::new(SqliteMessageStore::new(db_pool.clone()));
        let identities = Arc::new(SqliteIdentityProvider::new(
            db_pool,
            config.default_color.clone(),
            config.admin_names.clone(),
        ));
        AppState::from_parts(config, store, identities)
    }

    pub fn from_parts(config: Config, store: Arc<dyn MessageStore>, identities: Arc<dyn IdentityProvider>) -> AppState {
        let registry = ConnectionRegistry::new();
        let broadcaster = Broadcaster::new(Arc::clone(&store), registry.clone(), config.default_color.clone());

        AppState {
            config: Arc::new(config),
            store,
            identities,
            registry,
            broadcaster,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(state.config.session_expiry_minutes)));

    Router::new()
        .merge(auth::router())
        .merge(chat::router())
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> AppError {
        AppError {
            status,
            error: anyhow::Error::msg(msg.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(error = ?self.error, "request failed");
        }

        (
            self.status,
            Json(json!({ "detail": self.error.to_string() })),
        )
            .into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::AuthFailure => StatusCode::UNAUTHORIZED,
            AuthError::NameTaken => StatusCode::CONFLICT,
            AuthError::InvalidCredentials => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: anyhow::Error::from(err),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let status = match err {
            ChatError::InvalidMessage => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: anyhow::Error::from(err),
        }
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: anyhow::Error::from(err),
                }
            }
        }
    };
}

apperr_impl!(chat::StorageFailure);
apperr_impl!(sqlx::Error);
apperr_impl!(tokio::task::JoinError);
apperr_impl!(tower_sessions::session::Error);
