use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Standard,
    Admin,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Who a connection speaks for. Fixed for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub display_color: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown name or wrong secret")]
    AuthFailure,
    #[error("name is already taken")]
    NameTaken,
    #[error("name and secret must not be empty")]
    InvalidCredentials,
    #[error("identity storage failed: {0}")]
    Storage(#[from] sqlx::Error),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, name: &str, secret: &str) -> Result<Identity, AuthError>;

    async fn register(&self, name: &str, secret: &str) -> Result<Identity, AuthError>;
}

/// Users table with salted HMAC-SHA256 secret tags.
#[derive(Clone)]
pub struct SqliteIdentityProvider {
    db_pool: SqlitePool,
    default_color: String,
    admin_names: Vec<String>,
}

impl SqliteIdentityProvider {
    pub fn new(db_pool: SqlitePool, default_color: impl Into<String>, admin_names: Vec<String>) -> SqliteIdentityProvider {
        SqliteIdentityProvider {
            db_pool,
            default_color: default_color.into(),
            admin_names,
        }
    }
}

fn credentials<'a>(name: &'a str, secret: &'a str) -> Result<(&'a str, &'a str), AuthError> {
    let name = name.trim();
    if name.is_empty() || secret.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }
    Ok((name, secret))
}

fn keyed(salt: &[u8], secret: &str) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(salt).map_err(|_| AuthError::AuthFailure)?;
    mac.update(secret.as_bytes());
    Ok(mac)
}

#[async_trait]
impl IdentityProvider for SqliteIdentityProvider {
    async fn authenticate(&self, name: &str, secret: &str) -> Result<Identity, AuthError> {
        let (name, secret) = credentials(name, secret)?;

        let Some((salt, tag, display_color, is_admin)): Option<(Vec<u8>, Vec<u8>, String, bool)> =
            sqlx::query_as("SELECT secret_salt,secret_tag,display_color,is_admin FROM users WHERE name=?")
                .bind(name)
                .fetch_optional(&self.db_pool)
                .await?
        else {
            return Err(AuthError::AuthFailure);
        };

        keyed(&salt, secret)?
            .verify_slice(&tag)
            .map_err(|_| AuthError::AuthFailure)?;

        Ok(Identity {
            name: name.to_owned(),
            display_color,
            role: if is_admin { Role::Admin } else { Role::Standard },
        })
    }

    async fn register(&self, name: &str, secret: &str) -> Result<Identity, AuthError> {
        let (name, secret) = credentials(name, secret)?;

        let salt: [u8; 16] = rand::random();
        let tag = keyed(&salt, secret)?.finalize().into_bytes();
        let role = if self.admin_names.iter().any(|admin| admin == name) {
            Role::Admin
        } else {
            Role::Standard
        };

        let inserted = sqlx::query("INSERT INTO users (name,secret_salt,secret_tag,display_color,is_admin) VALUES (?,?,?,?,?)")
            .bind(name)
            .bind(&salt[..])
            .bind(&tag[..])
            .bind(&self.default_color)
            .bind(role.is_admin())
            .execute(&self.db_pool)
            .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => return Err(AuthError::NameTaken),
            Err(e) => return Err(e.into()),
        }

        info!(name, ?role, "registered user");
        Ok(Identity {
            name: name.to_owned(),
            display_color: self.default_color.clone(),
            role,
        })
    }
}
