use std::str::FromStr;

use anyhow::Context;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

/// Opens the pool and brings the schema up to date.
///
/// Connections are never reaped, so a `sqlite::memory:` database lives as long as the pool.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true);

    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("connect sqlite")?;

    sqlx::migrate!()
        .run(&db_pool)
        .await
        .context("run migrations")?;

    Ok(db_pool)
}

#[cfg(test)]
pub(crate) async fn memory() -> SqlitePool {
    connect("sqlite::memory:", 1).await.unwrap()
}
