use std::{net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,

    /// How many messages a joining connection is replayed, also the cap for `/messages`.
    pub history_limit: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,

    pub default_color: String,
    pub allow_anonymous: bool,
    pub admin_names: Vec<String>,
    pub session_expiry_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://chat.db?mode=rwc".to_owned(),
            database_max_connections: 16,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            history_limit: 50,
            outbound_queue: 256,
            default_color: "#FFFFFF".to_owned(),
            allow_anonymous: true,
            admin_names: Vec::new(),
            session_expiry_minutes: 60,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        let config = Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.database_max_connections)?,
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            history_limit: parse_or(&lookup, "HISTORY_LIMIT", defaults.history_limit)?,
            outbound_queue: parse_or(&lookup, "OUTBOUND_QUEUE", defaults.outbound_queue)?,
            default_color: lookup("DEFAULT_COLOR")
                .map(|color| color.trim().to_owned())
                .filter(|color| !color.is_empty())
                .unwrap_or(defaults.default_color),
            allow_anonymous: parse_or(&lookup, "ALLOW_ANONYMOUS", defaults.allow_anonymous)?,
            admin_names: lookup("ADMIN_NAMES")
                .map(|names| {
                    names.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            session_expiry_minutes: parse_or(&lookup, "SESSION_EXPIRY_MINUTES", defaults.session_expiry_minutes)?,
        };

        if config.history_limit == 0 {
            return Err(anyhow!("HISTORY_LIMIT must be positive"));
        }
        if config.outbound_queue == 0 {
            return Err(anyhow!("OUTBOUND_QUEUE must be positive"));
        }
        if config.database_max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be positive"));
        }

        Ok(config)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
