use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    /// Lifetime of a connection token minted by the application tier.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// How long a deleted workflow keeps denying re-joins.
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_path: default_database_path(),
            database_max_connections: default_database_max_connections(),
            token_ttl_secs: default_token_ttl_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
        }
    }
}

impl AppConfig {
    const BIND_ADDRESS_ENV: &'static str = "LOOMCAST_BIND_ADDRESS";
    const DATABASE_PATH_ENV: &'static str = "LOOMCAST_DATABASE_PATH";
    const DATABASE_MAX_CONNECTIONS_ENV: &'static str = "LOOMCAST_DATABASE_MAX_CONNECTIONS";
    const TOKEN_TTL_ENV: &'static str = "LOOMCAST_TOKEN_TTL_SECS";
    const TOMBSTONE_TTL_ENV: &'static str = "LOOMCAST_TOMBSTONE_TTL_SECS";

    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = env::var(Self::BIND_ADDRESS_ENV) {
            config.bind_address = addr
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::BIND_ADDRESS_ENV))?;
        }

        if let Ok(path) = env::var(Self::DATABASE_PATH_ENV) {
            let trimmed = path.trim().to_owned();
            if !trimmed.is_empty() {
                config.database_path = trimmed;
            }
        }

        if let Ok(value) = env::var(Self::DATABASE_MAX_CONNECTIONS_ENV) {
            config.database_max_connections = value.parse().with_context(|| {
                format!(
                    "invalid {} (expected positive integer)",
                    Self::DATABASE_MAX_CONNECTIONS_ENV
                )
            })?;
        }

        if let Ok(value) = env::var(Self::TOKEN_TTL_ENV) {
            config.token_ttl_secs = value.parse().with_context(|| {
                format!("invalid {} (expected seconds)", Self::TOKEN_TTL_ENV)
            })?;
        }

        if let Ok(value) = env::var(Self::TOMBSTONE_TTL_ENV) {
            config.tombstone_ttl_secs = value.parse().with_context(|| {
                format!("invalid {} (expected seconds)", Self::TOMBSTONE_TTL_ENV)
            })?;
        }

        Ok(config)
    }

    pub async fn init_database(&self) -> Result<Database> {
        Database::connect(self).await
    }

    pub fn database_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }
}

fn default_bind_address() -> SocketAddr {
    "127.0.0.1:3002"
        .parse()
        .expect("default bind address must be valid")
}

fn default_database_path() -> String {
    "data/loomcast.db".to_string()
}

fn default_database_max_connections() -> u32 {
    4
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_tombstone_ttl_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address.port(), 3002);
        assert_eq!(config.token_ttl_secs, 300);
        assert_eq!(config.tombstone_ttl_secs, 30);
        assert!(config.database_path.ends_with("loomcast.db"));
    }
}
