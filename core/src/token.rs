use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::{db::Database, ids::UserId};

/// Identity attached to a connection for the lifetime of the socket.
#[derive(Debug, Clone)]
pub struct SessionPrincipal {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// The verification primitive the broker calls on handshake. Token issuance
/// belongs to the application tier; the broker only resolves a presented
/// token to an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<SessionPrincipal>>;
}

#[derive(Clone)]
pub struct TokenStore {
    pool: Pool<Sqlite>,
}

impl TokenStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    /// Mints a short-lived, single-use connection token for a known user.
    pub async fn issue(&self, user_id: &UserId, ttl_secs: u64) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + (ttl_secs as i64) * 1_000;

        let inserted = sqlx::query(
            "INSERT INTO session_tokens (token, user_id, created_at, expires_at)
             SELECT ?, id, ?, ? FROM users WHERE id = ?",
        )
        .bind(&token)
        .bind(now)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        anyhow::ensure!(
            inserted.rows_affected() > 0,
            "cannot issue token for unknown user {user_id}"
        );
        Ok(token)
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TokenVerifier for TokenStore {
    /// Tokens are single use: a successful verification consumes the row, so
    /// a reconnecting client must present a fresh token.
    async fn verify(&self, token: &str) -> Result<Option<SessionPrincipal>> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT t.expires_at, u.id AS user_id, u.name, u.avatar_url
             FROM session_tokens t
             JOIN users u ON u.id = t.user_id
             WHERE t.token = ?",
        )
        .bind(trimmed)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM session_tokens WHERE token = ?")
            .bind(trimmed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let expires_at: i64 = row.get("expires_at");
        if expires_at < Utc::now().timestamp_millis() {
            return Ok(None);
        }

        Ok(Some(SessionPrincipal {
            user_id: UserId::new(row.get::<String, _>("user_id")),
            name: row.get("name"),
            avatar_url: row.get("avatar_url"),
        }))
    }
}
