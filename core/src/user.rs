use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, sqlite::SqliteRow};
use uuid::Uuid;

use crate::db::Database;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    pub async fn create(&self, name: &str, avatar_url: Option<&str>) -> Result<UserRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp_millis();
        let trimmed = name.trim();
        anyhow::ensure!(!trimmed.is_empty(), "user name must not be empty");

        sqlx::query(
            "INSERT INTO users (id, name, avatar_url, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(trimmed)
        .bind(avatar_url)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(UserRecord {
            id,
            name: trimmed.to_owned(),
            avatar_url: avatar_url.map(ToOwned::to_owned),
            created_at,
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, name, avatar_url, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Self::map_row))
    }

    fn map_row(row: SqliteRow) -> UserRecord {
        UserRecord {
            id: row.get("id"),
            name: row.get("name"),
            avatar_url: row.get("avatar_url"),
            created_at: row.get("created_at"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;

    #[tokio::test]
    async fn create_and_find() {
        let (_dir, database) = temp_database().await;
        let store = UserStore::new(&database);
        let created = store
            .create("Ada", Some("https://example.com/ada.png"))
            .await
            .expect("create user");

        let found = store
            .find_by_id(&created.id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(found.name, "Ada");
        assert_eq!(found.avatar_url.as_deref(), Some("https://example.com/ada.png"));
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let (_dir, database) = temp_database().await;
        let store = UserStore::new(&database);
        assert!(store.create("   ", None).await.is_err());
    }
}
