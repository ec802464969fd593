use std::{fs, fs::File, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl Database {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let path = Self::resolve_db_path(&config.database_path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }

        if !path.exists() {
            File::create(&path)
                .with_context(|| format!("failed to create database file: {}", path.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database_max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to database: {}", path.display()))?;

        run_migrations(&pool).await?;

        Ok(Self { pool, path })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn database_path(&self) -> &PathBuf {
        &self.path
    }

    fn resolve_db_path(path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            Ok(path)
        } else {
            let cwd = std::env::current_dir().context("failed to obtain current directory")?;
            Ok(cwd.join(path))
        }
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
         id TEXT PRIMARY KEY,
         name TEXT NOT NULL,
         avatar_url TEXT,
         created_at INTEGER NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS session_tokens (
         token TEXT PRIMARY KEY,
         user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
         created_at INTEGER NOT NULL,
         expires_at INTEGER NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS workspace_permissions (
         workspace_id TEXT NOT NULL,
         user_id TEXT NOT NULL,
         role TEXT NOT NULL,
         PRIMARY KEY (workspace_id, user_id)
     )",
    "CREATE TABLE IF NOT EXISTS workflows (
         id TEXT PRIMARY KEY,
         workspace_id TEXT NOT NULL,
         folder_id TEXT,
         name TEXT NOT NULL,
         is_deployed INTEGER NOT NULL DEFAULT 0,
         deployed_at INTEGER,
         last_saved INTEGER NOT NULL,
         created_at INTEGER NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS workflow_blocks (
         workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
         id TEXT NOT NULL,
         block_type TEXT NOT NULL,
         name TEXT NOT NULL,
         position_x REAL NOT NULL,
         position_y REAL NOT NULL,
         enabled INTEGER NOT NULL DEFAULT 1,
         parent_id TEXT,
         sub_blocks TEXT NOT NULL DEFAULT '{}',
         PRIMARY KEY (workflow_id, id)
     )",
    "CREATE TABLE IF NOT EXISTS workflow_edges (
         workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
         id TEXT NOT NULL,
         source_block_id TEXT NOT NULL,
         target_block_id TEXT NOT NULL,
         source_handle TEXT,
         target_handle TEXT,
         PRIMARY KEY (workflow_id, id)
     )",
    "CREATE TABLE IF NOT EXISTS workflow_subflows (
         workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
         id TEXT NOT NULL,
         kind TEXT NOT NULL,
         config TEXT NOT NULL DEFAULT '{}',
         PRIMARY KEY (workflow_id, id)
     )",
    "CREATE TABLE IF NOT EXISTS workflow_variables (
         workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
         id TEXT NOT NULL,
         name TEXT NOT NULL,
         var_type TEXT NOT NULL,
         value TEXT NOT NULL DEFAULT 'null',
         PRIMARY KEY (workflow_id, id)
     )",
    "CREATE INDEX IF NOT EXISTS idx_workflows_workspace ON workflows(workspace_id)",
    "CREATE INDEX IF NOT EXISTS idx_workflows_folder ON workflows(folder_id)",
    "CREATE INDEX IF NOT EXISTS idx_session_tokens_expiry ON session_tokens(expires_at)",
];

pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed: {}", first_line(statement)))?;
    }
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement).trim()
}
