//! SQLite-backed session store.
//!
//! Split into focused submodules:
//! - `sessions`: conversation contexts, the in-flight claim, eviction
//! - `admins`: admin registry for the `auth` command

mod admins;
mod sessions;

pub use sessions::{ConversationContext, PendingRequest, SessionStats};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use wxrelay_core::{config::SessionConfig, error::RelayError, shellexpand};

/// `db_path` value that keeps everything in memory.
pub const IN_MEMORY: &str = ":memory:";

/// Age after which an in-flight claim is considered abandoned.
const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Conversation session store backed by SQLite.
///
/// The only mutable state shared between dispatcher tasks. Every mutation
/// is a single SQL statement, so concurrent callers never interleave
/// within one operation.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    default_persona: String,
    group_shared_session: bool,
    /// Claims older than this may be taken over by a new exchange.
    claim_timeout_secs: i64,
}

impl SessionStore {
    /// Open (or create) the store, running migrations on first use.
    pub async fn new(config: &SessionConfig) -> Result<Self, RelayError> {
        let pool = if config.db_path == IN_MEMORY {
            let opts = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RelayError::Memory(format!("invalid db path: {e}")))?;
            // One connection: each in-memory connection is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await
                .map_err(|e| RelayError::Memory(format!("failed to open sqlite: {e}")))?
        } else {
            let db_path = shellexpand(&config.db_path);

            // Ensure parent directory exists.
            if let Some(parent) = std::path::Path::new(&db_path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RelayError::Memory(format!("failed to create data dir: {e}")))?;
            }

            let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
                .map_err(|e| RelayError::Memory(format!("invalid db path: {e}")))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(opts)
                .await
                .map_err(|e| RelayError::Memory(format!("failed to connect to sqlite: {e}")))?;
            info!("Session store initialized at {db_path}");
            pool
        };

        Self::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            default_persona: config.default_persona.clone(),
            group_shared_session: config.group_shared_session,
            claim_timeout_secs: DEFAULT_CLAIM_TIMEOUT.as_secs() as i64,
        })
    }

    /// Set how long an in-flight claim is honoured before a new exchange
    /// may take it over. Should exceed the backend timeout.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        self
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persona assigned to new conversations.
    pub fn default_persona(&self) -> &str {
        &self.default_persona
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), RelayError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| RelayError::Memory(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            (
                "001_sessions",
                include_str!("../../migrations/001_sessions.sql"),
            ),
            (
                "002_audit_log",
                include_str!("../../migrations/002_audit_log.sql"),
            ),
            ("003_admins", include_str!("../../migrations/003_admins.sql")),
            (
                "004_session_generation",
                include_str!("../../migrations/004_session_generation.sql"),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        RelayError::Memory(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| RelayError::Memory(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    RelayError::Memory(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
