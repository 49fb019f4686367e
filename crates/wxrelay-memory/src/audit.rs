//! Audit log of every terminal exchange through the relay.

use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;
use wxrelay_core::error::RelayError;

/// An entry to write to the audit log.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub channel: String,
    pub conversation_key: String,
    pub sender_id: String,
    pub input_text: String,
    pub output_text: Option<String>,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub processing_ms: Option<i64>,
    pub status: AuditStatus,
    pub error: Option<String>,
}

/// Status of an audited exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Ok,
    Error,
    /// Rejected because an exchange was already in flight.
    Busy,
    /// Answered by a chat command without reaching the backend.
    Command,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Busy => "busy",
            Self::Command => "command",
        }
    }
}

/// Audit logger backed by SQLite.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Create a new audit logger sharing the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write an entry to the audit log.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), RelayError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO audit_log \
             (id, channel, conversation_key, sender_id, input_text, output_text, \
              backend, model, processing_ms, status, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.channel)
        .bind(&entry.conversation_key)
        .bind(&entry.sender_id)
        .bind(&entry.input_text)
        .bind(&entry.output_text)
        .bind(&entry.backend)
        .bind(&entry.model)
        .bind(entry.processing_ms)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Memory(format!("audit log write failed: {e}")))?;

        debug!(
            "audit: {} {} [{}] {}",
            entry.channel,
            entry.sender_id,
            entry.status.as_str(),
            truncate(&entry.input_text, 80)
        );

        Ok(())
    }

    /// Entry count per status, most frequent first.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>, RelayError> {
        sqlx::query_as(
            "SELECT status, COUNT(*) AS n FROM audit_log GROUP BY status ORDER BY n DESC, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RelayError::Memory(format!("audit query failed: {e}")))
    }
}

/// Char-boundary-safe prefix.
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionStore, IN_MEMORY};
    use wxrelay_core::config::SessionConfig;

    fn entry(status: AuditStatus) -> AuditEntry {
        AuditEntry {
            channel: "wx849".into(),
            conversation_key: "wx849:wxid_alice".into(),
            sender_id: "wxid_alice".into(),
            input_text: "hello".into(),
            output_text: Some("hi".into()),
            backend: Some("chat_api".into()),
            model: None,
            processing_ms: Some(12),
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_log_and_count() {
        let config = SessionConfig {
            db_path: IN_MEMORY.into(),
            ..Default::default()
        };
        let store = SessionStore::new(&config).await.unwrap();
        let audit = AuditLogger::new(store.pool().clone());

        audit.log(&entry(AuditStatus::Ok)).await.unwrap();
        audit.log(&entry(AuditStatus::Ok)).await.unwrap();
        audit.log(&entry(AuditStatus::Busy)).await.unwrap();

        let counts = audit.counts().await.unwrap();
        assert_eq!(counts, vec![("ok".to_string(), 2), ("busy".to_string(), 1)]);
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("你好世界", 2), "你好");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
