//! Conversation contexts: lookup, the in-flight claim, persona, history, eviction.

use super::SessionStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;
use wxrelay_core::{error::RelayError, message::ConversationId};

/// Per-conversation state as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub key: String,
    pub conversation: ConversationId,
    pub persona: String,
    /// Backend-side conversation handle, if the backend keeps history.
    pub history_ref: Option<String>,
    /// Id of the exchange currently running, if any.
    pub in_flight: Option<Uuid>,
    pub last_activity: String,
}

impl ConversationContext {
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Token proving ownership of a conversation's in-flight flag.
///
/// Only the holder of the matching request id can clear the flag, so a
/// late completion from an earlier exchange never releases a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub conversation_key: String,
    pub request_id: Uuid,
    /// Reset generation of the context when the claim was taken.
    pub generation: i64,
    pub started_at: DateTime<Utc>,
}

/// Counts reported by the admin `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub conversations: i64,
    pub in_flight: i64,
}

type ContextRow = (
    String,
    String,
    String,
    bool,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn memory_err(op: &str) -> impl Fn(sqlx::Error) -> RelayError + '_ {
    move |e| RelayError::Memory(format!("{op} failed: {e}"))
}

impl SessionStore {
    /// Session key for a conversation under the configured group policy.
    pub fn key_for(&self, conversation: &ConversationId) -> String {
        conversation.key(self.group_shared_session)
    }

    /// Fetch the context for a conversation, creating it if absent.
    /// Touches `last_activity` either way.
    pub async fn get_or_create(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationContext, RelayError> {
        let key = self.key_for(conversation);
        sqlx::query(
            "INSERT INTO sessions (conversation_key, chat_id, sender_id, is_group, persona) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(conversation_key) DO UPDATE SET last_activity = datetime('now')",
        )
        .bind(&key)
        .bind(&conversation.chat_id)
        .bind(&conversation.sender_id)
        .bind(conversation.is_group)
        .bind(&self.default_persona)
        .execute(&self.pool)
        .await
        .map_err(memory_err("session upsert"))?;

        self.get(&key)
            .await?
            .ok_or_else(|| RelayError::Memory(format!("session {key} vanished after upsert")))
    }

    /// Fetch a context without creating or touching it.
    pub async fn get(&self, key: &str) -> Result<Option<ConversationContext>, RelayError> {
        let row: Option<ContextRow> = sqlx::query_as(
            "SELECT conversation_key, chat_id, sender_id, is_group, persona, \
                    history_ref, in_flight_request, last_activity \
             FROM sessions WHERE conversation_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(memory_err("session query"))?;

        Ok(row.map(
            |(key, chat_id, sender_id, is_group, persona, history_ref, in_flight, last_activity)| {
                ConversationContext {
                    key,
                    conversation: ConversationId {
                        chat_id,
                        sender_id,
                        is_group,
                    },
                    persona,
                    history_ref,
                    in_flight: in_flight.and_then(|id| Uuid::parse_str(&id).ok()),
                    last_activity,
                }
            },
        ))
    }

    /// Atomically claim the conversation for one exchange.
    ///
    /// Returns `None` when another exchange already holds it. A claim older
    /// than the store's claim timeout is treated as abandoned and taken over.
    pub async fn try_set_in_flight(&self, key: &str) -> Result<Option<PendingRequest>, RelayError> {
        let request_id = Uuid::new_v4();
        let claimed: Option<(i64,)> = sqlx::query_as(
            "UPDATE sessions SET in_flight_request = ?, in_flight_since = datetime('now'), \
                    last_activity = datetime('now') \
             WHERE conversation_key = ? \
             AND (in_flight_request IS NULL \
                  OR datetime(in_flight_since) <= datetime('now', ? || ' seconds')) \
             RETURNING generation",
        )
        .bind(request_id.to_string())
        .bind(key)
        .bind(-self.claim_timeout_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(memory_err("in-flight claim"))?;

        Ok(claimed.map(|(generation,)| {
            debug!("session {key}: in flight as {request_id}");
            PendingRequest {
                conversation_key: key.to_string(),
                request_id,
                generation,
                started_at: Utc::now(),
            }
        }))
    }

    /// Release the in-flight flag if `pending` still owns it.
    pub async fn clear_in_flight(&self, pending: &PendingRequest) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE sessions SET in_flight_request = NULL, in_flight_since = NULL \
             WHERE conversation_key = ? AND in_flight_request = ?",
        )
        .bind(&pending.conversation_key)
        .bind(pending.request_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(memory_err("in-flight release"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a finished exchange and release the flag, in one step.
    ///
    /// The new history reference is kept (an absent one leaves the previous
    /// in place) unless the conversation was reset while the exchange ran.
    /// Returns whether `pending` still owned the flag.
    pub async fn complete(
        &self,
        pending: &PendingRequest,
        history_ref: Option<&str>,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE sessions SET \
                    history_ref = CASE WHEN generation = ? \
                                       THEN COALESCE(?, history_ref) \
                                       ELSE history_ref END, \
                    in_flight_request = NULL, in_flight_since = NULL, \
                    last_activity = datetime('now') \
             WHERE conversation_key = ? AND in_flight_request = ?",
        )
        .bind(pending.generation)
        .bind(history_ref)
        .bind(&pending.conversation_key)
        .bind(pending.request_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(memory_err("exchange completion"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Forget a conversation. The next exchange starts with the default
    /// persona and no history.
    ///
    /// An idle context is deleted. A context with an exchange running keeps
    /// its row and its claim, so no second exchange can start before the
    /// running one finishes; the running one can no longer record history.
    pub async fn reset(&self, key: &str) -> Result<bool, RelayError> {
        let mut tx = self.pool.begin().await.map_err(memory_err("session reset"))?;

        let kept = sqlx::query(
            "UPDATE sessions SET persona = ?, history_ref = NULL, \
                    generation = generation + 1, last_activity = datetime('now') \
             WHERE conversation_key = ? AND in_flight_request IS NOT NULL",
        )
        .bind(&self.default_persona)
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(memory_err("session reset"))?;

        let removed = if kept.rows_affected() == 0 {
            sqlx::query("DELETE FROM sessions WHERE conversation_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(memory_err("session reset"))?
                .rows_affected()
        } else {
            debug!("session {key}: reset while in flight, claim kept");
            0
        };

        tx.commit().await.map_err(memory_err("session reset"))?;
        Ok(kept.rows_affected() + removed > 0)
    }

    pub async fn set_persona(&self, key: &str, persona: &str) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE sessions SET persona = ?, last_activity = datetime('now') \
             WHERE conversation_key = ?",
        )
        .bind(persona)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(memory_err("persona update"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Replace the history reference. A running exchange will not overwrite it.
    pub async fn set_history_ref(
        &self,
        key: &str,
        history_ref: Option<&str>,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE sessions SET history_ref = ?, generation = generation + 1 \
             WHERE conversation_key = ?",
        )
        .bind(history_ref)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(memory_err("history update"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove contexts idle for at least `ttl_secs`. Rows with a live
    /// claim are kept; abandoned claims do not protect a row.
    pub async fn evict_idle(&self, ttl_secs: u64) -> Result<u64, RelayError> {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "DELETE FROM sessions \
             WHERE (in_flight_request IS NULL \
                    OR datetime(in_flight_since) <= datetime('now', ? || ' seconds')) \
             AND datetime(last_activity) <= datetime('now', ? || ' seconds')",
        )
        .bind(-self.claim_timeout_secs)
        .bind(-ttl)
        .execute(&self.pool)
        .await
        .map_err(memory_err("idle eviction"))?;

        let evicted = result.rows_affected();
        if evicted > 0 {
            info!("evicted {evicted} idle conversation(s)");
        }
        Ok(evicted)
    }

    /// Clear every in-flight flag. Called once at startup: no exchange
    /// survives a restart.
    pub async fn release_stale_in_flight(&self) -> Result<u64, RelayError> {
        let result = sqlx::query(
            "UPDATE sessions SET in_flight_request = NULL, in_flight_since = NULL \
             WHERE in_flight_request IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(memory_err("stale in-flight release"))?;

        let released = result.rows_affected();
        if released > 0 {
            info!("released {released} in-flight flag(s) left by a previous run");
        }
        Ok(released)
    }

    pub async fn stats(&self) -> Result<SessionStats, RelayError> {
        let (conversations, in_flight): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(in_flight_request) FROM sessions",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(memory_err("session stats"))?;
        Ok(SessionStats {
            conversations,
            in_flight,
        })
    }
}
