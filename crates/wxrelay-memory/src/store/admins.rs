//! Admin registry.

use super::SessionStore;
use tracing::info;
use wxrelay_core::error::RelayError;

impl SessionStore {
    /// Mark a sender as admin. Idempotent.
    pub async fn grant_admin(&self, sender_id: &str) -> Result<(), RelayError> {
        sqlx::query("INSERT OR IGNORE INTO admins (sender_id) VALUES (?)")
            .bind(sender_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Memory(format!("admin grant failed: {e}")))?;
        info!("granted admin to {sender_id}");
        Ok(())
    }

    pub async fn is_admin(&self, sender_id: &str) -> Result<bool, RelayError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT sender_id FROM admins WHERE sender_id = ?")
            .bind(sender_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Memory(format!("admin lookup failed: {e}")))?;
        Ok(row.is_some())
    }
}
