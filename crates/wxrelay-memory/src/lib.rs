//! # wxrelay-memory
//!
//! Conversation session store and audit log (SQLite-backed).

pub mod audit;
pub mod store;

pub use audit::AuditLogger;
pub use store::{ConversationContext, PendingRequest, SessionStats, SessionStore};
