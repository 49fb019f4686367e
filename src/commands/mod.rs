//! Built-in chat commands. Answered instantly, never sent to the backend.


use std::collections::BTreeMap;
use tracing::{info, warn};
use wxrelay_core::{config::Notices, message::ConversationId};
use wxrelay_memory::SessionStore;

/// Grouped context for command execution.
pub struct CommandContext<'a> {
    pub store: &'a SessionStore,
    pub conversation: &'a ConversationId,
    pub personas: &'a BTreeMap<String, String>,
    /// Empty disables admin mode.
    pub admin_secret: &'a str,
    pub notices: &'a Notices,
}

/// Known chat commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    ClearSession,
    SetPersona(String),
    Auth(String),
    Status,
}

impl Command {
    /// Parse a command from admitted message text.
    ///
    /// An optional leading `#` or `/` is accepted and keywords are
    /// case-insensitive. Anything else passes through to the backend.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text
            .strip_prefix('#')
            .or_else(|| text.strip_prefix('/'))
            .unwrap_or(text);
        let words: Vec<&str> = text.split_whitespace().collect();
        let lower: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
        let lower: Vec<&str> = lower.iter().map(String::as_str).collect();

        // Arguments keep their original case.
        match lower.as_slice() {
            ["help"] => Some(Self::Help),
            ["reset"] | ["clear", "session"] => Some(Self::ClearSession),
            ["status"] => Some(Self::Status),
            ["set", "persona", ..] => Some(Self::SetPersona(words[2..].join(" "))),
            ["auth", _, ..] => Some(Self::Auth(words[1..].join(" "))),
            _ => None,
        }
    }

    /// Text safe to write to the audit log.
    pub fn audit_text(&self, original: &str) -> String {
        match self {
            Self::Auth(_) => "auth ***".to_string(),
            _ => original.to_string(),
        }
    }
}

/// Handle a command and return the response text.
pub async fn handle(cmd: Command, ctx: &CommandContext<'_>) -> String {
    let notices = ctx.notices;
    let key = ctx.store.key_for(ctx.conversation);
    match cmd {
        Command::Help => notices.help.clone(),
        Command::ClearSession => match ctx.store.reset(&key).await {
            Ok(_) => {
                info!("session {key} cleared");
                notices.cleared.clone()
            }
            Err(e) => {
                warn!("failed to clear session {key}: {e}");
                notices.error.clone()
            }
        },
        Command::SetPersona(name) => handle_set_persona(ctx, &key, &name).await,
        Command::Auth(secret) => handle_auth(ctx, &secret).await,
        Command::Status => handle_status(ctx).await,
    }
}

async fn handle_set_persona(ctx: &CommandContext<'_>, key: &str, name: &str) -> String {
    let notices = ctx.notices;
    let known = if ctx.personas.is_empty() {
        !name.is_empty()
    } else {
        ctx.personas.contains_key(name)
    };
    if !known {
        let available = ctx
            .personas
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        return notices
            .persona_unknown
            .replace("{persona}", name)
            .replace("{personas}", &available);
    }

    // The backend applies persona inputs at conversation start, so the
    // switch also drops the backend-side history.
    let result = async {
        ctx.store.get_or_create(ctx.conversation).await?;
        ctx.store.set_persona(key, name).await?;
        ctx.store.set_history_ref(key, None).await
    }
    .await;

    match result {
        Ok(_) => {
            info!("session {key}: persona set to {name}");
            notices.persona_set.replace("{persona}", name)
        }
        Err(e) => {
            warn!("failed to set persona for {key}: {e}");
            notices.error.clone()
        }
    }
}

async fn handle_auth(ctx: &CommandContext<'_>, secret: &str) -> String {
    let sender = &ctx.conversation.sender_id;
    if ctx.admin_secret.is_empty() || secret != ctx.admin_secret {
        warn!("admin auth failed for {sender}");
        return ctx.notices.admin_denied.clone();
    }
    match ctx.store.grant_admin(sender).await {
        Ok(()) => ctx.notices.admin_granted.clone(),
        Err(e) => {
            warn!("admin grant failed for {sender}: {e}");
            ctx.notices.error.clone()
        }
    }
}

async fn handle_status(ctx: &CommandContext<'_>) -> String {
    match ctx.store.is_admin(&ctx.conversation.sender_id).await {
        Ok(true) => {}
        Ok(false) => return ctx.notices.admin_required.clone(),
        Err(e) => {
            warn!("admin lookup failed: {e}");
            return ctx.notices.error.clone();
        }
    }
    match ctx.store.stats().await {
        Ok(stats) => ctx
            .notices
            .status
            .replace("{conversations}", &stats.conversations.to_string())
            .replace("{in_flight}", &stats.in_flight.to_string()),
        Err(e) => {
            warn!("session stats failed: {e}");
            ctx.notices.error.clone()
        }
    }
}
