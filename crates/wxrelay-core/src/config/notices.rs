use serde::{Deserialize, Serialize};

/// Canned texts sent to the chat by the relay itself.
///
/// Every field can be overridden under `[notices]`; `{persona}`, `{personas}`,
/// `{conversations}` and `{in_flight}` placeholders are filled where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Notices {
    /// Sent when a conversation already has an exchange in flight.
    pub busy: String,
    /// Sent when too many messages are already waiting for a worker.
    pub overloaded: String,
    /// Sent when the backend does not answer in time.
    pub timeout: String,
    /// Sent when the backend reports rate limiting.
    pub rate_limited: String,
    /// Sent for any other backend or storage failure.
    pub error: String,
    pub help: String,
    /// Acknowledgement for `clear session`.
    pub cleared: String,
    /// Acknowledgement for `set persona`. `{persona}`.
    pub persona_set: String,
    /// Unknown persona name. `{persona}`, `{personas}`.
    pub persona_unknown: String,
    pub admin_granted: String,
    pub admin_denied: String,
    /// Admin-only command from a non-admin.
    pub admin_required: String,
    /// Admin `status` output. `{conversations}`, `{in_flight}`.
    pub status: String,
}

impl Default for Notices {
    fn default() -> Self {
        Self {
            busy: "I'm still working on your previous message, please wait a moment.".into(),
            overloaded: "I'm handling a lot of conversations right now. Please try again in a minute.".into(),
            timeout: "Sorry, the assistant took too long to answer. Please try again.".into(),
            rate_limited: "The assistant is receiving too many requests right now. Please try again shortly.".into(),
            error: "Sorry, something went wrong while answering. Please try again later.".into(),
            help: "Commands:\n\
                   help: show this message\n\
                   clear session: forget the current conversation\n\
                   set persona <name>: switch the assistant persona\n\
                   auth <secret>: enter admin mode\n\
                   status: show relay status (admin)"
                .into(),
            cleared: "Session cleared. The next message starts a new conversation.".into(),
            persona_set: "Persona switched to {persona}.".into(),
            persona_unknown: "Unknown persona '{persona}'. Available: {personas}.".into(),
            admin_granted: "Admin mode enabled.".into(),
            admin_denied: "Authentication failed.".into(),
            admin_required: "This command requires admin mode.".into(),
            status: "Conversations: {conversations}\nIn flight: {in_flight}".into(),
        }
    }
}
