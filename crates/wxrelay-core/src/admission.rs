//! Admission filter: decides which inbound messages reach the backend.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//! content kind, system accounts, blacklist, whitelist, group trigger
//! (prefix or `@`-mention of the bot), private prefix. An accepted message
//! has its trigger stripped.

use crate::config::{FilterConfig, IgnoreMode};
use crate::message::{Content, ContentKind, Message};
use std::collections::HashSet;

/// Platform accounts that never talk to the bot.
const SYSTEM_ACCOUNTS: &[&str] = &[
    "weixin",
    "filehelper",
    "fmessage",
    "medianote",
    "floatbottle",
    "qmessage",
    "qqmail",
    "tmessage",
    "weibo",
    "newsapp",
    "notification_messages",
    "helper_entry",
    "mphelper",
    "brandsessionholder",
    "weixinreminder",
    "officialaccounts",
];

/// Lowercase fragments marking payment, game and official service accounts.
const SYSTEM_ACCOUNT_MARKERS: &[&str] = &["wxpay", "tencent", "game", "service", "official"];

/// Why a message was filtered out. Not an error: rejected messages are
/// dropped without a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnsupportedKind(ContentKind),
    SystemAccount(String),
    Blacklisted(String),
    NotWhitelisted,
    MissingGroupPrefix,
    MissingPrivatePrefix,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedKind(kind) => write!(f, "unsupported content kind {kind}"),
            Self::SystemAccount(id) => write!(f, "system account {id}"),
            Self::Blacklisted(id) => write!(f, "{id} is blacklisted"),
            Self::NotWhitelisted => f.write_str("not in whitelist"),
            Self::MissingGroupPrefix => f.write_str("group message without trigger prefix"),
            Self::MissingPrivatePrefix => f.write_str("private message without trigger prefix"),
        }
    }
}

/// A message that passed admission, with the text the backend should see.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub message: Message,
    /// Content with the trigger prefix and leading whitespace removed.
    pub text: String,
}

impl Admitted {
    /// What the backend is asked. A quote-reply leads with the quoted text
    /// so the backend sees what the reply refers to.
    pub fn prompt(&self) -> String {
        match &self.message.content {
            Content::Text {
                quote: Some(quote), ..
            } if !quote.trim().is_empty() => {
                format!("\u{300c}{}\u{300d}\n---\n{}", quote.trim(), self.text)
            }
            _ => self.text.clone(),
        }
    }
}

/// Evaluates `FilterConfig` rules against inbound messages.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    mode: IgnoreMode,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
    private_prefixes: Vec<String>,
    group_prefixes: Vec<String>,
    accept_media: HashSet<ContentKind>,
    ignore_system_accounts: bool,
    /// The bot's own account. An `@`-mention of it triggers in groups.
    self_id: Option<String>,
}

impl AdmissionFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            mode: config.ignore_mode,
            whitelist: config.whitelist.iter().cloned().collect(),
            blacklist: config.blacklist.iter().cloned().collect(),
            private_prefixes: config.single_chat_prefix.clone(),
            group_prefixes: config.group_chat_prefix.clone(),
            accept_media: config.accept_media.iter().copied().collect(),
            ignore_system_accounts: config.ignore_system_accounts,
            self_id: None,
        }
    }

    /// Also admit group messages that `@`-mention `wxid`.
    pub fn with_self_id(mut self, wxid: &str) -> Self {
        self.self_id = (!wxid.is_empty()).then(|| wxid.to_string());
        self
    }

    /// Run the rule chain. The message is moved into the result on success.
    pub fn admit(&self, message: Message) -> Result<Admitted, RejectReason> {
        let kind = message.kind();
        match kind {
            ContentKind::Text => {}
            ContentKind::Image | ContentKind::Voice | ContentKind::File
                if self.accept_media.contains(&kind) => {}
            _ => return Err(RejectReason::UnsupportedKind(kind)),
        }

        let conv = &message.conversation;
        let group_id = conv.is_group.then_some(conv.chat_id.as_str());

        if self.ignore_system_accounts {
            for id in std::iter::once(conv.sender_id.as_str()).chain(group_id) {
                if is_system_account(id) {
                    return Err(RejectReason::SystemAccount(id.to_string()));
                }
            }
        }

        match self.mode {
            IgnoreMode::Blacklist => {
                for id in std::iter::once(conv.sender_id.as_str()).chain(group_id) {
                    if self.blacklist.contains(id) {
                        return Err(RejectReason::Blacklisted(id.to_string()));
                    }
                }
            }
            IgnoreMode::Whitelist => {
                let listed = self.whitelist.contains(&conv.sender_id)
                    || group_id.is_some_and(|g| self.whitelist.contains(g));
                if !listed {
                    return Err(RejectReason::NotWhitelisted);
                }
            }
            IgnoreMode::None => {}
        }

        let content = message.content.as_prompt_text();
        let stripped = if conv.is_group {
            match match_prefix(&content, &self.group_prefixes, false) {
                Some(prefix) => strip(&content, prefix),
                None if self.mentions_self(&message) => strip_leading_mention(&content),
                None => return Err(RejectReason::MissingGroupPrefix),
            }
        } else {
            let prefix = match_prefix(&content, &self.private_prefixes, true)
                .ok_or(RejectReason::MissingPrivatePrefix)?;
            strip(&content, prefix)
        };

        Ok(Admitted {
            message,
            text: stripped,
        })
    }

    fn mentions_self(&self, message: &Message) -> bool {
        self.self_id
            .as_ref()
            .is_some_and(|id| message.mentions.iter().any(|m| m == id))
    }
}

/// Official accounts, fixed platform accounts, payment and game notices.
pub fn is_system_account(id: &str) -> bool {
    if id.starts_with("gh_") || SYSTEM_ACCOUNTS.contains(&id) {
        return true;
    }
    let lower = id.to_lowercase();
    SYSTEM_ACCOUNT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Longest prefix in `prefixes` that `text` starts with.
///
/// An empty list matches everything only when `empty_matches_all` is set.
/// A prefix ending in an ASCII letter or digit must end a word: `@bot`
/// matches `@bot hi` but not `@bottle hi`.
fn match_prefix<'a>(text: &str, prefixes: &'a [String], empty_matches_all: bool) -> Option<&'a str> {
    if prefixes.is_empty() {
        return empty_matches_all.then_some("");
    }
    prefixes
        .iter()
        .filter(|p| text.starts_with(p.as_str()) && ends_word(text, p))
        .max_by_key(|p| p.len())
        .map(String::as_str)
}

fn ends_word(text: &str, prefix: &str) -> bool {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !prefix.chars().next_back().is_some_and(is_word) {
        return true;
    }
    !text[prefix.len()..].chars().next().is_some_and(is_word)
}

/// Drop a leading `@Display Name` mention, which ends at U+2005 (or a
/// plain space when the client sent one).
fn strip_leading_mention(text: &str) -> String {
    let Some(rest) = text.strip_prefix('@') else {
        return text.trim_start().to_string();
    };
    match rest.find('\u{2005}').or_else(|| rest.find(' ')) {
        Some(end) => rest[end..].trim_start().to_string(),
        None => String::new(),
    }
}

fn strip(text: &str, prefix: &str) -> String {
    text[prefix.len()..].trim_start().to_string()
}
