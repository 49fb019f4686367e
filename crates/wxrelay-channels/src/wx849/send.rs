//! Outbound text delivery with retry, and reply formatting.

use super::types::{sent_message_id, status_error, transport_error, ApiEnvelope, SendTextRequest};
use super::Wx849Channel;
use std::time::Duration;
use tracing::{debug, error, warn};
use wxrelay_core::{error::TransportError, message::DeliveryReceipt};

/// Waits before each retry (exponential backoff: 500ms, 1s, 2s).
pub(crate) const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

impl Wx849Channel {
    /// Send text to a chat, retrying transient failures.
    pub(crate) async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, TransportError> {
        let content = strip_markdown(text);
        let request = SendTextRequest {
            wxid: &self.config.wxid,
            to_wxid: chat_id,
            content: &content,
            msg_type: 1,
            at: "",
        };

        let mut attempts: u32 = 0;
        let mut delays = RETRY_DELAYS_MS.iter();
        loop {
            attempts += 1;
            let err = match self.send_once(&request).await {
                Ok(message_id) => {
                    debug!("wx849: delivered to {chat_id} (attempt {attempts})");
                    return Ok(DeliveryReceipt {
                        message_id,
                        attempts,
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                error!("wx849: send to {chat_id} rejected: {err}");
                return Err(err);
            }
            match delays.next() {
                Some(delay_ms) => {
                    warn!("wx849: send to {chat_id} failed (attempt {attempts}), retrying in {delay_ms}ms: {err}");
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
                None => {
                    error!("wx849: send to {chat_id} failed after {attempts} attempts: {err}");
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &SendTextRequest<'_>,
    ) -> Result<Option<String>, TransportError> {
        let url = format!("{}/Msg/SendTxt", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let envelope: ApiEnvelope = resp.json().await.map_err(transport_error)?;
        let data = envelope.into_data()?;
        Ok(sent_message_id(&data))
    }
}

/// Strip Markdown the IM client would show literally.
///
/// Headers lose their `#`, bold and inline code markers are removed,
/// code fences and horizontal rules are dropped, tables become dash-prefixed
/// rows, and `[text](url)` becomes `text (url)`. Lines inside a code fence
/// are kept verbatim.
pub fn strip_markdown(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push(line.to_string());
            continue;
        }
        if is_rule(trimmed) {
            continue;
        }
        if trimmed.starts_with('|') && trimmed.ends_with('|') {
            if trimmed
                .chars()
                .all(|c| matches!(c, '|' | '-' | ':' | ' '))
            {
                continue;
            }
            let cells: Vec<&str> = trimmed
                .trim_matches('|')
                .split('|')
                .map(str::trim)
                .collect();
            out.push(format!("- {}", inline(&cells.join(" | "))));
            continue;
        }

        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
            out.push(inline(trimmed[hashes..].trim()));
            continue;
        }

        if let Some(item) = trimmed.strip_prefix("* ") {
            let indent = &line[..line.len() - line.trim_start().len()];
            out.push(format!("{indent}- {}", inline(item)));
            continue;
        }

        out.push(inline(line));
    }

    out.join("\n")
}

fn is_rule(line: &str) -> bool {
    match line.chars().next() {
        Some(first @ ('-' | '*' | '_')) => line.len() >= 3 && line.chars().all(|c| c == first),
        _ => false,
    }
}

fn inline(line: &str) -> String {
    rewrite_links(&line.replace("**", "").replace('`', ""))
}

/// `[text](url)` → `text (url)`; `![alt](url)` → `alt (url)`.
fn rewrite_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find("](").map(|i| open + i) else {
            break;
        };
        let Some(end) = rest[close + 2..].find(')').map(|i| close + 2 + i) else {
            break;
        };
        let before = &rest[..open];
        out.push_str(before.strip_suffix('!').unwrap_or(before));
        let label = &rest[open + 1..close];
        let url = &rest[close + 2..end];
        if label.is_empty() {
            out.push_str(url);
        } else {
            out.push_str(&format!("{label} ({url})"));
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}
