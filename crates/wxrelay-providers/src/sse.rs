//! Server-Sent Events assembly for streamed chat answers.
//!
//! The stream is a sequence of `data: {json}` blocks separated by blank
//! lines. `message` events carry answer fragments, `message_end` closes
//! the answer, `error` aborts it. Other events (`ping`, workflow
//! progress) are ignored.

use serde::Deserialize;
use tracing::warn;
use wxrelay_core::error::BackendError;

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Accumulates raw stream bytes into one answer.
#[derive(Debug, Default)]
pub struct SseAssembler {
    buf: Vec<u8>,
    answer: String,
    conversation_id: Option<String>,
    ended: bool,
}

/// Complete streamed answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedAnswer {
    pub answer: String,
    pub conversation_id: Option<String>,
}

impl SseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk. Blocks are only decoded once complete, so a
    /// multi-byte character split across chunks is reassembled first.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), BackendError> {
        self.buf.extend_from_slice(chunk);
        while let Some((end, sep)) = find_block_end(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..end + sep).collect();
            self.apply_block(&String::from_utf8_lossy(&block[..end]))?;
        }
        Ok(())
    }

    /// Whether `message_end` has been seen.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Flush any trailing block and return the assembled answer.
    pub fn finish(mut self) -> Result<StreamedAnswer, BackendError> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.apply_block(&String::from_utf8_lossy(&rest))?;
        }
        if !self.ended {
            warn!("chat stream closed without message_end");
        }
        if self.answer.trim().is_empty() {
            return Err(BackendError::MalformedResponse(
                "stream ended without an answer".into(),
            ));
        }
        Ok(StreamedAnswer {
            answer: self.answer,
            conversation_id: self.conversation_id,
        })
    }

    fn apply_block(&mut self, block: &str) -> Result<(), BackendError> {
        for line in block.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
                BackendError::MalformedResponse(format!("bad stream event: {e}"))
            })?;
            self.apply_event(event)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, event: StreamEvent) -> Result<(), BackendError> {
        if let Some(id) = event.conversation_id.filter(|id| !id.is_empty()) {
            self.conversation_id = Some(id);
        }
        match event.event.as_str() {
            "message" | "agent_message" => {
                if let Some(fragment) = event.answer {
                    self.answer.push_str(&fragment);
                }
            }
            "message_end" => self.ended = true,
            "error" => {
                let detail = event.message.unwrap_or_else(|| "unknown error".into());
                return Err(match event.status {
                    Some(401) | Some(403) => BackendError::AuthFailure(detail),
                    Some(429) => BackendError::RateLimited {
                        retry_after_secs: None,
                    },
                    _ => BackendError::Unavailable(format!("stream error: {detail}")),
                });
            }
            _ => {}
        }
        Ok(())
    }
}

/// Position of the first blank-line separator and its length.
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
