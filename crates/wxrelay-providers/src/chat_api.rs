//! Conversational-app chat API backend.
//!
//! `POST {base}/chat-messages`. The backend keeps the conversation history
//! itself and hands back a `conversation_id`, which the relay stores as the
//! session's history reference.

use crate::http::{check_status, request_error};
use crate::sse::SseAssembler;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wxrelay_core::{
    config::ResponseMode,
    error::BackendError,
    message::{ConverseRequest, Reply},
    traits::Backend,
};

const NAME: &str = "chat_api";

/// Chat API backend (blocking or streaming response mode).
pub struct ChatApiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    response_mode: ResponseMode,
    timeout: Duration,
}

impl ChatApiBackend {
    /// Create from config values.
    pub fn from_config(
        base_url: String,
        api_key: String,
        response_mode: ResponseMode,
        timeout_secs: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            response_mode,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessagesRequest<'a> {
    pub inputs: ChatInputs<'a>,
    pub query: &'a str,
    pub user: &'a str,
    /// Empty string starts a new backend conversation.
    pub conversation_id: &'a str,
    pub response_mode: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatInputs<'a> {
    pub persona: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatMessagesResponse {
    pub answer: Option<String>,
    pub conversation_id: Option<String>,
}

#[async_trait]
impl Backend for ChatApiBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn converse(&self, request: &ConverseRequest) -> Result<Reply, BackendError> {
        let start = Instant::now();
        let body = ChatMessagesRequest {
            inputs: ChatInputs {
                persona: &request.persona,
            },
            query: &request.text,
            user: &request.user,
            conversation_id: request.history_ref.as_deref().unwrap_or(""),
            response_mode: self.response_mode.as_str(),
        };

        let url = format!("{}/chat-messages", self.base_url);
        debug!(
            "chat_api: POST {url} mode={} conversation={}",
            body.response_mode,
            if body.conversation_id.is_empty() { "new" } else { body.conversation_id }
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(NAME, e))?;
        let resp = check_status(NAME, resp).await?;

        let (answer, conversation_id) = match self.response_mode {
            ResponseMode::Blocking => {
                let parsed: ChatMessagesResponse =
                    resp.json().await.map_err(|e| request_error(NAME, e))?;
                let answer = parsed
                    .answer
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| {
                        BackendError::MalformedResponse("chat_api: response has no answer".into())
                    })?;
                (answer, parsed.conversation_id)
            }
            ResponseMode::Streaming => {
                let mut stream = resp.bytes_stream();
                let mut sse = SseAssembler::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| request_error(NAME, e))?;
                    sse.push(&chunk)?;
                }
                let done = sse.finish()?;
                (done.answer, done.conversation_id)
            }
        };

        let history_ref = conversation_id.filter(|id| !id.is_empty());
        if history_ref.is_none() {
            warn!("chat_api: response carried no conversation_id; history will not continue");
        }

        Ok(Reply {
            text: answer,
            history_ref,
            model: None,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("chat_api: no API key configured");
            return false;
        }
        let url = format!("{}/parameters", self.base_url);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("chat_api not available: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn request(history_ref: Option<&str>) -> ConverseRequest {
        ConverseRequest {
            conversation_key: "wx849:wxid_alice".into(),
            user: "wx849:wxid_alice".into(),
            text: "weather?".into(),
            persona: "default".into(),
            history_ref: history_ref.map(String::from),
        }
    }

    fn backend(server: &mockito::ServerGuard, mode: ResponseMode) -> ChatApiBackend {
        ChatApiBackend::from_config(format!("{}/v1/", server.url()), "app-key".into(), mode, 5)
    }

    #[test]
    fn test_request_serialization() {
        let body = ChatMessagesRequest {
            inputs: ChatInputs { persona: "tutor" },
            query: "hi",
            user: "u1",
            conversation_id: "",
            response_mode: "blocking",
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["inputs"]["persona"], "tutor");
        assert_eq!(v["conversation_id"], "");
        assert_eq!(v["response_mode"], "blocking");
    }

    #[tokio::test]
    async fn test_blocking_answer_and_history_ref() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat-messages")
            .match_header("authorization", "Bearer app-key")
            .match_body(Matcher::PartialJson(json!({
                "query": "weather?",
                "user": "wx849:wxid_alice",
                "conversation_id": "conv-1",
                "response_mode": "blocking",
                "inputs": {"persona": "default"}
            })))
            .with_status(200)
            .with_body(json!({"answer": "Sunny", "conversation_id": "conv-1"}).to_string())
            .create_async()
            .await;

        let reply = backend(&server, ResponseMode::Blocking)
            .converse(&request(Some("conv-1")))
            .await
            .unwrap();
        assert_eq!(reply.text, "Sunny");
        assert_eq!(reply.history_ref.as_deref(), Some("conv-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_blocking_missing_answer_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat-messages")
            .with_status(200)
            .with_body(json!({"conversation_id": "c"}).to_string())
            .create_async()
            .await;

        let err = backend(&server, ResponseMode::Blocking)
            .converse(&request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_blocking_non_json_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat-messages")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let err = backend(&server, ResponseMode::Blocking)
            .converse(&request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_streaming_answer() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"event\":\"message\",\"answer\":\"It is \",\"conversation_id\":\"conv-9\"}\n\n",
            "event: ping\n\n",
            "data: {\"event\":\"message\",\"answer\":\"sunny\",\"conversation_id\":\"conv-9\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"conv-9\"}\n\n",
        );
        server
            .mock("POST", "/v1/chat-messages")
            .match_body(Matcher::PartialJson(json!({"response_mode": "streaming"})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let reply = backend(&server, ResponseMode::Streaming)
            .converse(&request(None))
            .await
            .unwrap();
        assert_eq!(reply.text, "It is sunny");
        assert_eq!(reply.history_ref.as_deref(), Some("conv-9"));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let cases: [(usize, fn(&BackendError) -> bool); 4] = [
            (401, |e| matches!(e, BackendError::AuthFailure(_))),
            (429, |e| {
                *e == BackendError::RateLimited {
                    retry_after_secs: Some(20),
                }
            }),
            (504, |e| *e == BackendError::Timeout),
            (503, |e| matches!(e, BackendError::Unavailable(_))),
        ];
        for (status, check) in cases {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/v1/chat-messages")
                .with_status(status)
                .with_header("retry-after", "20")
                .with_body("{}")
                .create_async()
                .await;
            let err = backend(&server, ResponseMode::Blocking)
                .converse(&request(None))
                .await
                .unwrap_err();
            assert!(check(&err), "status {status} mapped to {err:?}");
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let backend = ChatApiBackend::from_config(
            "http://127.0.0.1:9/v1".into(),
            "k".into(),
            ResponseMode::Blocking,
            2,
        );
        let err = backend.converse(&request(None)).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_is_available_requires_key() {
        let backend = ChatApiBackend::from_config(
            "http://127.0.0.1:9/v1".into(),
            String::new(),
            ResponseMode::Blocking,
            2,
        );
        assert!(!backend.is_available().await);
        assert_eq!(backend.name(), "chat_api");
    }
}
