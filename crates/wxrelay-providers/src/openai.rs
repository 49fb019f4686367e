//! OpenAI-compatible API backend.
//!
//! Works with OpenAI's API and any compatible endpoint. The persona picks
//! the system prompt; the backend keeps no history, so every turn is
//! answered on its own and `history_ref` is always `None`.

use crate::http::{check_status, request_error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wxrelay_core::{
    error::BackendError,
    message::{ConverseRequest, Reply},
    traits::Backend,
};

const NAME: &str = "openai";

/// OpenAI-compatible backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    /// Persona name → system prompt.
    personas: BTreeMap<String, String>,
    timeout: Duration,
}

impl OpenAiBackend {
    /// Create from config values.
    pub fn from_config(
        base_url: String,
        api_key: String,
        model: String,
        personas: BTreeMap<String, String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            personas,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// System message (if the persona has a prompt) followed by the user turn.
pub(crate) fn build_messages(system: Option<&str>, text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: text.to_string(),
    });
    messages
}

#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    /// End-user id, forwarded for abuse monitoring.
    pub user: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Option<Vec<ChatChoice>>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<ChatMessage>,
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn converse(&self, request: &ConverseRequest) -> Result<Reply, BackendError> {
        let start = Instant::now();
        let system = self.personas.get(&request.persona).map(String::as_str);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: build_messages(system, &request.text),
            user: &request.user,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!("openai: POST {url} model={} persona={}", self.model, request.persona);

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

        let parsed: ChatCompletionResponse =
            resp.json().await.map_err(|e| request_error(NAME, e))?;

        let text = parsed
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BackendError::MalformedResponse("openai: response has no choices".into()))?;

        Ok(Reply {
            text,
            history_ref: None,
            model: parsed.model,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("openai: no API key configured");
            return false;
        }
        // Basic check: try to list models.
        let url = format!("{}/models", self.base_url);
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
                warn!("openai not available: {e}");
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

    fn backend(url: String) -> OpenAiBackend {
        let mut personas = BTreeMap::new();
        personas.insert("tutor".to_string(), "You are a patient tutor.".to_string());
        OpenAiBackend::from_config(url, "sk-test".into(), "gpt-4o-mini".into(), personas, 5)
    }

    fn request(persona: &str) -> ConverseRequest {
        ConverseRequest {
            conversation_key: "wx849:wxid_alice".into(),
            user: "wx849:wxid_alice".into(),
            text: "What is 2+2?".into(),
            persona: persona.into(),
            history_ref: Some("ignored".into()),
        }
    }

    #[test]
    fn test_build_messages() {
        let messages = build_messages(Some("Be helpful."), "Hi");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "Hi");

        let messages = build_messages(None, "Hi");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}],"model":"gpt-4o","usage":{"total_tokens":42}}"#;
        let resp: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.model.as_deref(), Some("gpt-4o"));
        assert_eq!(
            resp.choices.unwrap()[0].message.as_ref().unwrap().content,
            "Hello!"
        );
    }

    #[tokio::test]
    async fn test_converse_uses_persona_prompt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "You are a patient tutor."},
                    {"role": "user", "content": "What is 2+2?"}
                ]
            })))
            .with_status(200)
            .with_body(
                json!({"choices": [{"message": {"role": "assistant", "content": "4"}}], "model": "gpt-4o-mini"})
                    .to_string(),
            )
            .create_async()
            .await;

        let reply = backend(format!("{}/v1", server.url()))
            .converse(&request("tutor"))
            .await
            .unwrap();
        assert_eq!(reply.text, "4");
        assert_eq!(reply.history_ref, None);
        assert_eq!(reply.model.as_deref(), Some("gpt-4o-mini"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_choices_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(json!({"choices": []}).to_string())
            .create_async()
            .await;

        let err = backend(format!("{}/v1", server.url()))
            .converse(&request("unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_forbidden_is_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(403)
            .with_body("{\"error\":\"bad key\"}")
            .create_async()
            .await;

        let err = backend(format!("{}/v1", server.url()))
            .converse(&request("tutor"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_is_available_lists_models() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body("{\"data\":[]}")
            .create_async()
            .await;
        assert!(backend(format!("{}/v1", server.url())).is_available().await);
    }
}
