//! wx849 API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wxrelay_core::error::TransportError;

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope {
    #[serde(rename = "Success", default)]
    pub success: bool,
    #[serde(rename = "Code", default)]
    pub code: i64,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl ApiEnvelope {
    /// Turn a `Success=false` envelope into a rejection.
    pub fn into_data(self) -> Result<Value, TransportError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(TransportError::Rejected(format!(
                "code {}: {}",
                self.code, self.message
            )))
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SyncRequest<'a> {
    #[serde(rename = "Wxid")]
    pub wxid: &'a str,
    #[serde(rename = "Scene")]
    pub scene: i32,
    #[serde(rename = "Synckey")]
    pub synckey: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct SendTextRequest<'a> {
    #[serde(rename = "Wxid")]
    pub wxid: &'a str,
    #[serde(rename = "ToWxid")]
    pub to_wxid: &'a str,
    #[serde(rename = "Content")]
    pub content: &'a str,
    /// 1 = plain text.
    #[serde(rename = "Type")]
    pub msg_type: i32,
    /// Comma-separated ids to `@` in groups.
    #[serde(rename = "At")]
    pub at: &'a str,
}

/// Raw events carried by a `Msg/Sync` response.
///
/// Depending on the service build, `Data` is either `{ "AddMsgs": [...] }`
/// or the event array itself.
pub(crate) fn sync_events(data: Value) -> Vec<Value> {
    match data {
        Value::Array(events) => events,
        Value::Object(mut map) => ["AddMsgs", "addMsgs", "List"]
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(events)) => Some(events),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Message id assigned by `Msg/SendTxt`, when reported.
pub(crate) fn sent_message_id(data: &Value) -> Option<String> {
    let entry = data
        .get("List")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .unwrap_or(data);
    ["NewMsgId", "MsgId", "msgId"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Map a reqwest failure onto the transport taxonomy.
pub(crate) fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        status_error(status, &err.to_string())
    } else if err.is_decode() {
        TransportError::Unreachable(format!("undecodable response: {err}"))
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

/// 4xx is our fault and will not improve on retry; anything else might.
pub(crate) fn status_error(status: reqwest::StatusCode, detail: &str) -> TransportError {
    if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        TransportError::Timeout
    } else if status.is_client_error() {
        TransportError::Rejected(format!("HTTP {status}: {detail}"))
    } else {
        TransportError::Unreachable(format!("HTTP {status}: {detail}"))
    }
}
