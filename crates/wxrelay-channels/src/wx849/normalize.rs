//! Raw wx849 event → canonical `Message`.
//!
//! Pure and total: anything that cannot be understood becomes
//! `Content::Unknown` instead of an error.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use wxrelay_core::message::{Content, ConversationId, FileRef, ImageRef, Message, VoiceRef};

const CHATROOM_SUFFIX: &str = "@chatroom";

const TYPE_TEXT: i64 = 1;
const TYPE_IMAGE: i64 = 3;
const TYPE_VOICE: i64 = 34;
const TYPE_VIDEO: i64 = 43;
const TYPE_STICKER: i64 = 47;
const TYPE_APP: i64 = 49;
const TYPE_SYSTEM: i64 = 10000;
const TYPE_SYSTEM_NOTICE: i64 = 10002;

const APP_LINK: i64 = 5;
const APP_FILE: i64 = 6;
const APP_QUOTE: i64 = 57;

/// Build a `Message` from one raw event. `now` stands in for a missing
/// create time.
pub fn normalize(raw: &Value, now: DateTime<Utc>) -> Message {
    let from = string_field(raw, &["fromUserName", "FromUserName"]);
    let to = string_field(raw, &["toUserName", "ToUserName"]);
    let room = string_field(raw, &["roomId", "RoomId"]);
    let body = string_field(raw, &["content", "Content"]);
    let msg_type = int_field(raw, &["type", "Type", "MsgType", "msgType"]).unwrap_or(0);

    let created = int_field(raw, &["timestamp", "CreateTime", "createTime"]);
    let timestamp = created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(now);

    let is_group =
        !room.is_empty() || from.ends_with(CHATROOM_SUFFIX) || to.ends_with(CHATROOM_SUFFIX);

    let (conversation, body) = if is_group {
        let room_id = if !room.is_empty() {
            room
        } else if from.ends_with(CHATROOM_SUFFIX) {
            from.clone()
        } else {
            to.clone()
        };
        match split_group_sender(&body) {
            Some((sender, rest)) => (ConversationId::group(&room_id, sender), rest.to_string()),
            None => {
                let sender = if from.ends_with(CHATROOM_SUFFIX) {
                    string_field(raw, &["senderWxid", "SenderWxid", "actualUserName"])
                } else {
                    from.clone()
                };
                (ConversationId::group(&room_id, &sender), body)
            }
        }
    } else {
        (ConversationId::private(&from), body)
    };

    let id = message_id(raw, created.unwrap_or_else(|| now.timestamp()));
    let mentions = parse_mentions(&string_field(raw, &["msgSource", "MsgSource"]));

    Message {
        id,
        conversation,
        content: classify(msg_type, &body),
        timestamp,
        mentions,
        raw: Arc::new(raw.clone()),
    }
}

/// Map a raw type and its body to content.
fn classify(msg_type: i64, body: &str) -> Content {
    match msg_type {
        TYPE_TEXT => Content::text(body),
        TYPE_IMAGE => Content::Image(parse_image(body)),
        TYPE_VOICE => Content::Voice(parse_voice(body)),
        TYPE_VIDEO => Content::File(parse_video(body)),
        TYPE_STICKER => Content::Unknown { raw_type: msg_type },
        TYPE_APP => parse_app(body).unwrap_or(Content::Unknown { raw_type: msg_type }),
        TYPE_SYSTEM | TYPE_SYSTEM_NOTICE => Content::System(body.to_string()),
        _ if !body.trim().is_empty() && !body.trim_start().starts_with("<sysmsg") => {
            Content::text(body)
        }
        _ => Content::Unknown { raw_type: msg_type },
    }
}

/// Group content arrives as `"<wxid>:\n<content>"`.
fn split_group_sender(body: &str) -> Option<(&str, &str)> {
    if let Some((sender, rest)) = body.split_once(":\n") {
        if is_account_id(sender) {
            return Some((sender, rest));
        }
    }
    let (sender, rest) = body.split_once(':')?;
    (sender.starts_with("wxid_") && is_account_id(sender)).then_some((sender, rest))
}

fn is_account_id(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

fn message_id(raw: &Value, created: i64) -> String {
    let id = string_field(raw, &["msgid", "MsgId", "NewMsgId", "newMsgId", "id"]);
    if !id.is_empty() {
        return id;
    }
    let mut hasher = DefaultHasher::new();
    raw.to_string().hash(&mut hasher);
    format!("msg_{created}_{:016x}", hasher.finish())
}

/// First non-empty string under any of `keys`, unwrapping `{"string": …}`.
fn string_field(raw: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Object(o) => o
                .get("string")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        })
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn int_field(raw: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|k| raw.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(o) => o.get("string")?.as_str()?.trim().parse().ok(),
        _ => None,
    })
}

// --- XML payloads -------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct MsgXml {
    img: Option<ImgXml>,
    voicemsg: Option<VoiceXml>,
    videomsg: Option<VideoXml>,
    appmsg: Option<AppMsgXml>,
}

#[derive(Debug, Default, Deserialize)]
struct ImgXml {
    #[serde(rename = "@aeskey")]
    aeskey: Option<String>,
    #[serde(rename = "@cdnmidimgurl")]
    cdnmidimgurl: Option<String>,
    #[serde(rename = "@length")]
    length: Option<String>,
    #[serde(rename = "@md5")]
    md5: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VoiceXml {
    #[serde(rename = "@voicelength")]
    voicelength: Option<String>,
    #[serde(rename = "@length")]
    length: Option<String>,
    #[serde(rename = "@voiceurl")]
    voiceurl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoXml {
    #[serde(rename = "@length")]
    length: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppMsgXml {
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
    appattach: Option<AppAttachXml>,
    refermsg: Option<ReferMsgXml>,
}

#[derive(Debug, Default, Deserialize)]
struct AppAttachXml {
    totallen: Option<String>,
    fileext: Option<String>,
    attachid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReferMsgXml {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MsgSourceXml {
    atuserlist: Option<String>,
}

fn parse_xml(body: &str) -> Option<MsgXml> {
    quick_xml::de::from_str(body.trim()).ok()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn number(s: Option<String>) -> Option<u64> {
    s.and_then(|s| s.trim().parse().ok())
}

fn parse_image(body: &str) -> ImageRef {
    let Some(img) = parse_xml(body).and_then(|m| m.img) else {
        return ImageRef::default();
    };
    ImageRef {
        aes_key: non_empty(img.aeskey),
        cdn_url: non_empty(img.cdnmidimgurl),
        length: number(img.length),
        md5: non_empty(img.md5),
    }
}

fn parse_voice(body: &str) -> VoiceRef {
    let Some(voice) = parse_xml(body).and_then(|m| m.voicemsg) else {
        return VoiceRef::default();
    };
    VoiceRef {
        url: non_empty(voice.voiceurl),
        duration_ms: number(voice.voicelength).or_else(|| number(voice.length)),
    }
}

fn parse_video(body: &str) -> FileRef {
    let size = parse_xml(body)
        .and_then(|m| m.videomsg)
        .and_then(|v| number(v.length));
    FileRef {
        name: "video.mp4".to_string(),
        extension: Some("mp4".to_string()),
        size,
        attach_id: None,
    }
}

fn parse_app(body: &str) -> Option<Content> {
    let app = parse_xml(body)?.appmsg?;
    let kind: i64 = app.kind.as_deref()?.trim().parse().ok()?;
    let title = non_empty(app.title).unwrap_or_default();
    match kind {
        APP_LINK => {
            let text = match non_empty(app.url) {
                Some(url) if title.is_empty() => url,
                Some(url) => format!("{title}\n{url}"),
                None => title,
            };
            Some(Content::text(text))
        }
        APP_FILE => {
            let attach = app.appattach.unwrap_or_default();
            Some(Content::File(FileRef {
                name: title,
                extension: non_empty(attach.fileext),
                size: number(attach.totallen),
                attach_id: non_empty(attach.attachid),
            }))
        }
        APP_QUOTE => Some(Content::Text {
            text: title,
            quote: app.refermsg.and_then(|r| non_empty(r.content)),
        }),
        _ => None,
    }
}

/// Account ids listed in `<atuserlist>`.
fn parse_mentions(msg_source: &str) -> Vec<String> {
    if msg_source.is_empty() {
        return Vec::new();
    }
    quick_xml::de::from_str::<MsgSourceXml>(msg_source.trim())
        .ok()
        .and_then(|s| s.atuserlist)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
