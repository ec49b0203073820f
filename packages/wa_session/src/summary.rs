//! Reading inbound protocol messages into a flat summary.

use serde::Serialize;
use serde_json::Value;

use crate::client::InboundMessage;
use crate::phone::{is_group, peer_to_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sender {
    pub number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotedMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaFlags {
    pub image: bool,
    pub video: bool,
    pub audio: bool,
    pub document: bool,
    pub sticker: bool,
    pub location: bool,
    pub contact: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub chat_type: ChatType,
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub from: Sender,
    pub group_id: Option<String>,
    pub msg_type: String,
    pub text: String,
    pub mentions: Vec<String>,
    pub quoted: Option<QuotedMessage>,
    pub media: MediaFlags,
}

pub fn summarize(msg: &InboundMessage) -> MessageSummary {
    let remote = msg.key.remote_jid.as_deref().unwrap_or("");
    let group = is_group(remote);
    let content = msg.message.as_ref().unwrap_or(&Value::Null);

    let number = if group {
        peer_to_number(msg.key.participant.as_deref().unwrap_or(""))
    } else {
        peer_to_number(remote)
    };

    MessageSummary {
        chat_type: if group { ChatType::Group } else { ChatType::Private },
        id: msg.key.id.clone(),
        timestamp: msg.message_timestamp.and_then(timestamp_to_iso),
        from: Sender {
            number: number.to_string(),
            name: msg.push_name.clone().filter(|n| !n.is_empty()),
        },
        group_id: group.then(|| peer_to_number(remote).to_string()),
        msg_type: message_type(content),
        text: message_text(content).trim().to_string(),
        mentions: mentions(content),
        quoted: quoted(content),
        media: media_flags(content),
    }
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().filter(|s| !s.is_empty())
}

fn unwrap_ephemeral(content: &Value) -> &Value {
    match content.get("ephemeralMessage").and_then(|e| e.get("message")) {
        Some(inner) if inner.is_object() => inner,
        _ => content,
    }
}

/// Text of a message across the content shapes that carry one.
pub fn message_text(content: &Value) -> String {
    const PATHS: &[&[&str]] = &[
        &["conversation"],
        &["extendedTextMessage", "text"],
        &["imageMessage", "caption"],
        &["videoMessage", "caption"],
        &["buttonsResponseMessage", "selectedButtonId"],
        &["listResponseMessage", "singleSelectReply", "selectedRowId"],
        &["documentWithCaptionMessage", "message", "documentMessage", "caption"],
    ];
    if let Some(text) = PATHS.iter().take(2).find_map(|p| str_at(content, p)) {
        return text.to_string();
    }
    if let Some(inner) = content.get("ephemeralMessage").and_then(|e| e.get("message")) {
        return message_text(inner);
    }
    PATHS
        .iter()
        .skip(2)
        .find_map(|p| str_at(content, p))
        .unwrap_or("")
        .to_string()
}

fn message_type(content: &Value) -> String {
    unwrap_ephemeral(content)
        .as_object()
        .and_then(|m| m.keys().next().cloned())
        .unwrap_or_else(|| "unknown".to_string())
}

const CONTEXT_PATHS: &[&[&str]] = &[
    &["extendedTextMessage", "contextInfo"],
    &["imageMessage", "contextInfo"],
    &["videoMessage", "contextInfo"],
    &["ephemeralMessage", "message", "extendedTextMessage", "contextInfo"],
];

fn context_info(content: &Value) -> Option<&Value> {
    CONTEXT_PATHS.iter().find_map(|path| {
        let mut cur = content;
        for key in *path {
            cur = cur.get(key)?;
        }
        Some(cur)
    })
}

fn mentions(content: &Value) -> Vec<String> {
    context_info(content)
        .or_else(|| content.get("conversationContextInfo"))
        .and_then(|ci| ci.get("mentionedJid"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(|jid| peer_to_number(jid).to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn quoted(content: &Value) -> Option<QuotedMessage> {
    let qm = context_info(content)?.get("quotedMessage")?;
    let msg_type = qm.as_object()?.keys().next()?.clone();
    let text = str_at(qm, &["conversation"])
        .or_else(|| str_at(qm, &["extendedTextMessage", "text"]))
        .or_else(|| str_at(qm, &["imageMessage", "caption"]))
        .or_else(|| str_at(qm, &["videoMessage", "caption"]))
        .map(str::to_string);
    Some(QuotedMessage { msg_type, text })
}

fn media_flags(content: &Value) -> MediaFlags {
    let src = unwrap_ephemeral(content);
    let has = |key: &str| src.get(key).is_some_and(|v| !v.is_null());
    MediaFlags {
        image: has("imageMessage"),
        video: has("videoMessage"),
        audio: has("audioMessage"),
        document: has("documentMessage"),
        sticker: has("stickerMessage"),
        location: has("locationMessage") || has("liveLocationMessage"),
        contact: has("contactMessage") || has("contactsArrayMessage"),
    }
}

/// Protocol timestamps come in seconds or milliseconds.
fn timestamp_to_iso(ts: i64) -> Option<String> {
    if ts <= 0 {
        return None;
    }
    let millis = if ts < 10_000_000_000 { ts * 1000 } else { ts };
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}
