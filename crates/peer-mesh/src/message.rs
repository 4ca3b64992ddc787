//! Application payloads carried over a session's message channel. Only the
//! `type` discriminator and the fields routing needs are typed; everything
//! else rides along in `extra`.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::chunk::TransferMetadata;
use crate::session::PeerId;

const TYPE_FIELD: &str = "type";
pub const CALL_CONTROL_PREFIX: &str = "video-call-";
pub const GROUP_PREFIX: &str = "group-";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Chat kinds delivered to the chat collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    Image,
    Audio,
    Sticker,
    System,
}

impl ChatKind {
    fn from_type(value: &str) -> Option<Self> {
        match value {
            "text" => Some(ChatKind::Text),
            "image" => Some(ChatKind::Image),
            "audio" => Some(ChatKind::Audio),
            "sticker" => Some(ChatKind::Sticker),
            "system" => Some(ChatKind::System),
            _ => None,
        }
    }

    fn as_type(self) -> &'static str {
        match self {
            ChatKind::Text => "text",
            ChatKind::Image => "image",
            ChatKind::Audio => "audio",
            ChatKind::Sticker => "sticker",
            ChatKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(skip)]
    pub kind: Option<ChatKind>,
    #[serde(default, rename = "sender", alias = "senderId")]
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn text(sender: &PeerId, content: impl Into<String>) -> Self {
        Self {
            id: format!("text_{}", Uuid::new_v4().simple()),
            kind: Some(ChatKind::Text),
            sender_id: sender.to_string(),
            content: content.into(),
            timestamp: now_millis(),
            group_id: None,
            extra: Map::new(),
        }
    }

    pub fn chat_kind(&self) -> ChatKind {
        self.kind.unwrap_or(ChatKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub id: String,
    #[serde(default, rename = "sender", alias = "senderId")]
    pub sender_id: String,
    pub file_hash: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Base64 file content.
    pub data: String,
}

impl FileTransfer {
    pub fn from_bytes(
        sender: &PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        let hash = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("file_{hash}"),
            sender_id: sender.to_string(),
            file_hash: hash,
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retraction {
    pub original_message_id: String,
    #[serde(default, rename = "sender", alias = "senderId")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

/// Opaque call-control payload; `action` is the part of the type after
/// `video-call-` (request, accepted, rejected, cancel, offer, answer, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct CallControl {
    pub action: String,
    pub body: Map<String, Value>,
}

/// Opaque group-management payload (`group-*` types).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupControl {
    pub kind: String,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// Direct chat, or group-addressed chat when `group_id` is set.
    Chat(ChatMessage),
    GroupControl(GroupControl),
    CallControl(CallControl),
    RetractRequest(Retraction),
    RetractConfirm(Retraction),
    File(FileTransfer),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Message(AppMessage),
    Unknown(Option<String>),
}

impl AppMessage {
    pub fn type_name(&self) -> String {
        match self {
            AppMessage::Chat(chat) => chat.chat_kind().as_type().to_string(),
            AppMessage::GroupControl(group) => group.kind.clone(),
            AppMessage::CallControl(call) => format!("{CALL_CONTROL_PREFIX}{}", call.action),
            AppMessage::RetractRequest(_) => "retract-message-request".to_string(),
            AppMessage::RetractConfirm(_) => "retract-message-confirm".to_string(),
            AppMessage::File(_) => "file".to_string(),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut object = match self {
            AppMessage::Chat(chat) => into_object(serde_json::to_value(chat)?),
            AppMessage::GroupControl(group) => group.body.clone(),
            AppMessage::CallControl(call) => call.body.clone(),
            AppMessage::RetractRequest(retraction) | AppMessage::RetractConfirm(retraction) => {
                into_object(serde_json::to_value(retraction)?)
            }
            AppMessage::File(file) => into_object(serde_json::to_value(file)?),
        };
        object.insert(TYPE_FIELD.to_string(), Value::String(self.type_name()));
        Ok(Value::Object(object))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value()?)
    }

    /// Descriptor placed on the first fragment of the encoded message.
    pub fn transfer_metadata(&self, encoded_len: usize) -> TransferMetadata {
        match self {
            AppMessage::File(file) => TransferMetadata {
                name: Some(file.name.clone()),
                content_type: Some(file.mime_type.clone()),
                total_size: file.size,
            },
            _ => TransferMetadata {
                name: None,
                content_type: Some(JSON_CONTENT_TYPE.to_string()),
                total_size: encoded_len as u64,
            },
        }
    }

    /// Routes a decoded JSON payload by its `type` discriminator. Missing
    /// sender fields are filled with the peer the payload arrived from.
    pub fn classify(value: Value, from: &PeerId) -> Result<Classified, serde_json::Error> {
        let Value::Object(mut object) = value else {
            return Ok(Classified::Unknown(None));
        };
        let type_name = object
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        let has_group = object
            .get("groupId")
            .is_some_and(|group| !group.is_null());

        let Some(type_name) = type_name else {
            return Ok(Classified::Unknown(None));
        };
        if let Some(action) = type_name.strip_prefix(CALL_CONTROL_PREFIX) {
            let action = action.to_string();
            object.remove(TYPE_FIELD);
            return Ok(Classified::Message(AppMessage::CallControl(CallControl {
                action,
                body: object,
            })));
        }
        if type_name.starts_with(GROUP_PREFIX) {
            object.remove(TYPE_FIELD);
            return Ok(Classified::Message(AppMessage::GroupControl(GroupControl {
                kind: type_name,
                body: object,
            })));
        }

        let sender_missing = !object
            .get("sender")
            .or_else(|| object.get("senderId"))
            .is_some_and(Value::is_string);
        if sender_missing {
            object.insert("sender".to_string(), Value::String(from.to_string()));
        }
        object.remove(TYPE_FIELD);
        let body = Value::Object(object);

        let message = match type_name.as_str() {
            "retract-message-request" => AppMessage::RetractRequest(serde_json::from_value(body)?),
            "retract-message-confirm" => AppMessage::RetractConfirm(serde_json::from_value(body)?),
            "file" => AppMessage::File(serde_json::from_value(body)?),
            other => match ChatKind::from_type(other) {
                Some(kind) => {
                    let mut chat: ChatMessage = serde_json::from_value(body)?;
                    chat.kind = Some(kind);
                    AppMessage::Chat(chat)
                }
                None if has_group => {
                    let Value::Object(body) = body else {
                        return Ok(Classified::Unknown(Some(type_name)));
                    };
                    AppMessage::GroupControl(GroupControl {
                        kind: type_name,
                        body,
                    })
                }
                None => return Ok(Classified::Unknown(Some(type_name))),
            },
        };
        Ok(Classified::Message(message))
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(object) => object,
        _ => Map::new(),
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
