use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

use super::{Message, MessageContext};

/// Wire unit exchanged over the broker.
///
/// ```json
/// {"id": "...", "replyTo": "_INBOX.…", "payload": {"type": "Ping", "context": {...}, "body": {...}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    message_type: String,
    context: MessageContext,
    body: serde_json::Value,
}

/// Routing fields of an envelope, read without decoding the body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub id: Uuid,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Wrap `message` under a fresh envelope id
    pub fn new<M: Message>(
        message: &M,
        context: MessageContext,
        reply_to: Option<String>,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            id: Uuid::new_v4(),
            reply_to,
            payload: Payload {
                message_type: M::message_type().to_string(),
                context,
                body: serde_json::to_value(message)?,
            },
        })
    }

    /// Read only the id and reply subject of a raw envelope
    pub fn peek(data: &[u8]) -> Result<EnvelopeHeader, QueueError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, QueueError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn message_type(&self) -> &str {
        &self.payload.message_type
    }

    pub fn context(&self) -> &MessageContext {
        &self.payload.context
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.payload.body
    }

    /// Decode the body as `M`, rejecting envelopes tagged with another type
    pub fn decode_body<M: Message>(&self) -> Result<M, QueueError> {
        if self.payload.message_type != M::message_type() {
            return Err(QueueError::TypeMismatch {
                expected: M::message_type().to_string(),
                actual: self.payload.message_type.clone(),
            });
        }
        Ok(M::deserialize(&self.payload.body)?)
    }
}
