use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Causation metadata travelling with every envelope.
///
/// A fresh context is its own root. Messages caused by another message
/// carry a `child()` of the causing message's context, so the whole chain
/// shares `root_message_id`, `root_message_date` and `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_message_date: Option<DateTime<Utc>>,
    request_id: Uuid,
}

impl MessageContext {
    pub fn new() -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            parent_message_id: None,
            root_message_id: Some(message_id),
            root_message_date: Some(Utc::now()),
            request_id: Uuid::new_v4(),
        }
    }

    /// Context for a message caused by the message owning `self`
    pub fn child(&self) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            parent_message_id: Some(self.message_id),
            root_message_id: self.root_message_id.or(Some(self.message_id)),
            root_message_date: self.root_message_date,
            request_id: self.request_id,
        }
    }

    /// Same context under a caller supplied request id
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn parent_message_id(&self) -> Option<Uuid> {
        self.parent_message_id
    }

    pub fn root_message_id(&self) -> Option<Uuid> {
        self.root_message_id
    }

    pub fn root_message_date(&self) -> Option<DateTime<Utc>> {
        self.root_message_date
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}
