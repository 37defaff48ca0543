use std::fmt;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "direct",
            ConversationType::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "direct" => Ok(ConversationType::Direct),
            "group" => Ok(ConversationType::Group),
            other => Err(DomainError::invalid_argument(
                "conversation_type",
                format!("unknown type `{other}`"),
            )),
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub title: Option<String>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        kind: ConversationType,
        title: Option<String>,
        created_by: UserId,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let title = match title.map(|t| t.trim().to_owned()) {
            Some(t) if t.is_empty() => None,
            Some(t) if t.chars().count() > 100 => {
                return Err(DomainError::invalid_argument("title", "too long"));
            }
            other => other,
        };
        Ok(Self {
            id,
            kind,
            title,
            created_by,
            created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: Timestamp,
}

impl Membership {
    pub fn new(conversation_id: ConversationId, user_id: UserId, joined_at: Timestamp) -> Self {
        Self {
            conversation_id,
            user_id,
            joined_at,
        }
    }
}
