use crate::value_objects::{ConversationId, MessageContent, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: MessageContent,
    /// 服务端分配，同一会话内不递减
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: Timestamp,
    #[serde(with = "time::serde::rfc3339::option")]
    pub edited_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: MessageContent,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            text,
            sent_at,
            edited_at: None,
        }
    }

    pub fn edit(&mut self, text: MessageContent, at: Timestamp) {
        self.text = text;
        self.edited_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

impl ReadReceipt {
    pub fn new(message_id: MessageId, user_id: UserId, read_at: Timestamp) -> Self {
        Self {
            message_id,
            user_id,
            read_at,
        }
    }
}
