//! 实时连接上的事件帧
//!
//! 每一帧都是 `{"event": <名称>, "data": {...}}` 形式的 JSON 文本。

use domain::{ConversationId, DomainError, Message, MessageId, RepositoryError, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

/// 客户端发往服务端的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    UserConnected(UserConnectedPayload),
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
    MessageRead(MessageReadPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserConnected(_) => "userConnected",
            ClientEvent::SendMessage(_) => "sendMessage",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::MessageRead(_) => "messageRead",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnectedPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
}

/// 服务端推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(NewMessagePayload),
    UserTyping(TypingPayload),
    MessageRead(MessageReadNotice),
    UserStatusChanged(UserStatusChangedPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadNotice {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChangedPayload {
    pub user_id: UserId,
    pub online_status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::UserTyping(_) => "userTyping",
            ServerEvent::MessageRead(_) => "messageRead",
            ServerEvent::UserStatusChanged(_) => "userStatusChanged",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
        })
    }

    /// 把用例错误转换成回给发起连接的错误事件，内部错误不暴露细节
    pub fn from_error(err: &ApplicationError) -> Self {
        let (code, message) = match err {
            ApplicationError::Authentication | ApplicationError::Authorization => {
                ("UNAUTHORIZED", err.to_string())
            }
            ApplicationError::Domain(domain) => (domain_error_code(domain), domain.to_string()),
            ApplicationError::Repository(RepositoryError::NotFound) => {
                ("NOT_FOUND", "resource not found".to_string())
            }
            ApplicationError::Repository(RepositoryError::Conflict) => {
                ("CONFLICT", "resource already exists".to_string())
            }
            _ => ("INTERNAL", "internal server error".to_string()),
        };
        ServerEvent::error(code, message)
    }
}

fn domain_error_code(err: &DomainError) -> &'static str {
    match err {
        DomainError::InvalidArgument { .. } | DomainError::SelfFriendRequest => "INVALID_ARGUMENT",
        DomainError::DuplicateUser { .. }
        | DomainError::DuplicateEdge
        | DomainError::DuplicateMembership => "CONFLICT",
        DomainError::UserNotFound
        | DomainError::FriendRequestNotFound
        | DomainError::ConversationNotFound
        | DomainError::MessageNotFound => "NOT_FOUND",
        DomainError::NotConversationMember => "FORBIDDEN",
    }
}
