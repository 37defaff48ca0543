//! 私信聊天系统核心领域模型
//!
//! 包含用户、好友关系、会话、消息与已读回执等核心实体，以及相关的业务规则。

pub mod conversation;
pub mod errors;
pub mod friendship;
pub mod message;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::{Conversation, ConversationType, Membership};
pub use errors::{DomainError, RepositoryError};
pub use friendship::{
    FriendData, FriendEdge, FriendStatus, FriendSummary, FriendView, FriendshipPromotion,
    DEFAULT_ONLINE_WINDOW_MINUTES,
};
pub use message::{Message, ReadReceipt};
pub use user::User;
pub use value_objects::{
    ConversationId, MessageContent, MessageId, PasswordHash, PhoneNumber, PublicKey, Timestamp,
    UserId, Username,
};
