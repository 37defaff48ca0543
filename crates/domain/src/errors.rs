//! 领域模型错误定义
//!
//! 业务规则错误与存储错误分开定义，应用层再统一包装。

use std::error::Error as StdError;

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 用户名或手机号已被占用
    #[error("user already exists: {field} is taken")]
    DuplicateUser { field: String },

    /// 同一方向的好友边已存在
    #[error("friend request already exists")]
    DuplicateEdge,

    /// 用户已在会话中
    #[error("user is already a member of this conversation")]
    DuplicateMembership,

    #[error("cannot send a friend request to yourself")]
    SelfFriendRequest,

    #[error("user not found")]
    UserNotFound,

    #[error("friend request not found")]
    FriendRequestNotFound,

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("user is not a member of this conversation")]
    NotConversationMember,
}

impl DomainError {
    /// 创建参数校验错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建重复用户错误
    pub fn duplicate_user(field: impl Into<String>) -> Self {
        Self::DuplicateUser {
            field: field.into(),
        }
    }
}

/// 仓储层错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    /// 唯一约束冲突
    #[error("record already exists")]
    Conflict,

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<DomainError> for RepositoryError {
    // 从数据库读出的数据未通过领域校验
    fn from(value: DomainError) -> Self {
        RepositoryError::storage_with_source("invalid persisted data", value)
    }
}
