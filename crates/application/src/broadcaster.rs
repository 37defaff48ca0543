use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::events::ServerEvent;

/// 单条实时连接的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接因出站队列写满被注册表驱逐时触发，连接任务据此主动断开
#[derive(Debug, Clone, Default)]
pub struct Eviction(Arc<Notify>);

impl Eviction {
    pub async fn notified(&self) {
        self.0.notified().await
    }

    // 没有等待者时保留一次通知，之后的 notified 立即返回
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// 连接注册表与事件扇出
///
/// 每条连接注册一个出站队列；识别身份后绑定到用户。
/// 扇出从不等待某条连接的队列：写满的连接被驱逐，其余连接照常送达。
#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    async fn register(
        &self,
        connection: ConnectionId,
        sender: mpsc::Sender<ServerEvent>,
    ) -> Eviction;

    async fn bind_user(&self, connection: ConnectionId, user: UserId)
        -> Result<(), BroadcastError>;

    async fn unregister(&self, connection: ConnectionId);

    /// 发给这些用户的全部连接，每条连接恰好一次；返回送达的连接数
    async fn send_to_users(
        &self,
        users: &[UserId],
        exclude_user: Option<UserId>,
        event: ServerEvent,
    ) -> Result<usize, BroadcastError>;

    /// 发给所有连接（包括尚未识别身份的），可排除某个用户的连接
    async fn send_to_all(
        &self,
        exclude_user: Option<UserId>,
        event: ServerEvent,
    ) -> Result<usize, BroadcastError>;
}
