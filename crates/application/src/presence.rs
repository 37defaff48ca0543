use std::sync::Arc;

use time::OffsetDateTime;

use crate::broadcaster::ConnectionId;
use crate::error::ApplicationError;
use domain::UserId;

/// 在线状态管理器trait
///
/// 每个用户维护一个连接集合，集合非空即在线。
#[async_trait::async_trait]
pub trait PresenceManager: Send + Sync {
    /// 记录一条连接，返回是否是该用户的第一条连接
    async fn user_connected(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError>;

    /// 移除一条连接，返回该用户是否因此不再有任何存活连接
    async fn user_disconnected(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError>;

    /// 续期一条仍然存活的连接
    async fn refresh(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), ApplicationError>;
}

/// Redis实现的在线状态管理器，多个实例共享连接集合
///
/// 每个用户一个有序集合 `presence:user:{id}:connections`，成员是连接ID，
/// 分值是该连接记录的过期时间（unix 秒）。进程崩溃遗留的连接过期后
/// 在下一次读写时被清理，不会永久占住用户的在线状态。
pub struct RedisPresenceManager {
    redis_client: Arc<redis::Client>,
    connection_ttl_seconds: u64,
}

impl RedisPresenceManager {
    pub fn new(redis_client: Arc<redis::Client>, connection_ttl_seconds: u64) -> Self {
        Self {
            redis_client,
            connection_ttl_seconds,
        }
    }

    fn connections_key(&self, user_id: UserId) -> String {
        format!("presence:user:{}:connections", user_id)
    }

    fn ttl(&self) -> i64 {
        i64::try_from(self.connection_ttl_seconds).unwrap_or(i64::MAX)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, ApplicationError> {
        self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                let message = format!("Redis connection failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })
    }
}

fn redis_error(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis operation failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[async_trait::async_trait]
impl PresenceManager for RedisPresenceManager {
    async fn user_connected(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let key = self.connections_key(user_id);
        let now = unix_now();
        let ttl = self.ttl();

        let (added, count): (usize, usize) = redis::pipe()
            .atomic()
            .zrembyscore(&key, "-inf", now)
            .ignore()
            .zadd(&key, connection_id.to_string(), now.saturating_add(ttl))
            .zcard(&key)
            .expire(&key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let first = added == 1 && count == 1;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, first, "用户连接上线");
        Ok(first)
    }

    async fn user_disconnected(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.get_connection().await?;
        let key = self.connections_key(user_id);

        // 本连接可能已过期被清理，是否下线只看剩余的存活连接
        let (remaining,): (usize,) = redis::pipe()
            .atomic()
            .zrem(&key, connection_id.to_string())
            .ignore()
            .zrembyscore(&key, "-inf", unix_now())
            .ignore()
            .zcard(&key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let last = remaining == 0;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, last, "用户连接断开");
        Ok(last)
    }

    async fn refresh(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), ApplicationError> {
        let mut conn = self.get_connection().await?;
        let key = self.connections_key(user_id);
        let ttl = self.ttl();

        // XX：只续期仍在集合里的连接，不复活已清理的记录
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg("XX")
            .arg(unix_now().saturating_add(ttl))
            .arg(connection_id.to_string())
            .ignore()
            .expire(&key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }
}

/// 内存实现的在线状态管理器（单实例部署和测试）
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryPresenceManager {
        connections: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
    }

    impl MemoryPresenceManager {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl PresenceManager for MemoryPresenceManager {
        async fn user_connected(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<bool, ApplicationError> {
            let mut connections = self.connections.write().await;
            let set = connections.entry(user_id).or_default();
            let added = set.insert(connection_id);
            Ok(added && set.len() == 1)
        }

        async fn user_disconnected(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<bool, ApplicationError> {
            let mut connections = self.connections.write().await;
            let Some(set) = connections.get_mut(&user_id) else {
                return Ok(false);
            };
            let removed = set.remove(&connection_id);
            if set.is_empty() {
                connections.remove(&user_id);
                return Ok(removed);
            }
            Ok(false)
        }

        async fn refresh(
            &self,
            _user_id: UserId,
            _connection_id: ConnectionId,
        ) -> Result<(), ApplicationError> {
            Ok(())
        }
    }

}
