use std::sync::Arc;

use application::{MemoryPresenceManager, PresenceManager, RedisPresenceManager};
use config::AppConfig;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    password::BcryptPasswordHasher,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 进程启动时装配的外部适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub password_hasher: Arc<BcryptPasswordHasher>,
    pub presence_manager: Arc<dyn PresenceManager>,
}

impl Infrastructure {
    /// 连接数据库并执行迁移；配置了 Redis 时在线连接集合写入 Redis
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("数据库迁移完成");

        let presence_manager: Arc<dyn PresenceManager> = match &config.presence.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                tracing::info!("在线状态使用 Redis 存储");
                Arc::new(RedisPresenceManager::new(
                    Arc::new(client),
                    config.presence.connection_ttl_seconds,
                ))
            }
            None => {
                tracing::info!("在线状态使用进程内存储");
                Arc::new(MemoryPresenceManager::new())
            }
        };

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
            password_hasher: Arc::new(BcryptPasswordHasher::new(config.server.bcrypt_cost)),
            presence_manager,
        })
    }
}
