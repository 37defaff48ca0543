//! 主应用程序入口
//!
//! 加载配置、连接数据库并启动 Axum Web API 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    Clock, ConversationService, ConversationServiceDependencies, FriendshipService,
    FriendshipServiceDependencies, Gateway, GatewayDependencies, IdGenerator,
    LocalEventBroadcaster, MessageService, MessageServiceDependencies, SystemClock, UserService,
    UserServiceDependencies, UuidGenerator,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load("config.yaml").context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    let infra = Infrastructure::connect(&config)
        .await
        .context("初始化基础设施失败")?;
    let storage = infra.storage.clone();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let id_generator: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

    let user_service = Arc::new(UserService::new(UserServiceDependencies {
        user_repository: storage.user_repository.clone(),
        password_hasher: infra.password_hasher.clone(),
        clock: clock.clone(),
        id_generator: id_generator.clone(),
    }));

    let friendship_service = Arc::new(FriendshipService::new(FriendshipServiceDependencies {
        user_repository: storage.user_repository.clone(),
        friend_repository: storage.friend_repository.clone(),
        clock: clock.clone(),
        online_window_minutes: config.presence.online_window_minutes,
    }));

    let conversation_service =
        Arc::new(ConversationService::new(ConversationServiceDependencies {
            user_repository: storage.user_repository.clone(),
            conversation_repository: storage.conversation_repository.clone(),
            message_repository: storage.message_repository.clone(),
            clock: clock.clone(),
            id_generator: id_generator.clone(),
        }));

    let message_service = Arc::new(MessageService::new(MessageServiceDependencies {
        conversation_repository: storage.conversation_repository.clone(),
        message_repository: storage.message_repository.clone(),
        clock,
        id_generator,
    }));

    let gateway = Arc::new(Gateway::new(GatewayDependencies {
        user_service: user_service.clone(),
        conversation_service: conversation_service.clone(),
        message_service: message_service.clone(),
        presence_manager: infra.presence_manager.clone(),
        broadcaster: Arc::new(LocalEventBroadcaster::new()),
    }));

    let state = AppState {
        user_service,
        friendship_service,
        conversation_service,
        message_service,
        gateway,
        jwt_service: Arc::new(JwtService::new(&config.jwt)),
        gateway_config: config.gateway.clone(),
    };

    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;

    tracing::info!("私信服务启动在 http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
