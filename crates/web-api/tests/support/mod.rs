#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use application::{
    ConversationService, ConversationServiceDependencies, FriendshipService,
    FriendshipServiceDependencies, Gateway, GatewayDependencies, LocalEventBroadcaster,
    MemoryPresenceManager, MemoryStorage, MessageService, MessageServiceDependencies,
    SystemClock, UserService, UserServiceDependencies, UuidGenerator,
};
use config::GatewayConfig;
use infrastructure::BcryptPasswordHasher;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use web_api::{router, AppState, JwtConfig, JwtService};

pub struct TestApp {
    pub base_http: String,
    pub base_ws: String,
    pub client: Client,
    pub storage: Arc<MemoryStorage>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub struct LoggedIn {
    pub id: String,
    pub username: String,
    pub token: String,
}

/// 在随机端口上启动完整路由，存储使用内存实现
pub async fn spawn_app() -> TestApp {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(SystemClock);
    let id_generator = Arc::new(UuidGenerator);

    let user_service = Arc::new(UserService::new(UserServiceDependencies {
        user_repository: storage.clone(),
        password_hasher: Arc::new(BcryptPasswordHasher::new(Some(4))),
        clock: clock.clone(),
        id_generator: id_generator.clone(),
    }));
    let friendship_service = Arc::new(FriendshipService::new(FriendshipServiceDependencies {
        user_repository: storage.clone(),
        friend_repository: storage.clone(),
        clock: clock.clone(),
        online_window_minutes: 5,
    }));
    let conversation_service =
        Arc::new(ConversationService::new(ConversationServiceDependencies {
            user_repository: storage.clone(),
            conversation_repository: storage.clone(),
            message_repository: storage.clone(),
            clock: clock.clone(),
            id_generator: id_generator.clone(),
        }));
    let message_service = Arc::new(MessageService::new(MessageServiceDependencies {
        conversation_repository: storage.clone(),
        message_repository: storage.clone(),
        clock,
        id_generator,
    }));
    let gateway = Arc::new(Gateway::new(GatewayDependencies {
        user_service: user_service.clone(),
        conversation_service: conversation_service.clone(),
        message_service: message_service.clone(),
        presence_manager: Arc::new(MemoryPresenceManager::new()),
        broadcaster: Arc::new(LocalEventBroadcaster::new()),
    }));
    let jwt_service = Arc::new(JwtService::new(&JwtConfig {
        secret: "integration-test-secret-with-enough-length".to_string(),
        expiration_hours: 1,
    }));

    let state = AppState {
        user_service,
        friendship_service,
        conversation_service,
        message_service,
        gateway,
        jwt_service,
        gateway_config: GatewayConfig::default(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // allow server to start
    sleep(Duration::from_millis(50)).await;

    TestApp {
        base_http: format!("http://{addr}"),
        base_ws: format!("ws://{addr}"),
        client: Client::new(),
        storage,
        shutdown: Some(shutdown_tx),
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_http, path)
    }

    pub async fn register(&self, username: &str, phone: &str) -> Value {
        let response = self
            .client
            .post(self.url("/user/register"))
            .json(&json!({
                "username": username,
                "phone": phone,
                "password": "secret-pass",
            }))
            .send()
            .await
            .expect("register request");
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.expect("register json")
    }

    pub async fn login(&self, username: &str) -> LoggedIn {
        let response = self
            .client
            .post(self.url("/user/login"))
            .json(&json!({ "username": username, "password": "secret-pass" }))
            .send()
            .await
            .expect("login request");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.expect("login json");
        LoggedIn {
            id: body["user"]["id"].as_str().expect("user id").to_string(),
            username: username.to_string(),
            token: body["token"].as_str().expect("token").to_string(),
        }
    }

    pub async fn signup(&self, username: &str, phone: &str) -> LoggedIn {
        self.register(username, phone).await;
        self.login(username).await
    }
}
