use std::sync::Arc;

use domain::{
    DomainError, PhoneNumber, PublicKey, RepositoryError, User, UserId, Username,
};
use rand::seq::IndexedRandom;
use uuid::Uuid;

use crate::{
    clock::{Clock, IdGenerator},
    error::ApplicationError,
    password::PasswordHasher,
    repository::UserRepository,
};

/// 生成的 ID 已存在时最多重试的次数
pub const MAX_ID_ATTEMPTS: usize = 5;

const MIN_PASSWORD_LEN: usize = 6;

/// 客户端未指定头像颜色时从中随机挑选
const ICON_PALETTE: &[&str] = &[
    "#F44336", "#E91E63", "#9C27B0", "#673AB7", "#3F51B5", "#2196F3", "#009688", "#4CAF50",
    "#FF9800", "#795548",
];

#[derive(Debug, Clone)]
pub struct RegisterUserRequest {
    pub username: String,
    pub phone: String,
    pub password: String,
    pub public_key: Option<String>,
    pub icon_color: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthenticateUserRequest {
    pub username: String,
    pub password: String,
}

pub struct UserServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub clock: Arc<dyn Clock>,
    pub id_generator: Arc<dyn IdGenerator>,
}

pub struct UserService {
    deps: UserServiceDependencies,
}

fn user_not_found(err: RepositoryError) -> ApplicationError {
    match err {
        RepositoryError::NotFound => DomainError::UserNotFound.into(),
        other => other.into(),
    }
}

impl UserService {
    pub fn new(deps: UserServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn register(&self, request: RegisterUserRequest) -> Result<User, ApplicationError> {
        let username = Username::parse(request.username)?;
        let phone = PhoneNumber::parse(request.phone)?;
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(DomainError::invalid_argument(
                "password",
                format!("must be at least {MIN_PASSWORD_LEN} characters"),
            )
            .into());
        }

        let repo = &self.deps.user_repository;
        if repo.find_by_username(&username).await?.is_some() {
            return Err(DomainError::duplicate_user("username").into());
        }
        if repo.find_by_phone(&phone).await?.is_some() {
            return Err(DomainError::duplicate_user("phone").into());
        }

        let password_hash = self.deps.password_hasher.hash(&request.password).await?;
        let id = self.allocate_id().await?;
        let icon_color = match request.icon_color.map(|c| c.trim().to_owned()) {
            Some(color) if !color.is_empty() => color,
            _ => random_icon_color(),
        };

        let user = User::register(
            id,
            username,
            phone,
            password_hash,
            request.public_key.map(PublicKey::new),
            icon_color,
            self.deps.clock.now(),
        );

        // 并发注册时由唯一约束兜底
        let stored = repo.create(user).await.map_err(|err| match err {
            RepositoryError::Conflict => {
                ApplicationError::from(DomainError::duplicate_user("username or phone"))
            }
            other => other.into(),
        })?;

        tracing::info!(user_id = %stored.id, username = %stored.username, "用户注册成功");
        Ok(stored)
    }

    async fn allocate_id(&self) -> Result<UserId, ApplicationError> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let candidate = UserId::from(self.deps.id_generator.next_id());
            if self
                .deps
                .user_repository
                .find_by_id(candidate)
                .await?
                .is_none()
            {
                return Ok(candidate);
            }
            tracing::warn!(attempt, user_id = %candidate, "生成的用户ID已存在，重新生成");
        }
        Err(ApplicationError::infrastructure(
            "failed to allocate a unique user id",
        ))
    }

    /// 未知用户与密码错误不做区分
    pub async fn authenticate(
        &self,
        request: AuthenticateUserRequest,
    ) -> Result<User, ApplicationError> {
        let username =
            Username::parse(request.username).map_err(|_| ApplicationError::Authentication)?;
        let user = self
            .deps
            .user_repository
            .find_by_username(&username)
            .await?
            .ok_or(ApplicationError::Authentication)?;
        let hash = user
            .password
            .as_ref()
            .ok_or(ApplicationError::Authentication)?;

        let password_ok = self
            .deps
            .password_hasher
            .verify(&request.password, hash)
            .await?;
        if !password_ok {
            return Err(ApplicationError::Authentication);
        }

        Ok(user)
    }

    /// 输入能解析为 UUID 时按 ID 查找，否则按用户名查找
    pub async fn get_user_info(&self, username_or_id: &str) -> Result<User, ApplicationError> {
        let repo = &self.deps.user_repository;
        let found = match Uuid::parse_str(username_or_id.trim()) {
            Ok(id) => repo.find_by_id(UserId::from(id)).await?,
            Err(_) => {
                let username = Username::parse(username_or_id)?;
                repo.find_by_username(&username).await?
            }
        };
        found.ok_or_else(|| DomainError::UserNotFound.into())
    }

    pub async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();
        self.deps
            .user_repository
            .set_online_status(user_id, online, now)
            .await
            .map_err(user_not_found)
    }

    pub async fn touch_last_seen(&self, user_id: UserId) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();
        self.deps
            .user_repository
            .touch_last_seen(user_id, now)
            .await
            .map_err(user_not_found)
    }
}

fn random_icon_color() -> String {
    ICON_PALETTE
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or("#2196F3")
        .to_string()
}
