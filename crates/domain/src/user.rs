use crate::value_objects::{PasswordHash, PhoneNumber, PublicKey, Timestamp, UserId, Username};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub phone: PhoneNumber,
    #[serde(skip_serializing)] // 密码字段不暴露给客户端
    pub password: Option<PasswordHash>,
    pub public_key: Option<PublicKey>,
    pub icon_color: String,
    /// 只由实时网关修改
    pub online_status: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_online: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl User {
    pub fn register(
        id: UserId,
        username: Username,
        phone: PhoneNumber,
        password: PasswordHash,
        public_key: Option<PublicKey>,
        icon_color: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            username,
            phone,
            password: Some(password),
            public_key,
            icon_color: icon_color.into(),
            online_status: false,
            last_online: None,
            created_at: now,
        }
    }

    pub fn mark_online(&mut self, online: bool, now: Timestamp) {
        self.online_status = online;
        self.last_online = Some(now);
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.last_online = Some(now);
    }
}
