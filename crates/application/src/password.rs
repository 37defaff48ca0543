use async_trait::async_trait;
use domain::PasswordHash;
use thiserror::Error;

/// 哈希失败只作为基础设施错误上报，不泄露给客户端
#[derive(Debug, Error)]
pub enum PasswordHasherError {
    #[error("凭证哈希失败: {0}")]
    Hash(String),
    #[error("凭证校验失败: {0}")]
    Verify(String),
}

impl PasswordHasherError {
    pub fn hash_error(message: impl Into<String>) -> Self {
        Self::Hash(message.into())
    }

    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::Verify(message.into())
    }
}

/// 凭证哈希服务，对核心而言不可逆、不透明
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError>;
    async fn verify(
        &self,
        plaintext: &str,
        hashed: &PasswordHash,
    ) -> Result<bool, PasswordHasherError>;
}
