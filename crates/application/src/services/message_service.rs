use std::sync::Arc;

use domain::{
    ConversationId, DomainError, Message, MessageContent, MessageId, ReadReceipt,
    RepositoryError, UserId,
};

use crate::{
    clock::{Clock, IdGenerator},
    error::ApplicationError,
    repository::{ConversationRepository, MessageRepository},
    services::user_service::MAX_ID_ATTEMPTS,
};

pub struct MessageServiceDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub clock: Arc<dyn Clock>,
    pub id_generator: Arc<dyn IdGenerator>,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
}

fn message_not_found(err: RepositoryError) -> ApplicationError {
    match err {
        RepositoryError::NotFound => DomainError::MessageNotFound.into(),
        other => other.into(),
    }
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    async fn ensure_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let repo = &self.deps.conversation_repository;
        if repo.find_by_id(conversation_id).await?.is_none() {
            return Err(DomainError::ConversationNotFound.into());
        }
        if !repo.is_member(conversation_id, user_id).await? {
            return Err(DomainError::NotConversationMember.into());
        }
        Ok(())
    }

    async fn find_message(&self, message_id: MessageId) -> Result<Message, ApplicationError> {
        self.deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::MessageNotFound.into())
    }

    async fn find_own_message(
        &self,
        actor_id: UserId,
        message_id: MessageId,
    ) -> Result<Message, ApplicationError> {
        let message = self.find_message(message_id).await?;
        if message.sender_id != actor_id {
            return Err(ApplicationError::Authorization);
        }
        Ok(message)
    }

    /// 发送时间由服务端分配，保证同一会话内不递减
    pub async fn append_message(
        &self,
        author_id: UserId,
        conversation_id: ConversationId,
        text: impl Into<String>,
    ) -> Result<Message, ApplicationError> {
        self.ensure_member(conversation_id, author_id).await?;
        let content = MessageContent::new(text)?;

        let now = self.deps.clock.now();
        let sent_at = match self
            .deps
            .message_repository
            .last_in_conversation(conversation_id)
            .await?
        {
            Some(last) if last.sent_at > now => last.sent_at,
            _ => now,
        };

        for _ in 0..MAX_ID_ATTEMPTS {
            let message = Message::new(
                MessageId::from(self.deps.id_generator.next_id()),
                conversation_id,
                author_id,
                content.clone(),
                sent_at,
            );
            match self.deps.message_repository.create(message).await {
                Ok(stored) => {
                    tracing::debug!(
                        message_id = %stored.id,
                        conversation_id = %conversation_id,
                        sender_id = %author_id,
                        "消息已保存"
                    );
                    return Ok(stored);
                }
                Err(RepositoryError::Conflict) => {
                    tracing::warn!(conversation_id = %conversation_id, "生成的消息ID已存在，重新生成");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(ApplicationError::infrastructure(
            "failed to allocate a unique message id",
        ))
    }

    /// 按发送时间升序
    pub async fn list_messages(
        &self,
        viewer_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.ensure_member(conversation_id, viewer_id).await?;
        Ok(self
            .deps
            .message_repository
            .list_by_conversation(conversation_id)
            .await?)
    }

    pub async fn update_message(
        &self,
        actor_id: UserId,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(text)?;
        self.find_own_message(actor_id, message_id).await?;

        let updated = self
            .deps
            .message_repository
            .update_content(message_id, content, self.deps.clock.now())
            .await
            .map_err(message_not_found)?;
        tracing::info!(message_id = %message_id, "消息已编辑");
        Ok(updated)
    }

    pub async fn delete_message(
        &self,
        actor_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ApplicationError> {
        self.find_own_message(actor_id, message_id).await?;
        if !self.deps.message_repository.delete(message_id).await? {
            return Err(DomainError::MessageNotFound.into());
        }
        tracing::info!(message_id = %message_id, "消息已删除");
        Ok(())
    }

    /// 幂等；只有新写入回执时返回 `Some`
    pub async fn record_read_receipt(
        &self,
        reader_id: UserId,
        message_id: MessageId,
    ) -> Result<Option<(Message, ReadReceipt)>, ApplicationError> {
        let message = self.find_message(message_id).await?;
        self.ensure_member(message.conversation_id, reader_id)
            .await?;

        let receipt = ReadReceipt::new(message_id, reader_id, self.deps.clock.now());
        let written = self
            .deps
            .message_repository
            .record_receipt(receipt.clone())
            .await
            .map_err(message_not_found)?;

        Ok(written.then_some((message, receipt)))
    }

    pub async fn list_unread(&self, user_id: UserId) -> Result<Vec<Message>, ApplicationError> {
        Ok(self.deps.message_repository.list_unread(user_id).await?)
    }
}
