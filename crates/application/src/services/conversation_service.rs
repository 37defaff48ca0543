use std::sync::Arc;

use domain::{
    Conversation, ConversationId, ConversationType, DomainError, Membership, Message,
    RepositoryError, UserId,
};
use serde::Serialize;

use crate::{
    clock::{Clock, IdGenerator},
    error::ApplicationError,
    repository::{ConversationRepository, MessageRepository, UserRepository},
    services::user_service::MAX_ID_ATTEMPTS,
};

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub creator_id: UserId,
    pub participants: Vec<UserId>,
    pub kind: ConversationType,
    pub title: Option<String>,
}

/// 会话列表中的一项，附带最后一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
}

pub struct ConversationServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub clock: Arc<dyn Clock>,
    pub id_generator: Arc<dyn IdGenerator>,
}

pub struct ConversationService {
    deps: ConversationServiceDependencies,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        Self { deps }
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        self.deps
            .user_repository
            .find_by_id(user_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| DomainError::UserNotFound.into())
    }

    pub async fn find(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        self.deps
            .conversation_repository
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| DomainError::ConversationNotFound.into())
    }

    pub async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        Ok(self
            .deps
            .conversation_repository
            .is_member(conversation_id, user_id)
            .await?)
    }

    async fn ensure_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        if self.is_member(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(DomainError::NotConversationMember.into())
        }
    }

    /// 创建者总是成员；会话与成员关系在同一事务内写入
    pub async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ApplicationError> {
        self.ensure_user(request.creator_id).await?;

        let mut others: Vec<UserId> = Vec::with_capacity(request.participants.len());
        for participant in request.participants {
            if participant != request.creator_id && !others.contains(&participant) {
                others.push(participant);
            }
        }
        for participant in &others {
            self.ensure_user(*participant).await?;
        }

        if request.kind == ConversationType::Direct && others.len() != 1 {
            return Err(DomainError::invalid_argument(
                "participants",
                "a direct conversation needs exactly one other participant",
            )
            .into());
        }

        let now = self.deps.clock.now();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = ConversationId::from(self.deps.id_generator.next_id());
            let conversation = Conversation::new(
                id,
                request.kind,
                request.title.clone(),
                request.creator_id,
                now,
            )?;
            let members = std::iter::once(request.creator_id)
                .chain(others.iter().copied())
                .map(|user| Membership::new(id, user, now))
                .collect();

            match self
                .deps
                .conversation_repository
                .create_with_members(conversation, members)
                .await
            {
                Ok(created) => {
                    tracing::info!(
                        conversation_id = %created.id,
                        creator_id = %created.created_by,
                        kind = %created.kind,
                        "会话已创建"
                    );
                    return Ok(created);
                }
                Err(RepositoryError::Conflict) => {
                    tracing::warn!(conversation_id = %id, "生成的会话ID已存在，重新生成");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(ApplicationError::infrastructure(
            "failed to allocate a unique conversation id",
        ))
    }

    /// 重复添加会被拒绝；只有会话成员可以拉人
    pub async fn add_member(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        self.find(conversation_id).await?;
        self.ensure_member(conversation_id, actor_id).await?;
        self.ensure_user(user_id).await?;

        let membership = Membership::new(conversation_id, user_id, self.deps.clock.now());
        self.deps
            .conversation_repository
            .add_member(membership)
            .await
            .map_err(|err| match err {
                RepositoryError::Conflict => {
                    ApplicationError::from(DomainError::DuplicateMembership)
                }
                RepositoryError::NotFound => {
                    ApplicationError::from(DomainError::ConversationNotFound)
                }
                other => other.into(),
            })?;

        tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "成员已加入会话");
        Ok(())
    }

    /// 移除非成员是空操作；成员可以移除任何人，非成员只能移除自己
    pub async fn remove_member(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        self.find(conversation_id).await?;
        if actor_id != user_id {
            self.ensure_member(conversation_id, actor_id).await?;
        }

        let removed = self
            .deps
            .conversation_repository
            .remove_member(conversation_id, user_id)
            .await?;
        if removed {
            tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "成员已移出会话");
        }
        Ok(())
    }

    pub async fn members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        Ok(self
            .deps
            .conversation_repository
            .list_members(conversation_id)
            .await?)
    }

    pub async fn get_last_message(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .last_in_conversation(conversation_id)
            .await?)
    }

    /// 按最近活动时间倒序
    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationSummary>, ApplicationError> {
        let conversations = self
            .deps
            .conversation_repository
            .list_for_user(user_id)
            .await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let last_message = self.get_last_message(conversation.id).await?;
            summaries.push(ConversationSummary {
                conversation,
                last_message,
            });
        }

        summaries.sort_by(|a, b| {
            let activity = |s: &ConversationSummary| {
                s.last_message
                    .as_ref()
                    .map(|m| m.sent_at)
                    .unwrap_or(s.conversation.created_at)
            };
            activity(b).cmp(&activity(a))
        });
        Ok(summaries)
    }
}
