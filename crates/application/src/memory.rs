//! 内存仓储实现，用于测试与本地开发
//!
//! 所有实体保存在一个 `RwLock` 保护的状态里，一次写锁内完成的修改天然是原子的。
//! 好友关系升级支持故障注入，用来验证失败时不会留下部分写入。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, FriendEdge, FriendStatus, FriendSummary, FriendView,
    FriendshipPromotion, Membership, Message, MessageContent, MessageId, PhoneNumber,
    ReadReceipt, RepositoryError, Timestamp, User, UserId, Username,
};
use tokio::sync::RwLock;

use crate::repository::{
    ConversationRepository, FriendRepository, MessageRepository, UserRepository,
};

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    edges: HashMap<(UserId, UserId), FriendEdge>,
    conversations: HashMap<ConversationId, Conversation>,
    memberships: HashMap<(ConversationId, UserId), Membership>,
    // 写入顺序即同一时间戳下的先后顺序
    messages: Vec<Message>,
    receipts: HashMap<(MessageId, UserId), ReadReceipt>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
    fail_next_promotion: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一次 `promote` 在更新接收方的边之后、写入反向边之前失败
    pub fn fail_next_promotion(&self) {
        self.fail_next_promotion.store(true, Ordering::SeqCst);
    }

    pub async fn edge_count(&self, status: FriendStatus) -> usize {
        let state = self.state.read().await;
        state.edges.values().filter(|e| e.status == status).count()
    }

    pub async fn receipt_count(&self, message_id: MessageId) -> usize {
        let state = self.state.read().await;
        state
            .receipts
            .keys()
            .filter(|(message, _)| *message == message_id)
            .count()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

fn summary_of(user: &User) -> FriendSummary {
    FriendSummary {
        id: user.id,
        username: user.username.clone(),
        icon_color: user.icon_color.clone(),
        public_key: user.public_key.clone(),
        last_online: user.last_online,
    }
}

fn sorted_by_send_time(mut messages: Vec<Message>) -> Vec<Message> {
    // 稳定排序，保留写入顺序作为并列时的次序
    messages.sort_by_key(|m| m.sent_at);
    messages
}

#[async_trait]
impl UserRepository for MemoryStorage {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let mut state = self.state.write().await;
        let taken = state.users.values().any(|existing| {
            existing.id == user.id
                || existing.username == user.username
                || existing.phone == user.phone
        });
        if taken {
            return Err(RepositoryError::Conflict);
        }
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn find_by_username(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| &u.username == username).cloned())
    }

    async fn find_by_phone(&self, phone: &PhoneNumber) -> Result<Option<User>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| &u.phone == phone).cloned())
    }

    async fn set_online_status(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let user = state.users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.mark_online(online, at);
        Ok(())
    }

    async fn touch_last_seen(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let user = state.users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.touch(at);
        Ok(())
    }
}

#[async_trait]
impl FriendRepository for MemoryStorage {
    async fn find_edge(
        &self,
        owner: UserId,
        target: UserId,
    ) -> Result<Option<FriendEdge>, RepositoryError> {
        Ok(self.state.read().await.edges.get(&(owner, target)).cloned())
    }

    async fn insert_pending(&self, edge: FriendEdge) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let key = (edge.owner_id, edge.target_id);
        if state.edges.contains_key(&key) {
            return Err(RepositoryError::Conflict);
        }
        state.edges.insert(key, edge);
        Ok(())
    }

    async fn delete_edge(&self, owner: UserId, target: UserId) -> Result<bool, RepositoryError> {
        Ok(self
            .state
            .write()
            .await
            .edges
            .remove(&(owner, target))
            .is_some())
    }

    async fn promote(&self, promotion: &FriendshipPromotion) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let recipient_key = (promotion.recipient(), promotion.sender());
        let sender_key = (promotion.sender(), promotion.recipient());

        // 在副本上修改，成功后整体替换
        let mut staged = state.edges.clone();
        match staged.get_mut(&recipient_key) {
            Some(edge) if edge.is_pending() => edge.status = FriendStatus::Accepted,
            _ => return Err(RepositoryError::NotFound),
        }

        if self.fail_next_promotion.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::storage("injected failure during promotion"));
        }

        staged
            .entry(sender_key)
            .and_modify(|edge| edge.status = FriendStatus::Accepted)
            .or_insert_with(|| promotion.sender_edge.clone());

        state.edges = staged;
        Ok(())
    }

    async fn list_edges(&self, owner: UserId) -> Result<Vec<FriendView>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .edges
            .values()
            .filter(|edge| edge.owner_id == owner)
            .filter_map(|edge| {
                state.users.get(&edge.target_id).map(|friend| FriendView {
                    status: edge.status,
                    friend: summary_of(friend),
                })
            })
            .collect())
    }
}

#[async_trait]
impl ConversationRepository for MemoryStorage {
    async fn create_with_members(
        &self,
        conversation: Conversation,
        members: Vec<Membership>,
    ) -> Result<Conversation, RepositoryError> {
        let mut state = self.state.write().await;
        if state.conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }
        let mut seen = HashSet::new();
        if !members.iter().all(|m| seen.insert(m.user_id)) {
            return Err(RepositoryError::Conflict);
        }

        state
            .conversations
            .insert(conversation.id, conversation.clone());
        for membership in members {
            state
                .memberships
                .insert((membership.conversation_id, membership.user_id), membership);
        }
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.state.read().await.conversations.get(&id).cloned())
    }

    async fn add_member(&self, membership: Membership) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&membership.conversation_id) {
            return Err(RepositoryError::NotFound);
        }
        let key = (membership.conversation_id, membership.user_id);
        if state.memberships.contains_key(&key) {
            return Err(RepositoryError::Conflict);
        }
        state.memberships.insert(key, membership);
        Ok(())
    }

    async fn remove_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        Ok(state
            .memberships
            .remove(&(conversation_id, user_id))
            .is_some())
    }

    async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.memberships.contains_key(&(conversation_id, user_id)))
    }

    async fn list_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let state = self.state.read().await;
        let mut members: Vec<&Membership> = state
            .memberships
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members.into_iter().map(|m| m.user_id).collect())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| state.conversations.get(&m.conversation_id).cloned())
            .collect();
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }
}

#[async_trait]
impl MessageRepository for MemoryStorage {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        if state.messages.iter().any(|m| m.id == message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        let messages = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        Ok(sorted_by_send_time(messages))
    }

    async fn last_in_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        let state = self.state.read().await;
        // max_by_key 在并列时返回最后一个，即最晚写入的
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by_key(|m| m.sent_at)
            .cloned())
    }

    async fn update_content(
        &self,
        id: MessageId,
        text: MessageContent,
        edited_at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(RepositoryError::NotFound)?;
        message.edit(text, edited_at);
        Ok(message.clone())
    }

    async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let before = state.messages.len();
        state.messages.retain(|m| m.id != id);
        let deleted = state.messages.len() != before;
        if deleted {
            state.receipts.retain(|(message, _), _| *message != id);
        }
        Ok(deleted)
    }

    async fn record_receipt(&self, receipt: ReadReceipt) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.messages.iter().any(|m| m.id == receipt.message_id) {
            return Err(RepositoryError::NotFound);
        }
        let key = (receipt.message_id, receipt.user_id);
        if state.receipts.contains_key(&key) {
            return Ok(false);
        }
        state.receipts.insert(key, receipt);
        Ok(true)
    }

    async fn list_unread(&self, user_id: UserId) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        let joined: HashSet<ConversationId> = state
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.conversation_id)
            .collect();

        let unread = state
            .messages
            .iter()
            .filter(|m| joined.contains(&m.conversation_id))
            .filter(|m| m.sender_id != user_id)
            .filter(|m| !state.receipts.contains_key(&(m.id, user_id)))
            .cloned()
            .collect();
        Ok(sorted_by_send_time(unread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{PasswordHash, PhoneNumber};
    use time::macros::datetime;
    use uuid::Uuid;

    fn user(name: &str, phone: &str) -> User {
        User::register(
            UserId::from(Uuid::new_v4()),
            Username::parse(name).unwrap(),
            PhoneNumber::parse(phone).unwrap(),
            PasswordHash::new("hash").unwrap(),
            None,
            "#112233",
            datetime!(2024-05-01 12:00 UTC),
        )
    }

    #[tokio::test]
    async fn duplicate_username_or_phone_conflicts() {
        let storage = MemoryStorage::new();
        UserRepository::create(&storage, user("alice", "5550001"))
            .await
            .unwrap();

        let same_name = UserRepository::create(&storage, user("alice", "5550002")).await;
        assert!(matches!(same_name, Err(RepositoryError::Conflict)));
        let same_phone = UserRepository::create(&storage, user("bob", "5550001")).await;
        assert!(matches!(same_phone, Err(RepositoryError::Conflict)));
    }

    #[tokio::test]
    async fn failed_promotion_leaves_pending_edge() {
        let storage = MemoryStorage::new();
        let now = datetime!(2024-05-01 12:00 UTC);
        let (sender, recipient) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let edge = FriendEdge::request(sender, recipient, now).unwrap();
        storage.insert_pending(edge.clone()).await.unwrap();

        storage.fail_next_promotion();
        let promotion = edge.accept(now).unwrap();
        assert!(storage.promote(&promotion).await.is_err());

        assert_eq!(storage.edge_count(FriendStatus::Accepted).await, 0);
        let kept = storage.find_edge(recipient, sender).await.unwrap().unwrap();
        assert!(kept.is_pending());

        storage.promote(&promotion).await.unwrap();
        assert_eq!(storage.edge_count(FriendStatus::Accepted).await, 2);
    }

    #[tokio::test]
    async fn equal_send_times_keep_insertion_order() {
        let storage = MemoryStorage::new();
        let conversation = ConversationId::from(Uuid::new_v4());
        let sender = UserId::from(Uuid::new_v4());
        let at = datetime!(2024-05-01 12:00 UTC);

        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let message = Message::new(
                MessageId::from(Uuid::new_v4()),
                conversation,
                sender,
                MessageContent::new(text).unwrap(),
                at,
            );
            ids.push(message.id);
            MessageRepository::create(&storage, message).await.unwrap();
        }

        let listed: Vec<MessageId> = storage
            .list_by_conversation(conversation)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, ids);

        let last = storage.last_in_conversation(conversation).await.unwrap();
        assert_eq!(last.map(|m| m.id), ids.last().copied());
    }
}
