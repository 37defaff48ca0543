use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, FriendEdge, FriendView, FriendshipPromotion, Membership,
    Message, MessageContent, MessageId, PhoneNumber, ReadReceipt, RepositoryError, Timestamp,
    User, UserId, Username,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 用户名或手机号冲突时返回 `RepositoryError::Conflict`
    async fn create(&self, user: User) -> Result<User, RepositoryError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_username(&self, username: &Username)
        -> Result<Option<User>, RepositoryError>;
    async fn find_by_phone(&self, phone: &PhoneNumber) -> Result<Option<User>, RepositoryError>;
    async fn set_online_status(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
    async fn touch_last_seen(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FriendRepository: Send + Sync {
    async fn find_edge(
        &self,
        owner: UserId,
        target: UserId,
    ) -> Result<Option<FriendEdge>, RepositoryError>;

    async fn insert_pending(&self, edge: FriendEdge) -> Result<(), RepositoryError>;

    /// 返回是否真的删除了一条边
    async fn delete_edge(&self, owner: UserId, target: UserId) -> Result<bool, RepositoryError>;

    /// 在同一事务内写入两条 accepted 边。
    ///
    /// 接收方的 pending 边已不存在时返回 `RepositoryError::NotFound`，
    /// 任何失败都不会留下部分写入。
    async fn promote(&self, promotion: &FriendshipPromotion) -> Result<(), RepositoryError>;

    /// 某用户持有的全部边，附带对端用户信息
    async fn list_edges(&self, owner: UserId) -> Result<Vec<FriendView>, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_with_members(
        &self,
        conversation: Conversation,
        members: Vec<Membership>,
    ) -> Result<Conversation, RepositoryError>;
    async fn find_by_id(&self, id: ConversationId)
        -> Result<Option<Conversation>, RepositoryError>;
    async fn add_member(&self, membership: Membership) -> Result<(), RepositoryError>;
    async fn remove_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError>;
    async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError>;
    async fn list_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError>;
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    // 按发送时间升序，同一时间按写入顺序
    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn last_in_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError>;

    async fn update_content(
        &self,
        id: MessageId,
        text: MessageContent,
        edited_at: Timestamp,
    ) -> Result<Message, RepositoryError>;

    async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError>;

    /// 幂等写入已读回执，返回是否新写入了一行
    async fn record_receipt(&self, receipt: ReadReceipt) -> Result<bool, RepositoryError>;

    /// 用户所在会话中他人发送、且该用户尚无回执的消息
    async fn list_unread(&self, user_id: UserId) -> Result<Vec<Message>, RepositoryError>;
}
