use std::sync::Arc;

use application::repository::{
    ConversationRepository, FriendRepository, MessageRepository, UserRepository,
};
use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationType, FriendEdge, FriendStatus, FriendSummary,
    FriendView, FriendshipPromotion, Membership, Message, MessageContent, MessageId,
    PasswordHash, PhoneNumber, PublicKey, ReadReceipt, RepositoryError, Timestamp, User, UserId,
    Username,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// 唯一约束冲突映射为 Conflict，外键缺失映射为 NotFound
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict;
        }
        if db.is_foreign_key_violation() {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::storage_with_source("database operation failed", err)
}

const USER_COLUMNS: &str = "id, username, phone, password_hash, public_key, icon_color, \
                            online_status, last_online, created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, time_sent, edited_at";

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    username: String,
    phone: String,
    password_hash: String,
    public_key: Option<String>,
    icon_color: String,
    online_status: bool,
    last_online: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<UserRecord> for User {
    type Error = RepositoryError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        Ok(User {
            id: UserId::from(value.id),
            username: Username::parse(value.username)?,
            phone: PhoneNumber::parse(value.phone)?,
            password: Some(PasswordHash::new(value.password_hash)?),
            public_key: value.public_key.map(PublicKey::new),
            icon_color: value.icon_color,
            online_status: value.online_status,
            last_online: value.last_online,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRecord {
    user_id: Uuid,
    friend_id: Uuid,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<EdgeRecord> for FriendEdge {
    type Error = RepositoryError;

    fn try_from(value: EdgeRecord) -> Result<Self, Self::Error> {
        Ok(FriendEdge {
            owner_id: UserId::from(value.user_id),
            target_id: UserId::from(value.friend_id),
            status: FriendStatus::parse(&value.status)?,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FriendViewRecord {
    status: String,
    id: Uuid,
    username: String,
    icon_color: String,
    public_key: Option<String>,
    last_online: Option<OffsetDateTime>,
}

impl TryFrom<FriendViewRecord> for FriendView {
    type Error = RepositoryError;

    fn try_from(value: FriendViewRecord) -> Result<Self, Self::Error> {
        Ok(FriendView {
            status: FriendStatus::parse(&value.status)?,
            friend: FriendSummary {
                id: UserId::from(value.id),
                username: Username::parse(value.username)?,
                icon_color: value.icon_color,
                public_key: value.public_key.map(PublicKey::new),
                last_online: value.last_online,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    title: Option<String>,
    created_by: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        Ok(Conversation::new(
            ConversationId::from(value.id),
            ConversationType::parse(&value.kind)?,
            value.title,
            UserId::from(value.created_by),
            value.created_at,
        )?)
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    text: String,
    time_sent: OffsetDateTime,
    edited_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let mut message = Message::new(
            MessageId::from(value.id),
            ConversationId::from(value.conversation_id),
            UserId::from(value.sender_id),
            MessageContent::new(value.text)?,
            value.time_sent,
        );
        message.edited_at = value.edited_at;
        Ok(message)
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &str, value: String) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let record = sqlx::query_as::<_, UserRecord>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        record.map(User::try_from).transpose()
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let password = user
            .password
            .as_ref()
            .ok_or_else(|| RepositoryError::storage("user has no credential hash"))?;

        let sql = format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {USER_COLUMNS}"
        );
        let record = sqlx::query_as::<_, UserRecord>(&sql)
            .bind(Uuid::from(user.id))
            .bind(user.username.as_str())
            .bind(user.phone.as_str())
            .bind(password.as_str())
            .bind(user.public_key.as_ref().map(|key| key.as_str()))
            .bind(&user.icon_color)
            .bind(user.online_status)
            .bind(user.last_online)
            .bind(user.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        User::try_from(record)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let record = sqlx::query_as::<_, UserRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        record.map(User::try_from).transpose()
    }

    async fn find_by_username(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        self.find_one("username", username.as_str().to_owned()).await
    }

    async fn find_by_phone(&self, phone: &PhoneNumber) -> Result<Option<User>, RepositoryError> {
        self.find_one("phone", phone.as_str().to_owned()).await
    }

    async fn set_online_status(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE users SET online_status = $2, last_online = $3 WHERE id = $1")
                .bind(Uuid::from(id))
                .bind(online)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn touch_last_seen(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET last_online = $2 WHERE id = $1")
            .bind(Uuid::from(id))
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgFriendRepository {
    pool: PgPool,
}

impl PgFriendRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FriendRepository for PgFriendRepository {
    async fn find_edge(
        &self,
        owner: UserId,
        target: UserId,
    ) -> Result<Option<FriendEdge>, RepositoryError> {
        let record = sqlx::query_as::<_, EdgeRecord>(
            r#"
            SELECT user_id, friend_id, status, created_at
            FROM friends
            WHERE user_id = $1 AND friend_id = $2
            "#,
        )
        .bind(Uuid::from(owner))
        .bind(Uuid::from(target))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(FriendEdge::try_from).transpose()
    }

    async fn insert_pending(&self, edge: FriendEdge) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO friends (user_id, friend_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::from(edge.owner_id))
        .bind(Uuid::from(edge.target_id))
        .bind(edge.status.as_str())
        .bind(edge.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn delete_edge(&self, owner: UserId, target: UserId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM friends WHERE user_id = $1 AND friend_id = $2")
            .bind(Uuid::from(owner))
            .bind(Uuid::from(target))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn promote(&self, promotion: &FriendshipPromotion) -> Result<(), RepositoryError> {
        // 未提交的事务在 drop 时回滚
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 1. 接收方的 pending 边升级
        let updated = sqlx::query(
            r#"
            UPDATE friends
            SET status = 'accepted'
            WHERE user_id = $1 AND friend_id = $2 AND status = 'pending'
            "#,
        )
        .bind(Uuid::from(promotion.recipient()))
        .bind(Uuid::from(promotion.sender()))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Err(RepositoryError::NotFound);
        }

        // 2. 发送方的反向边；交叉请求时已有的 pending 边直接升级
        let sender_edge = &promotion.sender_edge;
        sqlx::query(
            r#"
            INSERT INTO friends (user_id, friend_id, status, created_at)
            VALUES ($1, $2, 'accepted', $3)
            ON CONFLICT (user_id, friend_id) DO UPDATE SET status = 'accepted'
            "#,
        )
        .bind(Uuid::from(sender_edge.owner_id))
        .bind(Uuid::from(sender_edge.target_id))
        .bind(sender_edge.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        // 3. 提交事务
        tx.commit().await.map_err(map_sqlx_err)?;

        tracing::info!(
            recipient_id = %promotion.recipient(),
            sender_id = %promotion.sender(),
            "好友关系升级已提交"
        );
        Ok(())
    }

    async fn list_edges(&self, owner: UserId) -> Result<Vec<FriendView>, RepositoryError> {
        let records = sqlx::query_as::<_, FriendViewRecord>(
            r#"
            SELECT f.status, u.id, u.username, u.icon_color, u.public_key, u.last_online
            FROM friends f
            JOIN users u ON u.id = f.friend_id
            WHERE f.user_id = $1
            "#,
        )
        .bind(Uuid::from(owner))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(FriendView::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create_with_members(
        &self,
        conversation: Conversation,
        members: Vec<Membership>,
    ) -> Result<Conversation, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            INSERT INTO conversations (id, type, title, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, type, title, created_by, created_at
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(conversation.kind.as_str())
        .bind(conversation.title.as_deref())
        .bind(Uuid::from(conversation.created_by))
        .bind(conversation.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        for membership in &members {
            sqlx::query(
                r#"
                INSERT INTO conversation_members (conversation_id, user_id, joined_at)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(Uuid::from(membership.conversation_id))
            .bind(Uuid::from(membership.user_id))
            .bind(membership.joined_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Conversation::try_from(record)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, type, title, created_by, created_at FROM conversations WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn add_member(&self, membership: Membership) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id, joined_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::from(membership.conversation_id))
        .bind(Uuid::from(membership.user_id))
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn remove_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn list_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id FROM conversation_members
            WHERE conversation_id = $1
            ORDER BY joined_at ASC
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT c.id, c.type, c.title, c.created_by, c.created_at
            FROM conversations c
            JOIN conversation_members cm ON cm.conversation_id = c.id
            WHERE cm.user_id = $1
            ORDER BY c.created_at ASC
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Conversation::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let sql = format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(message.conversation_id))
            .bind(Uuid::from(message.sender_id))
            .bind(message.text.as_str())
            .bind(message.sent_at)
            .bind(message.edited_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY time_sent ASC, seq ASC"
        );
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(conversation_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn last_in_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY time_sent DESC, seq DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(conversation_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn update_content(
        &self,
        id: MessageId,
        text: MessageContent,
        edited_at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let sql = format!(
            "UPDATE messages SET text = $2, edited_at = $3 WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(id))
            .bind(text.as_str())
            .bind(edited_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

        Message::try_from(record)
    }

    async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_receipt(&self, receipt: ReadReceipt) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO read_receipts (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(receipt.message_id))
        .bind(Uuid::from(receipt.user_id))
        .bind(receipt.read_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_unread(&self, user_id: UserId) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT m.id, m.conversation_id, m.sender_id, m.text, m.time_sent, m.edited_at
            FROM messages m
            JOIN conversation_members cm
              ON cm.conversation_id = m.conversation_id AND cm.user_id = $1
            WHERE m.sender_id <> $1
              AND NOT EXISTS (
                  SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = $1
              )
            ORDER BY m.time_sent ASC, m.seq ASC
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub friend_repository: Arc<PgFriendRepository>,
    pub conversation_repository: Arc<PgConversationRepository>,
    pub message_repository: Arc<PgMessageRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            friend_repository: Arc::new(PgFriendRepository::new(pool.clone())),
            conversation_repository: Arc::new(PgConversationRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
