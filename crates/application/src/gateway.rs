//! 实时网关
//!
//! 每条连接的状态：`Connected`（匿名）→ `Identified(user)` → `Disconnected`。
//! 网关是在线状态的唯一写入方，也是消息、输入中、已读事件的唯一广播方。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{DomainError, UserId};
use tokio::sync::{mpsc, Mutex};

use crate::{
    broadcaster::{ConnectionId, EventBroadcaster, Eviction},
    error::ApplicationError,
    events::{
        ClientEvent, MessageReadNotice, MessageReadPayload, NewMessagePayload,
        SendMessagePayload, ServerEvent, TypingPayload, UserStatusChangedPayload,
    },
    presence::PresenceManager,
    services::{ConversationService, MessageService, UserService},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Identified(UserId),
    Disconnected,
}

/// 单条连接的会话状态，由连接自己的处理任务独占
#[derive(Debug)]
pub struct GatewaySession {
    connection_id: ConnectionId,
    // 握手时令牌证明的用户
    authenticated_user: UserId,
    state: SessionState,
    eviction: Eviction,
}

impl GatewaySession {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// 出站队列写满被驱逐时触发，连接应随即断开
    pub fn eviction(&self) -> Eviction {
        self.eviction.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identified_user(&self) -> Option<UserId> {
        match self.state {
            SessionState::Identified(user) => Some(user),
            _ => None,
        }
    }

    fn require_user(&self, claimed: UserId) -> Result<UserId, ApplicationError> {
        match self.state {
            SessionState::Identified(user) if user == claimed => Ok(user),
            SessionState::Identified(_) => Err(ApplicationError::Authorization),
            _ => Err(ApplicationError::Authentication),
        }
    }
}

pub struct GatewayDependencies {
    pub user_service: Arc<UserService>,
    pub conversation_service: Arc<ConversationService>,
    pub message_service: Arc<MessageService>,
    pub presence_manager: Arc<dyn PresenceManager>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
}

pub struct Gateway {
    deps: GatewayDependencies,
    // 同一用户的上线/下线转换串行执行
    presence_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl Gateway {
    pub fn new(deps: GatewayDependencies) -> Self {
        Self {
            deps,
            presence_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn presence_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        self.presence_locks
            .lock()
            .await
            .entry(user)
            .or_default()
            .clone()
    }

    async fn release_presence_lock(&self, user: UserId, lock: Arc<Mutex<()>>) {
        let mut locks = self.presence_locks.lock().await;
        // 只剩表里和这里两份引用，说明没有其他连接在等这把锁
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&user);
        }
    }

    /// 注册一条新连接，出站事件写入 `outbound`
    pub async fn open(
        &self,
        authenticated_user: UserId,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> GatewaySession {
        let connection_id = ConnectionId::new();
        let eviction = self
            .deps
            .broadcaster
            .register(connection_id, outbound)
            .await;
        tracing::debug!(connection_id = %connection_id, user_id = %authenticated_user, "连接已建立");
        GatewaySession {
            connection_id,
            authenticated_user,
            state: SessionState::Connected,
            eviction,
        }
    }

    pub async fn handle(
        &self,
        session: &mut GatewaySession,
        event: ClientEvent,
    ) -> Result<(), ApplicationError> {
        if session.state == SessionState::Disconnected {
            return Err(ApplicationError::Authentication);
        }

        let result = match event {
            ClientEvent::UserConnected(payload) => {
                return self.identify(session, payload.user_id).await;
            }
            ClientEvent::SendMessage(payload) => self.send_message(session, payload).await,
            ClientEvent::Typing(payload) => self.typing(session, payload).await,
            ClientEvent::MessageRead(payload) => self.message_read(session, payload).await,
        };

        // 客户端有活动即续期连接记录
        if let Some(user) = session.identified_user() {
            if let Err(err) = self
                .deps
                .presence_manager
                .refresh(user, session.connection_id)
                .await
            {
                tracing::warn!(error = %err, user_id = %user, "续期连接记录失败");
            }
        }
        result
    }

    async fn identify(
        &self,
        session: &mut GatewaySession,
        claimed: UserId,
    ) -> Result<(), ApplicationError> {
        if claimed != session.authenticated_user {
            tracing::warn!(
                connection_id = %session.connection_id,
                claimed = %claimed,
                authenticated = %session.authenticated_user,
                "userConnected 声明的用户与令牌不符"
            );
            return Err(ApplicationError::Authentication);
        }
        if session.state == SessionState::Identified(claimed) {
            return Ok(());
        }

        let lock = self.presence_lock(claimed).await;
        let guard = lock.lock().await;
        let result = self.connect_user(session.connection_id, claimed).await;
        drop(guard);
        self.release_presence_lock(claimed, lock).await;

        // 转换完整成功后才进入 Identified，失败时客户端可重发 userConnected
        result?;
        session.state = SessionState::Identified(claimed);
        Ok(())
    }

    async fn connect_user(
        &self,
        connection_id: ConnectionId,
        user: UserId,
    ) -> Result<(), ApplicationError> {
        self.deps.broadcaster.bind_user(connection_id, user).await?;
        let first = self
            .deps
            .presence_manager
            .user_connected(user, connection_id)
            .await?;

        if let Err(err) = self.apply_presence(user, first, true).await {
            if let Err(rollback) = self
                .deps
                .presence_manager
                .user_disconnected(user, connection_id)
                .await
            {
                tracing::warn!(error = %rollback, user_id = %user, "撤销连接记录失败");
            }
            return Err(err);
        }
        Ok(())
    }

    /// 首条连接上线或末条连接下线时写入在线标记并广播，否则只刷新最后在线时间
    async fn apply_presence(
        &self,
        user: UserId,
        transition: bool,
        online: bool,
    ) -> Result<(), ApplicationError> {
        if !transition {
            return self.deps.user_service.touch_last_seen(user).await;
        }
        self.deps.user_service.set_online(user, online).await?;
        self.broadcast_status(user, online).await?;
        if online {
            tracing::info!(user_id = %user, "用户上线");
        } else {
            tracing::info!(user_id = %user, "用户下线");
        }
        Ok(())
    }

    async fn broadcast_status(
        &self,
        user_id: UserId,
        online: bool,
    ) -> Result<(), ApplicationError> {
        let event = ServerEvent::UserStatusChanged(UserStatusChangedPayload {
            user_id,
            online_status: online,
        });
        self.deps
            .broadcaster
            .send_to_all(Some(user_id), event)
            .await?;
        Ok(())
    }

    /// 先持久化，再扇出给会话所有成员（包括发送者自己的连接）
    async fn send_message(
        &self,
        session: &GatewaySession,
        payload: SendMessagePayload,
    ) -> Result<(), ApplicationError> {
        let author = session.require_user(payload.user_id)?;
        let message = self
            .deps
            .message_service
            .append_message(author, payload.conversation_id, payload.text)
            .await?;

        let members = self
            .deps
            .conversation_service
            .members(message.conversation_id)
            .await?;
        let event = ServerEvent::NewMessage(NewMessagePayload {
            message: message.clone(),
        });
        let delivered = self
            .deps
            .broadcaster
            .send_to_users(&members, None, event)
            .await?;

        tracing::debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            delivered,
            "消息已广播"
        );
        Ok(())
    }

    async fn typing(
        &self,
        session: &GatewaySession,
        payload: TypingPayload,
    ) -> Result<(), ApplicationError> {
        let user = session.require_user(payload.user_id)?;
        let members = self
            .deps
            .conversation_service
            .members(payload.conversation_id)
            .await?;
        if !members.contains(&user) {
            return Err(DomainError::NotConversationMember.into());
        }

        self.deps
            .broadcaster
            .send_to_users(&members, Some(user), ServerEvent::UserTyping(payload))
            .await?;
        Ok(())
    }

    async fn message_read(
        &self,
        session: &GatewaySession,
        payload: MessageReadPayload,
    ) -> Result<(), ApplicationError> {
        let reader = session.require_user(payload.user_id)?;
        let Some((message, receipt)) = self
            .deps
            .message_service
            .record_read_receipt(reader, payload.message_id)
            .await?
        else {
            return Ok(());
        };

        if message.conversation_id != payload.conversation_id {
            tracing::debug!(
                message_id = %message.id,
                claimed = %payload.conversation_id,
                "messageRead 携带的会话与消息不符，按消息所属会话转发"
            );
        }

        let members = self
            .deps
            .conversation_service
            .members(message.conversation_id)
            .await?;
        let notice = ServerEvent::MessageRead(MessageReadNotice {
            user_id: reader,
            message_id: message.id,
            conversation_id: message.conversation_id,
            read_at: receipt.read_at,
        });
        self.deps
            .broadcaster
            .send_to_users(&members, Some(reader), notice)
            .await?;
        Ok(())
    }

    /// 心跳刷新最后在线时间，使空闲但仍连接的用户保持在线
    pub async fn heartbeat(&self, session: &GatewaySession) -> Result<(), ApplicationError> {
        if let Some(user) = session.identified_user() {
            self.deps
                .presence_manager
                .refresh(user, session.connection_id)
                .await?;
            self.deps.user_service.touch_last_seen(user).await?;
        }
        Ok(())
    }

    /// 连接关闭；可重复调用
    pub async fn close(&self, session: &mut GatewaySession) -> Result<(), ApplicationError> {
        let previous = std::mem::replace(&mut session.state, SessionState::Disconnected);
        self.deps
            .broadcaster
            .unregister(session.connection_id)
            .await;

        let SessionState::Identified(user) = previous else {
            tracing::debug!(connection_id = %session.connection_id, "匿名连接已关闭");
            return Ok(());
        };

        let lock = self.presence_lock(user).await;
        let guard = lock.lock().await;
        let result = match self
            .deps
            .presence_manager
            .user_disconnected(user, session.connection_id)
            .await
        {
            Ok(last) => self.apply_presence(user, last, false).await,
            Err(err) => Err(err),
        };
        drop(guard);
        self.release_presence_lock(user, lock).await;
        result
    }
}
