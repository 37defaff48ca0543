// 单实例内的连接注册表
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::UserId;
use tokio::sync::{mpsc, mpsc::error::TrySendError, RwLock};

use crate::broadcaster::{BroadcastError, ConnectionId, EventBroadcaster, Eviction};
use crate::events::ServerEvent;

struct ConnectionEntry {
    user: Option<UserId>,
    sender: mpsc::Sender<ServerEvent>,
    eviction: Eviction,
}

#[derive(Default)]
pub struct LocalEventBroadcaster {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl LocalEventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只用 `try_send` 投递，一条连接的背压不会拖住其他连接。
    /// 队列已满的连接被移出注册表并通知其断开；
    /// 队列已关闭的连接直接跳过，由连接自己的清理流程注销。
    async fn deliver(
        &self,
        targets: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)>,
        event: ServerEvent,
    ) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for (connection, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %connection,
                        event = event.name(),
                        "出站队列已满，丢弃事件并驱逐连接"
                    );
                    stalled.push(connection);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection_id = %connection, "出站队列已关闭，跳过");
                }
            }
        }

        if !stalled.is_empty() {
            let mut connections = self.connections.write().await;
            for connection in stalled {
                if let Some(entry) = connections.remove(&connection) {
                    entry.eviction.trigger();
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl EventBroadcaster for LocalEventBroadcaster {
    async fn register(
        &self,
        connection: ConnectionId,
        sender: mpsc::Sender<ServerEvent>,
    ) -> Eviction {
        let eviction = Eviction::default();
        self.connections.write().await.insert(
            connection,
            ConnectionEntry {
                user: None,
                sender,
                eviction: eviction.clone(),
            },
        );
        eviction
    }

    async fn bind_user(
        &self,
        connection: ConnectionId,
        user: UserId,
    ) -> Result<(), BroadcastError> {
        let mut connections = self.connections.write().await;
        let entry = connections
            .get_mut(&connection)
            .ok_or(BroadcastError::UnknownConnection(connection))?;
        entry.user = Some(user);
        Ok(())
    }

    async fn unregister(&self, connection: ConnectionId) {
        self.connections.write().await.remove(&connection);
    }

    async fn send_to_users(
        &self,
        users: &[UserId],
        exclude_user: Option<UserId>,
        event: ServerEvent,
    ) -> Result<usize, BroadcastError> {
        let wanted: HashSet<UserId> = users
            .iter()
            .copied()
            .filter(|user| Some(*user) != exclude_user)
            .collect();

        let targets: Vec<_> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, entry)| entry.user.is_some_and(|user| wanted.contains(&user)))
                .map(|(id, entry)| (*id, entry.sender.clone()))
                .collect()
        };

        Ok(self.deliver(targets, event).await)
    }

    async fn send_to_all(
        &self,
        exclude_user: Option<UserId>,
        event: ServerEvent,
    ) -> Result<usize, BroadcastError> {
        let targets: Vec<_> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, entry)| exclude_user.is_none() || entry.user != exclude_user)
                .map(|(id, entry)| (*id, entry.sender.clone()))
                .collect()
        };

        Ok(self.deliver(targets, event).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UserStatusChangedPayload;
    use uuid::Uuid;

    fn status_event(user: UserId) -> ServerEvent {
        ServerEvent::UserStatusChanged(UserStatusChangedPayload {
            user_id: user,
            online_status: true,
        })
    }

    #[tokio::test]
    async fn send_to_users_reaches_every_connection_once() {
        let broadcaster = LocalEventBroadcaster::new();
        let alice = UserId::from(Uuid::new_v4());
        let bob = UserId::from(Uuid::new_v4());

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        let (c1, c2, c3) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        broadcaster.register(c1, tx1).await;
        broadcaster.register(c2, tx2).await;
        broadcaster.register(c3, tx3).await;
        broadcaster.bind_user(c1, alice).await.unwrap();
        broadcaster.bind_user(c2, alice).await.unwrap();
        broadcaster.bind_user(c3, bob).await.unwrap();

        let delivered = broadcaster
            .send_to_users(&[alice, alice], None, status_event(bob))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_all_skips_excluded_user_but_not_anonymous() {
        let broadcaster = LocalEventBroadcaster::new();
        let alice = UserId::from(Uuid::new_v4());

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        broadcaster.register(c1, tx1).await;
        broadcaster.register(c2, tx2).await;
        broadcaster.bind_user(c1, alice).await.unwrap();

        let delivered = broadcaster
            .send_to_all(Some(alice), status_event(alice))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_queue_is_skipped() {
        let broadcaster = LocalEventBroadcaster::new();
        let alice = UserId::from(Uuid::new_v4());
        let (tx, rx) = mpsc::channel(1);
        let connection = ConnectionId::new();
        broadcaster.register(connection, tx).await;
        broadcaster.bind_user(connection, alice).await.unwrap();
        drop(rx);

        let delivered = broadcaster
            .send_to_users(&[alice], None, status_event(alice))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn full_queue_is_evicted_without_blocking_others() {
        let broadcaster = LocalEventBroadcaster::new();
        let alice = UserId::from(Uuid::new_v4());
        let bob = UserId::from(Uuid::new_v4());

        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (stalled, live) = (ConnectionId::new(), ConnectionId::new());
        let eviction = broadcaster.register(stalled, stalled_tx.clone()).await;
        broadcaster.register(live, live_tx).await;
        broadcaster.bind_user(stalled, alice).await.unwrap();
        broadcaster.bind_user(live, bob).await.unwrap();
        stalled_tx.try_send(status_event(alice)).unwrap();

        let delivered = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            broadcaster.send_to_all(None, status_event(bob)),
        )
        .await
        .expect("fan-out must not wait on a full queue")
        .unwrap();
        assert_eq!(delivered, 1);
        assert!(live_rx.try_recv().is_ok());

        tokio::time::timeout(std::time::Duration::from_secs(1), eviction.notified())
            .await
            .expect("stalled connection is told to disconnect");

        // 被驱逐后不再是投递目标
        assert!(stalled_rx.try_recv().is_ok());
        let delivered = broadcaster
            .send_to_users(&[alice, bob], None, status_event(bob))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(stalled_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binding_unknown_connection_fails() {
        let broadcaster = LocalEventBroadcaster::new();
        let result = broadcaster
            .bind_user(ConnectionId::new(), UserId::from(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(BroadcastError::UnknownConnection(_))));
    }
}
