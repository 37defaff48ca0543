use std::sync::Arc;

use domain::{
    friendship::sort_by_username, DomainError, FriendData, FriendEdge, FriendStatus,
    FriendSummary, RepositoryError, User, UserId, Username,
};

use crate::{
    clock::Clock,
    error::ApplicationError,
    repository::{FriendRepository, UserRepository},
};

pub struct FriendshipServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub friend_repository: Arc<dyn FriendRepository>,
    pub clock: Arc<dyn Clock>,
    pub online_window_minutes: u32,
}

pub struct FriendshipService {
    deps: FriendshipServiceDependencies,
}

impl FriendshipService {
    pub fn new(deps: FriendshipServiceDependencies) -> Self {
        Self { deps }
    }

    async fn user_by_name(&self, username: &str) -> Result<User, ApplicationError> {
        let username = Username::parse(username)?;
        self.deps
            .user_repository
            .find_by_username(&username)
            .await?
            .ok_or_else(|| DomainError::UserNotFound.into())
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        match self.deps.user_repository.find_by_id(user_id).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::UserNotFound.into()),
        }
    }

    /// 插入一条归属于接收方的 pending 边
    pub async fn send_friend_request(
        &self,
        sender_id: UserId,
        recipient_username: &str,
    ) -> Result<(), ApplicationError> {
        let recipient = self.user_by_name(recipient_username).await?;
        if recipient.id == sender_id {
            return Err(DomainError::SelfFriendRequest.into());
        }
        self.ensure_user(sender_id).await?;

        let friends = &self.deps.friend_repository;
        if friends.find_edge(recipient.id, sender_id).await?.is_some() {
            return Err(DomainError::DuplicateEdge.into());
        }
        // 已经是好友
        if let Some(edge) = friends.find_edge(sender_id, recipient.id).await? {
            if edge.status == FriendStatus::Accepted {
                return Err(DomainError::DuplicateEdge.into());
            }
        }

        let edge = FriendEdge::request(sender_id, recipient.id, self.deps.clock.now())?;
        friends.insert_pending(edge).await.map_err(|err| match err {
            RepositoryError::Conflict => ApplicationError::from(DomainError::DuplicateEdge),
            other => other.into(),
        })?;

        tracing::info!(sender_id = %sender_id, recipient_id = %recipient.id, "好友请求已发送");
        Ok(())
    }

    /// 删除接收方持有的 pending 边；请求不存在时视为成功
    pub async fn reject_friend_request(
        &self,
        recipient_id: UserId,
        sender_username: &str,
    ) -> Result<(), ApplicationError> {
        let sender = self.user_by_name(sender_username).await?;
        let friends = &self.deps.friend_repository;

        match friends.find_edge(recipient_id, sender.id).await? {
            Some(edge) if edge.is_pending() => {
                friends.delete_edge(recipient_id, sender.id).await?;
                tracing::info!(recipient_id = %recipient_id, sender_id = %sender.id, "好友请求已拒绝");
            }
            _ => {
                tracing::debug!(recipient_id = %recipient_id, sender_id = %sender.id, "没有待处理的好友请求");
            }
        }
        Ok(())
    }

    /// 原子地把 pending 边升级为双向 accepted
    pub async fn accept_friend_request(
        &self,
        recipient_id: UserId,
        sender_username: &str,
    ) -> Result<(), ApplicationError> {
        let sender = self.user_by_name(sender_username).await?;
        let edge = self
            .deps
            .friend_repository
            .find_edge(recipient_id, sender.id)
            .await?
            .ok_or(DomainError::FriendRequestNotFound)?;

        if edge.status == FriendStatus::Accepted {
            return Ok(());
        }

        let promotion = edge.accept(self.deps.clock.now())?;
        match self.deps.friend_repository.promote(&promotion).await {
            Ok(()) => {}
            Err(RepositoryError::NotFound) => {
                // pending 边已不在：可能是并发的另一次接受抢先完成了升级
                let current = self
                    .deps
                    .friend_repository
                    .find_edge(recipient_id, sender.id)
                    .await?;
                if current.is_some_and(|edge| edge.status == FriendStatus::Accepted) {
                    tracing::debug!(
                        recipient_id = %recipient_id,
                        sender_id = %sender.id,
                        "好友请求已被并发接受"
                    );
                    return Ok(());
                }
                return Err(DomainError::FriendRequestNotFound.into());
            }
            Err(other) => {
                tracing::error!(
                    recipient_id = %recipient_id,
                    sender_id = %sender.id,
                    error = %other,
                    "好友关系升级失败，已回滚"
                );
                return Err(other.into());
            }
        }

        tracing::info!(recipient_id = %recipient_id, sender_id = %sender.id, "好友请求已接受");
        Ok(())
    }

    pub async fn get_user_friend_data(
        &self,
        user_id: UserId,
    ) -> Result<FriendData, ApplicationError> {
        let views = self.deps.friend_repository.list_edges(user_id).await?;
        Ok(FriendData::classify(
            views,
            self.deps.clock.now(),
            self.deps.online_window_minutes,
        ))
    }

    pub async fn get_all_current_user_friends(
        &self,
        user_id: UserId,
    ) -> Result<Vec<FriendSummary>, ApplicationError> {
        let mut friends: Vec<FriendSummary> = self
            .deps
            .friend_repository
            .list_edges(user_id)
            .await?
            .into_iter()
            .filter(|view| view.status == FriendStatus::Accepted)
            .map(|view| view.friend)
            .collect();
        sort_by_username(&mut friends);
        Ok(friends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::services::test_support::{seed_user, FixedClock};
    use time::Duration;

    struct Fixture {
        service: FriendshipService,
        storage: Arc<MemoryStorage>,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(FixedClock::default());
        let service = FriendshipService::new(FriendshipServiceDependencies {
            user_repository: storage.clone(),
            friend_repository: storage.clone(),
            clock: clock.clone(),
            online_window_minutes: 5,
        });
        Fixture {
            service,
            storage,
            clock,
        }
    }

    #[tokio::test]
    async fn pending_request_shows_only_for_recipient() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;

        f.service.send_friend_request(alice.id, "bob").await.unwrap();

        let bob_data = f.service.get_user_friend_data(bob.id).await.unwrap();
        assert_eq!(bob_data.friend_requests.len(), 1);
        assert_eq!(bob_data.friend_requests[0].id, alice.id);
        assert!(bob_data.online_friends.is_empty());
        assert!(bob_data.offline_friends.is_empty());

        let alice_data = f.service.get_user_friend_data(alice.id).await.unwrap();
        assert_eq!(alice_data, FriendData::default());
    }

    #[tokio::test]
    async fn duplicate_and_self_requests_are_rejected() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        seed_user(&f.storage, "bob").await;

        f.service.send_friend_request(alice.id, "bob").await.unwrap();
        let err = f
            .service
            .send_friend_request(alice.id, "bob")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::DuplicateEdge));

        let err = f
            .service
            .send_friend_request(alice.id, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::SelfFriendRequest));

        let err = f
            .service
            .send_friend_request(alice.id, "nobody")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::UserNotFound));
    }

    #[tokio::test]
    async fn accept_makes_friendship_symmetric() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;

        f.service.send_friend_request(alice.id, "bob").await.unwrap();
        f.service.accept_friend_request(bob.id, "alice").await.unwrap();

        let alice_friends = f.service.get_all_current_user_friends(alice.id).await.unwrap();
        let bob_friends = f.service.get_all_current_user_friends(bob.id).await.unwrap();
        assert_eq!(alice_friends.iter().map(|u| u.id).collect::<Vec<_>>(), vec![bob.id]);
        assert_eq!(bob_friends.iter().map(|u| u.id).collect::<Vec<_>>(), vec![alice.id]);

        // 再次接受是空操作，再次请求则重复
        f.service.accept_friend_request(bob.id, "alice").await.unwrap();
        let err = f
            .service
            .send_friend_request(alice.id, "bob")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::DuplicateEdge));
    }

    #[tokio::test]
    async fn failed_accept_rolls_back_both_edges() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;
        f.service.send_friend_request(alice.id, "bob").await.unwrap();

        f.storage.fail_next_promotion();
        let err = f.service.accept_friend_request(bob.id, "alice").await;
        assert!(matches!(err, Err(ApplicationError::Repository(_))));

        assert_eq!(f.storage.edge_count(FriendStatus::Accepted).await, 0);
        let data = f.service.get_user_friend_data(bob.id).await.unwrap();
        assert_eq!(data.friend_requests.len(), 1);
    }

    #[tokio::test]
    async fn crossed_requests_are_upgraded_on_accept() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;

        f.service.send_friend_request(alice.id, "bob").await.unwrap();
        f.service.send_friend_request(bob.id, "alice").await.unwrap();
        f.service.accept_friend_request(bob.id, "alice").await.unwrap();

        assert_eq!(f.storage.edge_count(FriendStatus::Accepted).await, 2);
        assert_eq!(f.storage.edge_count(FriendStatus::Pending).await, 0);
    }

    /// 在本次升级之前先让另一次接受完成，模拟两个接受请求竞争
    struct ConcurrentAccept(Arc<MemoryStorage>);

    #[async_trait::async_trait]
    impl FriendRepository for ConcurrentAccept {
        async fn find_edge(
            &self,
            owner: UserId,
            target: UserId,
        ) -> Result<Option<FriendEdge>, RepositoryError> {
            self.0.find_edge(owner, target).await
        }

        async fn insert_pending(&self, edge: FriendEdge) -> Result<(), RepositoryError> {
            self.0.insert_pending(edge).await
        }

        async fn delete_edge(
            &self,
            owner: UserId,
            target: UserId,
        ) -> Result<bool, RepositoryError> {
            self.0.delete_edge(owner, target).await
        }

        async fn promote(
            &self,
            promotion: &domain::FriendshipPromotion,
        ) -> Result<(), RepositoryError> {
            self.0.promote(promotion).await?;
            self.0.promote(promotion).await
        }

        async fn list_edges(
            &self,
            owner: UserId,
        ) -> Result<Vec<domain::FriendView>, RepositoryError> {
            self.0.list_edges(owner).await
        }
    }

    #[tokio::test]
    async fn losing_a_concurrent_accept_still_succeeds() {
        let storage = Arc::new(MemoryStorage::new());
        let service = FriendshipService::new(FriendshipServiceDependencies {
            user_repository: storage.clone(),
            friend_repository: Arc::new(ConcurrentAccept(storage.clone())),
            clock: Arc::new(FixedClock::default()),
            online_window_minutes: 5,
        });
        let alice = seed_user(&storage, "alice").await;
        let bob = seed_user(&storage, "bob").await;

        service.send_friend_request(alice.id, "bob").await.unwrap();
        service.accept_friend_request(bob.id, "alice").await.unwrap();

        assert_eq!(storage.edge_count(FriendStatus::Accepted).await, 2);
        assert_eq!(storage.edge_count(FriendStatus::Pending).await, 0);
    }

    #[tokio::test]
    async fn accept_without_request_is_not_found() {
        let f = fixture();
        seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;

        let err = f
            .service
            .accept_friend_request(bob.id, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::FriendRequestNotFound));
    }

    #[tokio::test]
    async fn reject_missing_request_succeeds_but_unknown_sender_fails() {
        let f = fixture();
        let alice = seed_user(&f.storage, "alice").await;
        let bob = seed_user(&f.storage, "bob").await;

        f.service.reject_friend_request(bob.id, "alice").await.unwrap();

        let err = f
            .service
            .reject_friend_request(bob.id, "ghost")
            .await
            .unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::UserNotFound));

        f.service.send_friend_request(alice.id, "bob").await.unwrap();
        f.service.reject_friend_request(bob.id, "alice").await.unwrap();
        assert_eq!(f.storage.edge_count(FriendStatus::Pending).await, 0);
    }

    #[tokio::test]
    async fn friends_split_by_last_seen_window() {
        let f = fixture();
        let me = seed_user(&f.storage, "me").await;
        let zed = seed_user(&f.storage, "Zed").await;
        let ann = seed_user(&f.storage, "Ann").await;
        let old = seed_user(&f.storage, "old").await;

        for friend in ["Zed", "Ann", "old"] {
            f.service.send_friend_request(me.id, friend).await.unwrap();
        }
        f.service.accept_friend_request(zed.id, "me").await.unwrap();
        f.service.accept_friend_request(ann.id, "me").await.unwrap();
        f.service.accept_friend_request(old.id, "me").await.unwrap();

        let now = f.clock.now();
        f.storage
            .touch_last_seen(zed.id, now - Duration::minutes(4))
            .await
            .unwrap();
        f.storage
            .touch_last_seen(ann.id, now - Duration::minutes(4))
            .await
            .unwrap();
        f.storage
            .touch_last_seen(old.id, now - Duration::minutes(6))
            .await
            .unwrap();

        let data = f.service.get_user_friend_data(me.id).await.unwrap();
        let online: Vec<_> = data.online_friends.iter().map(|u| u.username.as_str()).collect();
        let offline: Vec<_> = data.offline_friends.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(online, vec!["Ann", "Zed"]);
        assert_eq!(offline, vec!["old"]);
    }
}
