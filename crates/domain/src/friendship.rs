//! 好友关系
//!
//! 好友关系用有向边表示：
//! - 待处理的请求只有一条边，归属于接收方（owner = 接收方，target = 发送方）；
//! - 已接受的好友关系有两条边，双方各持有一条。
//!
//! 接受请求时两条边必须同时落库，由 [`FriendshipPromotion`] 作为唯一的事务边界。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{PublicKey, Timestamp, UserId, Username};

/// 在线判定窗口（分钟）
pub const DEFAULT_ONLINE_WINDOW_MINUTES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    Pending,
    Accepted,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendStatus::Pending => "pending",
            FriendStatus::Accepted => "accepted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(FriendStatus::Pending),
            "accepted" => Ok(FriendStatus::Accepted),
            other => Err(DomainError::invalid_argument(
                "friend_status",
                format!("unknown status `{other}`"),
            )),
        }
    }
}

impl fmt::Display for FriendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条有向好友边
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEdge {
    pub owner_id: UserId,
    pub target_id: UserId,
    pub status: FriendStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl FriendEdge {
    /// 由发送方发起的好友请求，边归属于接收方
    pub fn request(sender: UserId, recipient: UserId, now: Timestamp) -> Result<Self, DomainError> {
        if sender == recipient {
            return Err(DomainError::SelfFriendRequest);
        }
        Ok(Self {
            owner_id: recipient,
            target_id: sender,
            status: FriendStatus::Pending,
            created_at: now,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == FriendStatus::Pending
    }

    /// 接受请求：本边升级为 accepted，同时生成发送方持有的反向边
    pub fn accept(self, now: Timestamp) -> Result<FriendshipPromotion, DomainError> {
        if !self.is_pending() {
            return Err(DomainError::FriendRequestNotFound);
        }
        let sender_edge = FriendEdge {
            owner_id: self.target_id,
            target_id: self.owner_id,
            status: FriendStatus::Accepted,
            created_at: now,
        };
        let recipient_edge = FriendEdge {
            status: FriendStatus::Accepted,
            ..self
        };
        Ok(FriendshipPromotion {
            recipient_edge,
            sender_edge,
        })
    }
}

/// 好友请求升级为双向好友关系，两条边必须在同一事务中写入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendshipPromotion {
    pub recipient_edge: FriendEdge,
    pub sender_edge: FriendEdge,
}

impl FriendshipPromotion {
    pub fn recipient(&self) -> UserId {
        self.recipient_edge.owner_id
    }

    pub fn sender(&self) -> UserId {
        self.sender_edge.owner_id
    }
}

/// 好友列表中展示的对方信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    pub id: UserId,
    pub username: Username,
    pub icon_color: String,
    pub public_key: Option<PublicKey>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_online: Option<Timestamp>,
}

/// 仓储返回的一条边及其对端用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendView {
    pub status: FriendStatus,
    pub friend: FriendSummary,
}

/// 好友三分类视图
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendData {
    pub friend_requests: Vec<FriendSummary>,
    pub online_friends: Vec<FriendSummary>,
    pub offline_friends: Vec<FriendSummary>,
}

impl FriendData {
    /// 按状态和最后在线时间分桶，每个桶按用户名（忽略大小写）升序。
    ///
    /// 距离最后在线不超过 `window_minutes` 分钟视为在线；
    /// 从未记录过在线时间的好友归为离线。
    pub fn classify(views: Vec<FriendView>, now: Timestamp, window_minutes: u32) -> Self {
        let mut data = FriendData::default();
        for view in views {
            match view.status {
                FriendStatus::Pending => data.friend_requests.push(view.friend),
                FriendStatus::Accepted => {
                    if is_recently_seen(view.friend.last_online, now, window_minutes) {
                        data.online_friends.push(view.friend);
                    } else {
                        data.offline_friends.push(view.friend);
                    }
                }
            }
        }

        sort_by_username(&mut data.friend_requests);
        sort_by_username(&mut data.online_friends);
        sort_by_username(&mut data.offline_friends);
        data
    }
}

fn is_recently_seen(last_online: Option<Timestamp>, now: Timestamp, window_minutes: u32) -> bool {
    match last_online {
        Some(seen) => {
            let elapsed_ms = (now - seen).whole_milliseconds().unsigned_abs();
            let minutes = elapsed_ms as f64 / 60_000.0;
            minutes <= f64::from(window_minutes)
        }
        None => false,
    }
}

pub fn sort_by_username(friends: &mut [FriendSummary]) {
    friends.sort_by_cached_key(|friend| friend.username.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    fn friend(name: &str, last_online: Option<Timestamp>) -> FriendSummary {
        FriendSummary {
            id: UserId::from(Uuid::new_v4()),
            username: Username::parse(name).unwrap(),
            icon_color: "#000000".to_owned(),
            public_key: None,
            last_online,
        }
    }

    fn view(status: FriendStatus, friend: FriendSummary) -> FriendView {
        FriendView { status, friend }
    }

    fn names(friends: &[FriendSummary]) -> Vec<&str> {
        friends.iter().map(|f| f.username.as_str()).collect()
    }

    #[test]
    fn four_minutes_is_online_six_minutes_is_offline() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let views = vec![
            view(FriendStatus::Accepted, friend("recent", Some(now - Duration::minutes(4)))),
            view(FriendStatus::Accepted, friend("stale", Some(now - Duration::minutes(6)))),
        ];

        let data = FriendData::classify(views, now, DEFAULT_ONLINE_WINDOW_MINUTES);
        assert_eq!(names(&data.online_friends), vec!["recent"]);
        assert_eq!(names(&data.offline_friends), vec!["stale"]);
        assert!(data.friend_requests.is_empty());
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let views = vec![view(
            FriendStatus::Accepted,
            friend("edge", Some(now - Duration::minutes(5))),
        )];
        let data = FriendData::classify(views, now, 5);
        assert_eq!(names(&data.online_friends), vec!["edge"]);
    }

    #[test]
    fn buckets_sort_case_insensitively() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let seen = Some(now - Duration::minutes(1));
        let views = vec![
            view(FriendStatus::Accepted, friend("Zed", seen)),
            view(FriendStatus::Accepted, friend("Ann", seen)),
            view(FriendStatus::Accepted, friend("bob", seen)),
            view(FriendStatus::Pending, friend("zoe", None)),
            view(FriendStatus::Pending, friend("Carl", None)),
        ];

        let data = FriendData::classify(views, now, 5);
        assert_eq!(names(&data.online_friends), vec!["Ann", "bob", "Zed"]);
        assert_eq!(names(&data.friend_requests), vec!["Carl", "zoe"]);
    }

    #[test]
    fn never_seen_friend_is_offline() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let data = FriendData::classify(
            vec![view(FriendStatus::Accepted, friend("ghost", None))],
            now,
            5,
        );
        assert!(data.online_friends.is_empty());
        assert_eq!(names(&data.offline_friends), vec!["ghost"]);
    }

    #[test]
    fn future_last_online_uses_absolute_distance() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let data = FriendData::classify(
            vec![view(
                FriendStatus::Accepted,
                friend("skewed", Some(now + Duration::minutes(2))),
            )],
            now,
            5,
        );
        assert_eq!(names(&data.online_friends), vec!["skewed"]);
    }

    #[test]
    fn request_is_owned_by_recipient() {
        let sender = UserId::from(Uuid::new_v4());
        let recipient = UserId::from(Uuid::new_v4());
        let edge = FriendEdge::request(sender, recipient, datetime!(2024-05-01 12:00 UTC)).unwrap();

        assert_eq!(edge.owner_id, recipient);
        assert_eq!(edge.target_id, sender);
        assert!(edge.is_pending());
    }

    #[test]
    fn request_to_self_is_rejected() {
        let me = UserId::from(Uuid::new_v4());
        let result = FriendEdge::request(me, me, datetime!(2024-05-01 12:00 UTC));
        assert_eq!(result, Err(DomainError::SelfFriendRequest));
    }

    #[test]
    fn accept_builds_symmetric_pair() {
        let sender = UserId::from(Uuid::new_v4());
        let recipient = UserId::from(Uuid::new_v4());
        let now = datetime!(2024-05-01 12:00 UTC);
        let edge = FriendEdge::request(sender, recipient, now).unwrap();

        let promotion = edge.accept(now).unwrap();
        assert_eq!(promotion.recipient(), recipient);
        assert_eq!(promotion.sender(), sender);
        assert_eq!(promotion.recipient_edge.status, FriendStatus::Accepted);
        assert_eq!(promotion.sender_edge.target_id, recipient);
        assert_eq!(promotion.sender_edge.status, FriendStatus::Accepted);
    }

    #[test]
    fn accepting_an_accepted_edge_fails() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let edge = FriendEdge {
            owner_id: UserId::from(Uuid::new_v4()),
            target_id: UserId::from(Uuid::new_v4()),
            status: FriendStatus::Accepted,
            created_at: now,
        };
        assert_eq!(edge.accept(now), Err(DomainError::FriendRequestNotFound));
    }
}
