mod conversation_service;
mod friendship_service;
mod message_service;
mod user_service;

pub use conversation_service::{
    ConversationService, ConversationServiceDependencies, ConversationSummary,
    CreateConversationRequest,
};
pub use friendship_service::{FriendshipService, FriendshipServiceDependencies};
pub use message_service::{MessageService, MessageServiceDependencies};
pub use user_service::{
    AuthenticateUserRequest, RegisterUserRequest, UserService, UserServiceDependencies,
    MAX_ID_ATTEMPTS,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use domain::{
        Conversation, ConversationId, ConversationType, Membership, PasswordHash, PhoneNumber,
        Timestamp, User, UserId, Username,
    };
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    use crate::clock::Clock;
    use crate::memory::MemoryStorage;
    use crate::password::{PasswordHasher, PasswordHasherError};
    use crate::repository::{ConversationRepository, UserRepository};

    pub struct FixedClock {
        now: Mutex<Timestamp>,
    }

    impl Default for FixedClock {
        fn default() -> Self {
            Self {
                now: Mutex::new(datetime!(2024-05-01 12:00 UTC)),
            }
        }
    }

    impl FixedClock {
        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            *self.now.lock().unwrap()
        }
    }

    pub struct PlainHasher;

    #[async_trait]
    impl PasswordHasher for PlainHasher {
        async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError> {
            PasswordHash::new(format!("plain:{plaintext}"))
                .map_err(|e| PasswordHasherError::hash_error(e.to_string()))
        }

        async fn verify(
            &self,
            plaintext: &str,
            hashed: &PasswordHash,
        ) -> Result<bool, PasswordHasherError> {
            Ok(hashed.as_str() == format!("plain:{plaintext}"))
        }
    }

    pub async fn seed_user(storage: &MemoryStorage, name: &str) -> User {
        let id = Uuid::new_v4();
        let phone = format!("{:010}", id.as_u128() % 10_000_000_000);
        let user = User::register(
            UserId::from(id),
            Username::parse(name).unwrap(),
            PhoneNumber::parse(phone).unwrap(),
            PasswordHash::new("plain:secret-pass").unwrap(),
            None,
            "#2196F3",
            datetime!(2024-05-01 11:00 UTC),
        );
        UserRepository::create(storage, user).await.unwrap()
    }

    pub async fn seed_conversation(storage: &MemoryStorage, members: &[UserId]) -> ConversationId {
        let id = ConversationId::from(Uuid::new_v4());
        let at = datetime!(2024-05-01 11:00 UTC);
        let conversation =
            Conversation::new(id, ConversationType::Group, None, members[0], at).unwrap();
        let memberships = members.iter().map(|m| Membership::new(id, *m, at)).collect();
        storage
            .create_with_members(conversation, memberships)
            .await
            .unwrap();
        id
    }
}
