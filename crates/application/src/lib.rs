//! 应用层实现。
//!
//! 这里提供围绕领域模型的用例服务与实时网关，处理输入校验、成员权限、
//! 以及对外部适配器（例如密码哈希、在线状态、事件广播）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod events;
pub mod gateway;
pub mod local_broadcast;
pub mod memory;
pub mod password;
pub mod presence;
pub mod repository;
pub mod services;

pub use broadcaster::{BroadcastError, ConnectionId, EventBroadcaster, Eviction};
pub use clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
pub use error::ApplicationError;
pub use events::{ClientEvent, ServerEvent};
pub use gateway::{Gateway, GatewayDependencies, GatewaySession, SessionState};
pub use local_broadcast::LocalEventBroadcaster;
pub use memory::MemoryStorage;
pub use password::{PasswordHasher, PasswordHasherError};
pub use presence::{memory::MemoryPresenceManager, PresenceManager, RedisPresenceManager};
pub use repository::{
    ConversationRepository, FriendRepository, MessageRepository, UserRepository,
};
pub use services::{
    AuthenticateUserRequest, ConversationService, ConversationServiceDependencies,
    ConversationSummary, CreateConversationRequest, FriendshipService,
    FriendshipServiceDependencies, MessageService, MessageServiceDependencies,
    RegisterUserRequest, UserService, UserServiceDependencies,
};
