use std::sync::Arc;

use application::{ConversationService, FriendshipService, Gateway, MessageService, UserService};
use config::GatewayConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub user_service: Arc<UserService>,
    pub friendship_service: Arc<FriendshipService>,
    pub conversation_service: Arc<ConversationService>,
    pub message_service: Arc<MessageService>,
    pub gateway: Arc<Gateway>,
    pub jwt_service: Arc<JwtService>,
    pub gateway_config: GatewayConfig,
}
