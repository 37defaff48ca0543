use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

use application::{
    AuthenticateUserRequest, ConversationSummary, CreateConversationRequest,
    RegisterUserRequest,
};
use domain::{
    Conversation, ConversationId, ConversationType, FriendData, FriendSummary, Message,
    MessageId, User, UserId,
};

use crate::{
    auth::{AuthenticatedUser, LoginResponse},
    error::ApiError,
    state::AppState,
    ws_connection::WebSocketConnection,
};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload {
    #[validate(length(min = 1, max = 50))]
    username: String,
    #[validate(length(min = 1, max = 32))]
    phone: String,
    #[validate(length(min = 6, max = 128))]
    password: String,
    public_key: Option<String>,
    #[validate(length(max = 32))]
    icon_color: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    #[validate(length(min = 1))]
    username: String,
    #[validate(length(min = 1))]
    password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct FriendRequestPayload {
    #[validate(length(min = 1, max = 50))]
    recipient_username: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct FriendResponsePayload {
    #[validate(length(min = 1, max = 50))]
    sender_username: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateConversationPayload {
    #[validate(length(min = 1))]
    participants: Vec<Uuid>,
    #[serde(rename = "type")]
    kind: Option<ConversationType>,
    #[validate(length(max = 100))]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberPayload {
    user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateMessagePayload {
    #[validate(length(min = 1))]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(user_routes())
        .merge(conversation_routes())
        .merge(message_routes())
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/user/register", post(register_user))
        .route("/user/login", post(login_user))
        .route("/user/info/{username_or_id}", get(user_info))
        .route("/user/sendFriendRequest", post(send_friend_request))
        .route("/user/fetchFriendData", get(fetch_friend_data))
        .route("/user/rejectFriendRequest", delete(reject_friend_request))
        .route("/user/acceptFriendRequest", post(accept_friend_request))
        .route("/user/friends", get(list_friends))
}

fn conversation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversation/createNewConversation",
            post(create_conversation),
        )
        .route("/conversation/list", get(list_conversations))
        .route("/conversation/{conversation_id}/members", post(add_member))
        .route(
            "/conversation/{conversation_id}/members/{user_id}",
            delete(remove_member),
        )
        .route("/conversation/{conversation_id}/messages", get(list_messages))
}

fn message_routes() -> Router<AppState> {
    Router::new()
        .route("/message/unread", get(list_unread))
        .route(
            "/message/{message_id}",
            patch(update_message).delete(delete_message),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    payload.validate()?;
    let user = state
        .user_service
        .register(RegisterUserRequest {
            username: payload.username,
            phone: payload.phone,
            password: payload.password,
            public_key: payload.public_key,
            icon_color: payload.icon_color,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_user(
    State(state): State<AppState>,
    Json(payload): Json<LoginPayload>,
) -> Result<Json<LoginResponse>, ApiError> {
    payload
        .validate()
        .map_err(|_| ApiError::unauthorized("authentication failed"))?;
    let user = state
        .user_service
        .authenticate(AuthenticateUserRequest {
            username: payload.username,
            password: payload.password,
        })
        .await?;
    let token = state.jwt_service.generate_token(user.id)?;

    Ok(Json(LoginResponse { user, token }))
}

async fn user_info(
    State(state): State<AppState>,
    AuthenticatedUser(_): AuthenticatedUser,
    Path(username_or_id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user = state.user_service.get_user_info(&username_or_id).await?;
    Ok(Json(user))
}

async fn send_friend_request(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<FriendRequestPayload>,
) -> Result<StatusCode, ApiError> {
    payload.validate()?;
    state
        .friendship_service
        .send_friend_request(user_id, &payload.recipient_username)
        .await?;
    Ok(StatusCode::OK)
}

async fn fetch_friend_data(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<FriendData>, ApiError> {
    let data = state
        .friendship_service
        .get_user_friend_data(user_id)
        .await?;
    Ok(Json(data))
}

async fn reject_friend_request(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<FriendResponsePayload>,
) -> Result<StatusCode, ApiError> {
    payload.validate()?;
    state
        .friendship_service
        .reject_friend_request(user_id, &payload.sender_username)
        .await?;
    Ok(StatusCode::OK)
}

async fn accept_friend_request(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<FriendResponsePayload>,
) -> Result<StatusCode, ApiError> {
    payload.validate()?;
    state
        .friendship_service
        .accept_friend_request(user_id, &payload.sender_username)
        .await?;
    Ok(StatusCode::OK)
}

async fn list_friends(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<Vec<FriendSummary>>, ApiError> {
    let friends = state
        .friendship_service
        .get_all_current_user_friends(user_id)
        .await?;
    Ok(Json(friends))
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<CreateConversationPayload>,
) -> Result<Json<Conversation>, ApiError> {
    payload.validate()?;
    let participants: Vec<UserId> = payload.participants.into_iter().map(UserId::from).collect();
    // 未指定类型时，单个对方为私聊，否则为群聊
    let kind = payload.kind.unwrap_or(if participants.len() == 1 {
        ConversationType::Direct
    } else {
        ConversationType::Group
    });

    let conversation = state
        .conversation_service
        .create_conversation(CreateConversationRequest {
            creator_id: user_id,
            participants,
            kind,
            title: payload.title,
        })
        .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let items = state
        .conversation_service
        .list_conversations_for_user(user_id)
        .await?;
    Ok(Json(items))
}

async fn add_member(
    State(state): State<AppState>,
    AuthenticatedUser(actor_id): AuthenticatedUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<AddMemberPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .conversation_service
        .add_member(
            actor_id,
            ConversationId::from(conversation_id),
            UserId::from(payload.user_id),
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn remove_member(
    State(state): State<AppState>,
    AuthenticatedUser(actor_id): AuthenticatedUser,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .conversation_service
        .remove_member(
            actor_id,
            ConversationId::from(conversation_id),
            UserId::from(user_id),
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn list_messages(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .message_service
        .list_messages(user_id, ConversationId::from(conversation_id))
        .await?;
    Ok(Json(messages))
}

async fn list_unread(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.message_service.list_unread(user_id).await?;
    Ok(Json(messages))
}

async fn update_message(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<UpdateMessagePayload>,
) -> Result<Json<Message>, ApiError> {
    payload.validate()?;
    let message = state
        .message_service
        .update_message(user_id, MessageId::from(message_id), payload.text)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .message_service
        .delete_message(user_id, MessageId::from(message_id))
        .await?;
    Ok(StatusCode::OK)
}

/// 令牌来自 `?token=` 或 `Authorization` 头，握手前验证
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = match query.token.as_deref() {
        Some(token) => state.jwt_service.verify_token(token)?,
        None => state.jwt_service.extract_user_from_headers(&headers)?,
    };

    let connection = WebSocketConnection::new(state, user_id);
    Ok(ws.on_upgrade(move |socket| connection.run(socket)))
}
