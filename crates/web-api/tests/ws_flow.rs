mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};

use support::{spawn_app, LoggedIn, TestApp};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(app: &TestApp, user: &LoggedIn) -> Socket {
    let url = format!("{}/ws?token={}", app.base_ws, user.token);
    let (socket, _) = connect_async(url).await.expect("websocket connect");
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("event within timeout")
            .expect("stream open")
            .expect("frame");
        if let TungsteniteMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("event json");
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let result = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

async fn identify(socket: &mut Socket, user: &LoggedIn) {
    send(
        socket,
        json!({ "event": "userConnected", "data": { "userId": user.id } }),
    )
    .await;
}

async fn direct_conversation(app: &TestApp, creator: &LoggedIn, other: &LoggedIn) -> String {
    let body: Value = app
        .client
        .post(app.url("/conversation/createNewConversation"))
        .bearer_auth(&creator.token)
        .json(&json!({ "participants": [other.id] }))
        .send()
        .await
        .expect("create conversation")
        .json()
        .await
        .expect("conversation json");
    assert_eq!(body["type"], "direct");
    body["id"].as_str().expect("conversation id").to_string()
}

#[tokio::test]
async fn upgrade_without_token_is_rejected() {
    let app = spawn_app().await;
    let result = connect_async(format!("{}/ws", app.base_ws)).await;
    assert!(result.is_err());

    let result = connect_async(format!("{}/ws?token=garbage", app.base_ws)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn message_typing_and_read_flow() {
    let app = spawn_app().await;
    let alice = app.signup("alice", "5550000001").await;
    let bob = app.signup("bob", "5550000002").await;
    let conversation_id = direct_conversation(&app, &alice, &bob).await;

    let mut alice_ws = connect(&app, &alice).await;
    identify(&mut alice_ws, &alice).await;
    // 确认 alice 已完成身份声明
    send(
        &mut alice_ws,
        json!({ "event": "typing", "data": { "conversationId": conversation_id, "userId": alice.id } }),
    )
    .await;
    assert_silent(&mut alice_ws).await;

    let mut bob_ws = connect(&app, &bob).await;
    identify(&mut bob_ws, &bob).await;

    let status = next_event(&mut alice_ws).await;
    assert_eq!(status["event"], "userStatusChanged");
    assert_eq!(status["data"]["userId"], bob.id.as_str());
    assert_eq!(status["data"]["onlineStatus"], true);

    send(
        &mut alice_ws,
        json!({
            "event": "sendMessage",
            "data": { "userId": alice.id, "conversationId": conversation_id, "text": "hello bob" }
        }),
    )
    .await;

    let to_alice = next_event(&mut alice_ws).await;
    let to_bob = next_event(&mut bob_ws).await;
    for event in [&to_alice, &to_bob] {
        assert_eq!(event["event"], "newMessage");
        assert_eq!(event["data"]["message"]["text"], "hello bob");
    }
    assert_eq!(to_alice["data"]["message"]["id"], to_bob["data"]["message"]["id"]);
    assert_eq!(
        to_alice["data"]["message"]["sentAt"],
        to_bob["data"]["message"]["sentAt"]
    );
    let message_id = to_bob["data"]["message"]["id"].as_str().unwrap().to_string();

    send(
        &mut bob_ws,
        json!({ "event": "typing", "data": { "conversationId": conversation_id, "userId": bob.id } }),
    )
    .await;
    let typing = next_event(&mut alice_ws).await;
    assert_eq!(typing["event"], "userTyping");
    assert_eq!(typing["data"]["userId"], bob.id.as_str());

    let unread: Value = app
        .client
        .get(app.url("/message/unread"))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unread.as_array().unwrap().len(), 1);

    let read_frame = json!({
        "event": "messageRead",
        "data": { "userId": bob.id, "messageId": message_id, "conversationId": conversation_id }
    });
    send(&mut bob_ws, read_frame.clone()).await;
    let read = next_event(&mut alice_ws).await;
    assert_eq!(read["event"], "messageRead");
    assert_eq!(read["data"]["messageId"], message_id.as_str());
    assert!(read["data"]["readAt"].is_string());

    // 重复已读不再转发
    send(&mut bob_ws, read_frame).await;
    assert_silent(&mut alice_ws).await;

    let unread: Value = app
        .client
        .get(app.url("/message/unread"))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(unread.as_array().unwrap().is_empty());

    let history: Value = app
        .client
        .get(app.url(&format!("/conversation/{conversation_id}/messages")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);

    bob_ws.close(None).await.expect("close");
    let status = next_event(&mut alice_ws).await;
    assert_eq!(status["event"], "userStatusChanged");
    assert_eq!(status["data"]["onlineStatus"], false);
}

#[tokio::test]
async fn protocol_errors_keep_connection_open() {
    let app = spawn_app().await;
    let alice = app.signup("alice", "5550000001").await;
    let bob = app.signup("bob", "5550000002").await;
    let conversation_id = direct_conversation(&app, &alice, &bob).await;

    let mut socket = connect(&app, &alice).await;

    // 未声明身份前发送消息
    send(
        &mut socket,
        json!({
            "event": "sendMessage",
            "data": { "userId": alice.id, "conversationId": conversation_id, "text": "too early" }
        }),
    )
    .await;
    let error = next_event(&mut socket).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["code"], "UNAUTHORIZED");

    // 声明别人的身份
    identify(&mut socket, &bob).await;
    let error = next_event(&mut socket).await;
    assert_eq!(error["data"]["code"], "UNAUTHORIZED");

    socket
        .send(TungsteniteMessage::Text("{not json".into()))
        .await
        .unwrap();
    let error = next_event(&mut socket).await;
    assert_eq!(error["data"]["code"], "INVALID_ARGUMENT");

    identify(&mut socket, &alice).await;
    send(
        &mut socket,
        json!({
            "event": "sendMessage",
            "data": { "userId": alice.id, "conversationId": conversation_id, "text": "now it works" }
        }),
    )
    .await;
    let delivered = next_event(&mut socket).await;
    assert_eq!(delivered["event"], "newMessage");
    assert_eq!(delivered["data"]["message"]["text"], "now it works");
}
