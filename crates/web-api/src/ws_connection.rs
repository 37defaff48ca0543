use application::{ClientEvent, Gateway, GatewaySession, ServerEvent};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::UserId;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;

use crate::state::AppState;

/// 读取任务交给处理任务的输入
#[derive(Debug)]
enum Inbound {
    Event(ClientEvent),
    Heartbeat,
}

/// WebSocket 连接管理器
///
/// 每条连接三个任务：
/// - 读取：socket → 有界入站队列
/// - 处理：按到达顺序逐个交给网关
/// - 写入：有界出站队列 → socket
///
/// 任意一端结束、或出站队列写满被驱逐后，取消其余任务并通过网关关闭会话。
pub struct WebSocketConnection {
    state: AppState,
    user_id: UserId,
}

impl WebSocketConnection {
    pub fn new(state: AppState, user_id: UserId) -> Self {
        Self { state, user_id }
    }

    pub async fn run(self, socket: WebSocket) {
        let gateway = self.state.gateway.clone();
        let capacities = &self.state.gateway_config;

        let (outbound_tx, outbound_rx) =
            mpsc::channel::<ServerEvent>(capacities.outbound_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(capacities.inbound_queue_capacity);

        let mut session = gateway.open(self.user_id, outbound_tx.clone()).await;
        let connection_id = session.connection_id();
        let eviction = session.eviction();
        tracing::info!(connection_id = %connection_id, user_id = %self.user_id, "WebSocket 连接已建立");

        let (sink, stream) = socket.split();
        let mut reader = tokio::spawn(read_frames(stream, inbound_tx, outbound_tx.clone()));
        let mut writer = tokio::spawn(write_frames(sink, outbound_rx));

        // 读取任务结束会关闭入站队列，处理循环排空后自然退出
        tokio::select! {
            _ = process_events(&gateway, &mut session, inbound_rx, outbound_tx) => {
                tracing::debug!(connection_id = %connection_id, "处理任务结束");
            }
            _ = &mut writer => {
                tracing::debug!(connection_id = %connection_id, "写入任务结束");
            }
            _ = eviction.notified() => {
                tracing::warn!(connection_id = %connection_id, user_id = %self.user_id, "客户端读取过慢，连接被驱逐");
            }
        }

        reader.abort();
        if let Err(err) = gateway.close(&mut session).await {
            tracing::error!(
                error = %err,
                connection_id = %connection_id,
                user_id = %self.user_id,
                "关闭会话失败"
            );
        }
        writer.abort();
        // 等待读取任务完成取消
        let _ = (&mut reader).await;

        tracing::info!(connection_id = %connection_id, user_id = %self.user_id, "WebSocket 连接已断开");
    }
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Sender<ServerEvent>,
) {
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "读取 WebSocket 帧失败");
                break;
            }
        };

        let item = match message {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => Inbound::Event(event),
                Err(err) => {
                    tracing::debug!(error = %err, "无法解析的客户端事件");
                    let reply = ServerEvent::error("INVALID_ARGUMENT", "malformed event frame");
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            // pong 由底层自动回复
            WsMessage::Ping(_) => Inbound::Heartbeat,
            WsMessage::Pong(_) => continue,
            WsMessage::Binary(_) => {
                let reply = ServerEvent::error("INVALID_ARGUMENT", "binary frames are not supported");
                if outbound.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
            WsMessage::Close(_) => {
                tracing::debug!("收到关闭帧");
                break;
            }
        };

        if inbound.send(item).await.is_err() {
            break;
        }
    }
}

async fn process_events(
    gateway: &Gateway,
    session: &mut GatewaySession,
    mut inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<ServerEvent>,
) {
    while let Some(item) = inbound.recv().await {
        let result = match item {
            Inbound::Event(event) => {
                let name = event.name();
                gateway.handle(session, event).await.map_err(|err| (name, err))
            }
            Inbound::Heartbeat => gateway
                .heartbeat(session)
                .await
                .map_err(|err| ("heartbeat", err)),
        };

        if let Err((name, err)) = result {
            tracing::warn!(
                connection_id = %session.connection_id(),
                event = name,
                error = %err,
                "事件处理失败"
            );
            if outbound.send(ServerEvent::from_error(&err)).await.is_err() {
                break;
            }
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = outbound.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize websocket payload");
                continue;
            }
        };
        if sink.send(WsMessage::Text(payload.into())).await.is_err() {
            tracing::debug!("写入 WebSocket 失败");
            break;
        }
    }
    let _ = sink.close().await;
}
