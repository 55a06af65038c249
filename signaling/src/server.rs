use anyhow::{bail, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use core_types::ClientMessage;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::relay::Relay;

/// サーバー設定
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// 指定されていればクライアントの静的ファイルを `/` で配信する
    pub static_dir: Option<PathBuf>,
    /// 接続ごとの送信キューの長さ
    pub outbound_buffer: usize,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            static_dir: None,
            outbound_buffer: 100,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.outbound_buffer == 0 {
            bail!("outbound_buffer must be greater than 0");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    max_message_size: usize,
}

/// ルーティングを構築する
pub fn router(relay: Arc<Relay>, config: &ServerConfig) -> Router {
    let state = AppState {
        relay,
        max_message_size: config.max_message_size,
    };

    let mut router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        info!("Serving static files from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(TraceLayer::new_for_http())
}

/// シグナリングサーバー（WebSocketサーバー）
pub struct SignalingServer {
    listener: TcpListener,
    router: Router,
    relay: Arc<Relay>,
}

impl SignalingServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?;
        let relay = Arc::new(Relay::new(config.outbound_buffer));
        let router = router(relay.clone(), &config);

        Ok(Self {
            listener,
            router,
            relay,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// `shutdown` が完了するまで接続を受け付ける
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!("SignalingServer listening on {}", addr);

        // アップグレード済みのWebSocketはserveの管理外なので停止時にまとめて閉じる
        let relay = self.relay.clone();
        let shutdown = async move {
            shutdown.await;
            relay.close_all().await;
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("SignalingServer terminated with error")?;

        info!("SignalingServer stopped");
        Ok(())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (connection_id, mut outbound_rx) = relay.connect().await;
    info!("WebSocket connected: {}", connection_id);

    let (mut write, mut read) = socket.split();

    // Relayからの送信キューをWebSocketに書き出すタスク
    let write_id = connection_id.clone();
    let mut write_handle = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message for {}: {}", write_id, e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json)).await {
                debug!("Failed to send message to {}: {}", write_id, e);
                break;
            }
        }
        let _ = write.close().await;
    });

    // WebSocketからのメッセージを受信してRelayに渡すタスク
    let read_relay = relay.clone();
    let read_id = connection_id.clone();
    let mut read_handle = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if let Err(e) = read_relay.handle(&read_id, message).await {
                            warn!("Rejected message from {}: {}", read_id, e);
                            read_relay.send_error(&read_id, e.to_string()).await;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse message from {}: {}", read_id, e);
                        read_relay
                            .send_error(&read_id, format!("invalid message: {}", e))
                            .await;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("WebSocket closed by client: {}", read_id);
                    break;
                }
                Ok(_) => {
                    debug!("Received non-text message from {}", read_id);
                }
                Err(e) => {
                    warn!("WebSocket error on {}: {}", read_id, e);
                    break;
                }
            }
        }
    });

    // どちらかのタスクが終了したら接続を破棄する
    tokio::select! {
        _ = &mut read_handle => {
            relay.disconnect(&connection_id).await;
            // 送信キューが閉じるので書き込みタスクも終了する
            let _ = write_handle.await;
        }
        _ = &mut write_handle => {
            read_handle.abort();
            relay.disconnect(&connection_id).await;
        }
    }

    info!("WebSocket disconnected: {}", connection_id);
}
