use anyhow::{anyhow, Context, Result};
use core_types::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CommandReceiver = Arc<Mutex<mpsc::Receiver<ClientMessage>>>;

/// 再接続の方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 連続して失敗できる回数。接続に成功するとリセットされる
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

/// 1回の切断ごとの指数バックオフ
#[derive(Debug)]
struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    /// 次の待ち時間。上限回数に達していれば `None`
    fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.policy.max_retries {
            return None;
        }
        let delay = self
            .policy
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(self.failures))
            .min(self.policy.max_backoff);
        self.failures += 1;
        Some(delay)
    }

    fn attempt(&self) -> u32 {
        self.failures
    }
}

/// シグナリングクライアント（WebSocketクライアント）
///
/// 接続のたびに同じユーザーIDで `ready` を送り直すので、再接続しても
/// 相手側からは同じユーザーIDで届く。
pub struct SignalingClient {
    url: String,
    user_id: String,
    room: String,
    policy: ReconnectPolicy,
    event_tx: mpsc::Sender<ServerMessage>,
    command_rx: mpsc::Receiver<ClientMessage>,
}

impl SignalingClient {
    pub fn new(
        url: String,
        user_id: String,
        room: String,
        event_tx: mpsc::Sender<ServerMessage>,
        command_rx: mpsc::Receiver<ClientMessage>,
    ) -> Self {
        Self {
            url,
            user_id,
            room,
            policy: ReconnectPolicy::default(),
            event_tx,
            command_rx,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 送信チャンネルかイベント受信側が閉じるまで接続を維持する
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting SignalingClient connecting to {} (user_id: {}, room: {})",
            self.url, self.user_id, self.room
        );

        let url = Url::parse(&self.url).context("Failed to parse signaling url")?;
        let ready = ClientMessage::Ready {
            user_id: self.user_id.clone(),
            room: self.room.clone(),
        };
        // 再接続をまたいで同じReceiverを使う
        let command_rx: CommandReceiver = Arc::new(Mutex::new(self.command_rx));
        let mut backoff = Backoff::new(self.policy);

        loop {
            let error = match connect(&url, &ready).await {
                Ok(stream) => {
                    backoff.reset();
                    match session(stream, self.event_tx.clone(), command_rx.clone()).await {
                        Ok(()) => {
                            info!("SignalingClient stopped");
                            return Ok(());
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                error!("Giving up on {} after {} attempts: {:#}", url, backoff.attempt(), error);
                return Err(error);
            };
            warn!(
                "Signaling connection failed: {:#}; reconnecting in {:?} (attempt {}/{})",
                error,
                delay,
                backoff.attempt(),
                self.policy.max_retries
            );
            sleep(delay).await;
        }
    }
}

/// 接続して `ready` を送るまで
async fn connect(url: &Url, ready: &ClientMessage) -> Result<WsStream> {
    info!("Connecting to WebSocket: {}", url);
    let (mut stream, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to WebSocket")?;

    let json = serde_json::to_string(ready).context("Failed to serialize ready")?;
    stream
        .send(WsMessage::Text(json.into()))
        .await
        .context("Failed to send ready")?;

    info!("WebSocket connected");
    Ok(stream)
}

/// 1接続分のやり取り。アプリ側のチャンネルが閉じたら `Ok`、接続が切れたら `Err`
async fn session(
    stream: WsStream,
    event_tx: mpsc::Sender<ServerMessage>,
    command_rx: CommandReceiver,
) -> Result<()> {
    let (mut write, mut read) = stream.split();

    let mut write_handle = tokio::spawn(async move {
        loop {
            let command = command_rx.lock().await.recv().await;
            let Some(command) = command else {
                debug!("Command channel closed");
                let _ = write.close().await;
                return Ok::<(), anyhow::Error>(());
            };

            let json = serde_json::to_string(&command).context("Failed to serialize message")?;
            write
                .send(WsMessage::Text(json.into()))
                .await
                .context("Failed to send message to WebSocket")?;
        }
    });

    let mut recv_handle = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            let text = match msg.context("WebSocket error")? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => {
                    info!("WebSocket closed by server");
                    break;
                }
                _ => continue,
            };
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if let ServerMessage::Error { message } = &message {
                        warn!("Signaling server reported: {}", message);
                    }
                    if event_tx.send(message).await.is_err() {
                        debug!("Event receiver dropped");
                        return Ok::<(), anyhow::Error>(());
                    }
                }
                Err(e) => error!("Failed to parse message: {}", e),
            }
        }
        Err(anyhow!("WebSocket connection lost"))
    });

    tokio::select! {
        result = &mut write_handle => {
            recv_handle.abort();
            result.context("Write task panicked")?
        }
        result = &mut recv_handle => {
            write_handle.abort();
            result.context("Receive task panicked")?
        }
    }
}
