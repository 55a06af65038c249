// SignalingServer: ルーム管理とシグナル中継を行うWebSocketサーバー
// SignalingClient: 上記サーバーに接続するWebSocketクライアント
pub mod client;
pub mod relay;
pub mod server;
pub mod store;

pub use client::{ReconnectPolicy, SignalingClient};
pub use core_types::{ClientMessage, ConnectionId, ServerMessage, UserEntry};
pub use relay::Relay;
pub use server::{router, ServerConfig, SignalingServer};
pub use store::{MemoryStore, Store};
