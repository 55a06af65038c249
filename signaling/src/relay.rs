use anyhow::{bail, Result};
use core_types::{ClientMessage, ConnectionId, ServerMessage, UserEntry};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::store::{MemoryStore, Store};

/// 接続ごとの状態
struct Connection {
    user_id: Option<String>,
    room: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
}

struct RelayState {
    connections: HashMap<ConnectionId, Connection>,
    // ルーム名 → 参加順の接続ID
    rooms: HashMap<String, Vec<ConnectionId>>,
    store: Box<dyn Store>,
}

impl RelayState {
    fn users(&self, room: &str) -> Vec<UserEntry> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| {
                let user_id = self.connections.get(id)?.user_id.clone()?;
                Some(UserEntry {
                    socket_id: id.clone(),
                    user_id,
                })
            })
            .collect()
    }

    fn leave_room(&mut self, room: &str, connection_id: &ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.retain(|id| id != connection_id);
            if members.is_empty() {
                self.rooms.remove(room);
                debug!("Room {} is empty, dropped", room);
            }
        }
    }

    fn deliver(&self, connection_id: &ConnectionId, message: ServerMessage) {
        let Some(connection) = self.connections.get(connection_id) else {
            debug!("Connection {} is gone, message dropped", connection_id);
            return;
        };
        match connection.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for {}, message dropped", connection_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound queue closed for {}, message dropped", connection_id);
            }
        }
    }

    fn broadcast_users(&self, room: &str, initiator: &str) {
        let users = self.users(room);
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        debug!("Broadcasting {} users to room {}", users.len(), room);
        for id in members {
            self.deliver(
                id,
                ServerMessage::Users {
                    initiator: initiator.to_string(),
                    users: users.clone(),
                },
            );
        }
    }
}

/// ルームのメンバー管理とシグナル中継
///
/// 1接続は同時に高々1つのルームに所属する。ユーザーIDは常に最新の `ready`
/// を送った接続を指す。
pub struct Relay {
    outbound_buffer: usize,
    state: Mutex<RelayState>,
}

impl Relay {
    /// `outbound_buffer` は接続ごとの送信キュー長（0 は 1 として扱う）
    pub fn new(outbound_buffer: usize) -> Self {
        Self::with_store(Box::new(MemoryStore::new()), outbound_buffer)
    }

    pub fn with_store(store: Box<dyn Store>, outbound_buffer: usize) -> Self {
        Self {
            outbound_buffer: outbound_buffer.max(1),
            state: Mutex::new(RelayState {
                connections: HashMap::new(),
                rooms: HashMap::new(),
                store,
            }),
        }
    }

    /// 新しい接続を登録し、その接続宛てのメッセージを受け取る Receiver を返す
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let connection_id = ConnectionId::generate();
        let mut state = self.state.lock().await;
        state.connections.insert(
            connection_id.clone(),
            Connection {
                user_id: None,
                room: None,
                tx,
            },
        );
        debug!(
            "Connection {} registered ({} active)",
            connection_id,
            state.connections.len()
        );
        (connection_id, rx)
    }

    /// クライアントからのメッセージを処理する
    pub async fn handle(&self, connection_id: &ConnectionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Ready { user_id, room } => self.ready(connection_id, user_id, room).await,
            ClientMessage::Signal { user_id, signal } => {
                self.signal(connection_id, &user_id, signal).await
            }
        }
    }

    /// 以前のルームから抜け、指定ルームに参加してメンバー一覧をルーム全体に送る
    pub async fn ready(
        &self,
        connection_id: &ConnectionId,
        user_id: String,
        room: String,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(connection) = state.connections.get_mut(connection_id) else {
            bail!("unknown connection {}", connection_id);
        };
        let previous_room = connection.room.replace(room.clone());
        let previous_user = connection.user_id.replace(user_id.clone());

        // 同じ接続が別のユーザーIDで ready した場合、古いエントリを消す
        if let Some(previous_user) = previous_user.filter(|u| *u != user_id) {
            if state.store.get(&previous_user).as_ref() == Some(connection_id) {
                state.store.remove(&previous_user);
            }
        }

        let left_room = previous_room.filter(|r| *r != room);
        if let Some(left) = left_room.as_deref() {
            state.leave_room(left, connection_id);
            info!("{} ({}) left room {}", user_id, connection_id, left);
        }

        state.store.set(&user_id, connection_id.clone());

        let members = state.rooms.entry(room.clone()).or_default();
        if !members.contains(connection_id) {
            members.push(connection_id.clone());
        }
        info!(
            "{} ({}) joined room {} ({} members)",
            user_id,
            connection_id,
            room,
            members.len()
        );

        if let Some(left) = left_room.as_deref() {
            state.broadcast_users(left, &user_id);
        }
        state.broadcast_users(&room, &user_id);
        Ok(())
    }

    /// `target_user_id` を所有する接続へシグナルを転送する
    pub async fn signal(
        &self,
        connection_id: &ConnectionId,
        target_user_id: &str,
        signal: serde_json::Value,
    ) -> Result<()> {
        let state = self.state.lock().await;

        let Some(connection) = state.connections.get(connection_id) else {
            bail!("unknown connection {}", connection_id);
        };
        let Some(sender) = connection.user_id.clone() else {
            bail!("signal received before ready");
        };

        match state.store.get(target_user_id) {
            Some(target) => {
                debug!("Relaying signal {} -> {} ({})", sender, target_user_id, target);
                state.deliver(
                    &target,
                    ServerMessage::Signal {
                        user_id: sender,
                        signal,
                    },
                );
            }
            None => {
                warn!(
                    "Dropping signal from {} to unknown user {}",
                    sender, target_user_id
                );
            }
        }
        Ok(())
    }

    /// 接続を破棄し、所属ルームに更新後のメンバー一覧を送る
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        let mut state = self.state.lock().await;

        let Some(connection) = state.connections.remove(connection_id) else {
            return;
        };

        if let Some(user_id) = connection.user_id.as_deref() {
            // 再接続済みなら新しい接続のエントリを残す
            if state.store.get(user_id).as_ref() == Some(connection_id) {
                state.store.remove(user_id);
            }
        }

        if let Some(room) = connection.room.as_deref() {
            state.leave_room(room, connection_id);
            let initiator = connection.user_id.as_deref().unwrap_or_default();
            state.broadcast_users(room, initiator);
            info!("{} ({}) left room {}", initiator, connection_id, room);
        }

        debug!(
            "Connection {} removed ({} active)",
            connection_id,
            state.connections.len()
        );
    }

    /// 全接続を破棄する。送信キューが閉じるので各WebSocketも閉じられる
    pub async fn close_all(&self) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let connections: Vec<_> = state.connections.drain().collect();
        for (connection_id, connection) in &connections {
            if let Some(user_id) = connection.user_id.as_deref() {
                if state.store.get(user_id).as_ref() == Some(connection_id) {
                    state.store.remove(user_id);
                }
            }
        }
        state.rooms.clear();

        info!("Closed {} connections", connections.len());
        connections.len()
    }

    /// 指定の接続にエラーを通知する
    pub async fn send_error(&self, connection_id: &ConnectionId, message: String) {
        let state = self.state.lock().await;
        state.deliver(connection_id, ServerMessage::Error { message });
    }

    /// ルームのメンバー一覧（参加順）
    pub async fn users(&self, room: &str) -> Vec<UserEntry> {
        self.state.lock().await.users(room)
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.state.lock().await.store.get(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}
