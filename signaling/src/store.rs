use core_types::ConnectionId;
use std::collections::HashMap;

/// ユーザーID → 接続ID のディレクトリ
///
/// 同じユーザーIDで `set` した場合は後勝ち。
pub trait Store: Send + Sync {
    fn set(&mut self, user_id: &str, connection_id: ConnectionId);
    fn get(&self, user_id: &str) -> Option<ConnectionId>;
    fn remove(&mut self, user_id: &str);
}

/// プロセス内メモリのみで保持するストア
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, ConnectionId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemoryStore {
    fn set(&mut self, user_id: &str, connection_id: ConnectionId) {
        self.entries.insert(user_id.to_string(), connection_id);
    }

    fn get(&self, user_id: &str) -> Option<ConnectionId> {
        self.entries.get(user_id).cloned()
    }

    fn remove(&mut self, user_id: &str) {
        self.entries.remove(user_id);
    }
}
