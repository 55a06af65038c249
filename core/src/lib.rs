use serde::{Deserialize, Serialize};
use std::fmt;

/// 接続ごとに割り当てられる一時的な識別子（ワイヤ上では `socketId`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// 新しい接続IDを生成する（プロセス内で再利用されない）
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ルームのメンバー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub socket_id: ConnectionId,
    pub user_id: String,
}

/// クライアント → サーバー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// ルームへの参加（既に参加しているルームからは抜ける）
    Ready { user_id: String, room: String },
    /// `user_id` 宛てにシグナルを中継する
    Signal {
        user_id: String,
        signal: serde_json::Value,
    },
}

/// サーバー → クライアント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// ルームのメンバー一覧（参加順）
    Users {
        initiator: String,
        users: Vec<UserEntry>,
    },
    /// 中継されたシグナル。`user_id` は送信者
    Signal {
        user_id: String,
        signal: serde_json::Value,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ready","userId":"alice","room":"lobby"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ready {
                user_id: "alice".to_string(),
                room: "lobby".to_string(),
            }
        );
    }

    #[test]
    fn test_signal_payload_is_kept_verbatim() {
        let raw = r#"{"type":"signal","userId":"bob","signal":{"type":"offer","sdp":"v=0\r\n","extra":[1,2,{"x":null}]}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Signal { user_id, signal } => {
                assert_eq!(user_id, "bob");
                assert_eq!(signal["sdp"], "v=0\r\n");
                assert_eq!(signal["extra"][2], json!({ "x": null }));
            }
            _ => panic!("Expected Signal"),
        }
    }

    #[test]
    fn test_users_wire_format() {
        let msg = ServerMessage::Users {
            initiator: "socket0_userid".to_string(),
            users: vec![
                UserEntry {
                    socket_id: ConnectionId::from("socket0"),
                    user_id: "socket0_userid".to_string(),
                },
                UserEntry {
                    socket_id: ConnectionId::from("socket1"),
                    user_id: "socket1_userid".to_string(),
                },
            ],
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "users",
                "initiator": "socket0_userid",
                "users": [
                    { "socketId": "socket0", "userId": "socket0_userid" },
                    { "socketId": "socket1", "userId": "socket1_userid" },
                ],
            })
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"leave"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
