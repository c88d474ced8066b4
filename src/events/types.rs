use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{CredentialAttempt, Method};

/// One structured observation about a session's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventKind {
    /// An attacker connection reached the decoy.
    Connect { peer_addr: SocketAddr },
    /// A credential attempt arrived, before evaluation.
    AuthAttempt {
        username: String,
        method: Method,
        index: u32,
    },
    /// The evaluated attempt, secret material included. This payload is
    /// for event storage; operational logs must never render it.
    AuthResult { attempt: CredentialAttempt },
    /// A sub-channel was opened through the proxy.
    ChannelOpen { subchannel_id: u32, channel_kind: String },
    ChannelClose {
        subchannel_id: u32,
        bytes_in: u64,
        bytes_out: u64,
    },
    /// A command line reconstructed from interactive keystrokes, or an
    /// exec request payload.
    Command { subchannel_id: u32, command: String },
    Disconnect { reason: String },
}

impl SessionEvent {
    fn now(session_id: Uuid, kind: EventKind) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn connect(session_id: Uuid, peer_addr: SocketAddr) -> Self {
        Self::now(session_id, EventKind::Connect { peer_addr })
    }

    pub fn auth_attempt(session_id: Uuid, username: &str, method: Method, index: u32) -> Self {
        Self::now(
            session_id,
            EventKind::AuthAttempt {
                username: username.to_string(),
                method,
                index,
            },
        )
    }

    pub fn auth_result(session_id: Uuid, attempt: CredentialAttempt) -> Self {
        Self::now(session_id, EventKind::AuthResult { attempt })
    }

    pub fn channel_open(session_id: Uuid, subchannel_id: u32, channel_kind: &str) -> Self {
        Self::now(
            session_id,
            EventKind::ChannelOpen {
                subchannel_id,
                channel_kind: channel_kind.to_string(),
            },
        )
    }

    pub fn channel_close(
        session_id: Uuid,
        subchannel_id: u32,
        bytes_in: u64,
        bytes_out: u64,
    ) -> Self {
        Self::now(
            session_id,
            EventKind::ChannelClose {
                subchannel_id,
                bytes_in,
                bytes_out,
            },
        )
    }

    pub fn command(session_id: Uuid, subchannel_id: u32, command: String) -> Self {
        Self::now(
            session_id,
            EventKind::Command {
                subchannel_id,
                command,
            },
        )
    }

    pub fn disconnect(session_id: Uuid, reason: &str) -> Self {
        Self::now(
            session_id,
            EventKind::Disconnect {
                reason: reason.to_string(),
            },
        )
    }

    /// Short operational-log rendering. Never includes secret material.
    pub fn summary(&self) -> String {
        match &self.kind {
            EventKind::Connect { peer_addr } => format!("connect from {}", peer_addr),
            EventKind::AuthAttempt {
                username,
                method,
                index,
            } => format!("auth attempt {} for '{}' via {}", index, username, method),
            EventKind::AuthResult { attempt } => format!(
                "auth attempt {} for '{}' {}",
                attempt.index,
                attempt.username,
                if attempt.accepted { "accepted" } else { "rejected" }
            ),
            EventKind::ChannelOpen {
                subchannel_id,
                channel_kind,
            } => format!("channel {} opened ({})", subchannel_id, channel_kind),
            EventKind::ChannelClose {
                subchannel_id,
                bytes_in,
                bytes_out,
            } => format!(
                "channel {} closed ({} bytes in, {} bytes out)",
                subchannel_id, bytes_in, bytes_out
            ),
            EventKind::Command {
                subchannel_id,
                command,
            } => format!("channel {} command: {}", subchannel_id, command),
            EventKind::Disconnect { reason } => format!("disconnect: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Secret;

    #[test]
    fn events_serialize_with_tagged_kind() {
        let ev = SessionEvent::command(Uuid::new_v4(), 0, "cat /etc/passwd".to_string());
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "command");
        assert_eq!(json["command"], "cat /etc/passwd");
        assert!(json["session_id"].is_string());
    }

    #[test]
    fn auth_result_summary_never_contains_secret() {
        let ev = SessionEvent::auth_result(
            Uuid::new_v4(),
            CredentialAttempt {
                username: "root".to_string(),
                method: Method::Password,
                secret: Secret::new("hunter2"),
                accepted: true,
                index: 1,
            },
        );
        let summary = ev.summary();
        assert!(!summary.contains("hunter2"));
        assert!(summary.contains("root"));
        // The serialized event, destined for event storage, does carry it.
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("hunter2"));
    }
}
