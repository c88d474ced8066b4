use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SessionState;
use crate::events::CommandBuffer;
use crate::transport::SubChannelId;

/// Registry-visible snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    /// Username the attacker authenticated as, once known.
    pub username: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(id: Uuid, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            username: None,
            state: SessionState::Accepting,
            started_at: Utc::now(),
        }
    }
}

/// What kind of sub-channel the attacker opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubChannelKind {
    Session,
    DirectTcpip { host: String, port: u32 },
}

impl SubChannelKind {
    pub fn label(&self) -> String {
        match self {
            SubChannelKind::Session => "session".to_string(),
            SubChannelKind::DirectTcpip { host, port } => {
                format!("direct-tcpip {}:{}", host, port)
            }
        }
    }
}

/// One mirrored sub-channel pair and its accounting.
pub struct SubChannel {
    pub attacker_id: SubChannelId,
    pub backend_id: SubChannelId,
    pub kind: SubChannelKind,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Set once a shell with a pty is running; only then do keystrokes
    /// get parsed into command events.
    pub interactive: bool,
    pub commands: CommandBuffer,
}

impl SubChannel {
    pub fn new(attacker_id: SubChannelId, backend_id: SubChannelId, kind: SubChannelKind) -> Self {
        Self {
            attacker_id,
            backend_id,
            kind,
            bytes_in: 0,
            bytes_out: 0,
            interactive: false,
            commands: CommandBuffer::new(),
        }
    }
}
