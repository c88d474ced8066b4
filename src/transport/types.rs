use tokio::sync::oneshot;

use crate::auth::{Method, Secret};

/// Identifier of one multiplexed sub-channel within a transport leg.
/// Assigned by the leg that accepted or opened the sub-channel; the proxy
/// keeps its own mapping between the two legs' ids.
pub type SubChannelId = u32;

/// Depth of the per-leg event queue. Bounded on purpose: when the proxy
/// falls behind, backpressure reaches the peer instead of memory growing.
pub const TRANSPORT_EVENT_CAPACITY: usize = 1024;

/// A request scoped to one sub-channel, as the SSH connection protocol
/// models them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubChannelRequest {
    Pty {
        term: String,
        cols: u32,
        rows: u32,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        cols: u32,
        rows: u32,
    },
}

impl SubChannelRequest {
    /// Short label for events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SubChannelRequest::Pty { .. } => "pty",
            SubChannelRequest::Shell => "shell",
            SubChannelRequest::Exec { .. } => "exec",
            SubChannelRequest::Subsystem { .. } => "subsystem",
            SubChannelRequest::Env { .. } => "env",
            SubChannelRequest::WindowChange { .. } => "window-change",
        }
    }
}

/// One-shot accept/refuse decision owed to the peer.
///
/// Dropping the slot without answering counts as a refusal, so an aborted
/// proxy can never leave the peer hanging on a reply.
#[derive(Debug)]
pub struct ReplySlot(Option<oneshot::Sender<bool>>);

impl ReplySlot {
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub fn accept(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(true);
        }
    }

    pub fn refuse(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(false);
        }
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(false);
        }
    }
}

/// How an authentication attempt is answered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accept,
    /// Reject, but keep the conversation going (advertise password auth).
    Deny,
    /// Reject and tear the connection down afterwards.
    Disconnect,
}

/// Reply slot for authentication attempts. Dropping it denies.
#[derive(Debug)]
pub struct AuthReply(Option<oneshot::Sender<AuthOutcome>>);

impl AuthReply {
    pub fn new() -> (Self, oneshot::Receiver<AuthOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub fn answer(mut self, outcome: AuthOutcome) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for AuthReply {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(AuthOutcome::Deny);
        }
    }
}

/// Everything a transport leg can tell the proxy, in arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A credential attempt, before any decision. The leg blocks its auth
    /// exchange until the slot is answered.
    AuthAttempt {
        username: String,
        method: Method,
        secret: Secret,
        reply: AuthReply,
    },
    /// The peer wants a new session sub-channel.
    SessionOpen {
        id: SubChannelId,
        reply: ReplySlot,
    },
    /// The peer wants a direct-tcpip sub-channel towards `host:port`.
    DirectTcpipOpen {
        id: SubChannelId,
        host: String,
        port: u32,
        originator: (String, u32),
        reply: ReplySlot,
    },
    /// A request on an open sub-channel (pty, shell, exec, ...).
    ChannelRequest {
        id: SubChannelId,
        request: SubChannelRequest,
        reply: ReplySlot,
    },
    Data {
        id: SubChannelId,
        payload: Vec<u8>,
    },
    /// Extended (stderr) data.
    ExtendedData {
        id: SubChannelId,
        ext: u32,
        payload: Vec<u8>,
    },
    Eof {
        id: SubChannelId,
    },
    ExitStatus {
        id: SubChannelId,
        status: u32,
    },
    SubChannelClosed {
        id: SubChannelId,
    },
    /// The transport itself ended. Always the last event of a leg.
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_reply_slot_counts_as_refusal() {
        let (slot, rx) = ReplySlot::new();
        drop(slot);
        assert_eq!(rx.await, Ok(false));
    }

    #[tokio::test]
    async fn answered_slot_delivers_the_decision_once() {
        let (slot, rx) = ReplySlot::new();
        slot.accept();
        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn dropped_auth_reply_denies() {
        let (reply, rx) = AuthReply::new();
        drop(reply);
        assert_eq!(rx.await, Ok(AuthOutcome::Deny));
    }
}
