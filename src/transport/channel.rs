use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{SubChannelId, SubChannelRequest, TransportEvent};
use crate::error_handling::types::TransportError;

/// Everything the proxy can push towards one peer.
///
/// Implementations exist for the attacker-facing server leg, the backend
/// client leg and the in-process test leg. All operations are confined to
/// their own leg; a failure here never names the other side.
#[async_trait]
pub trait TransportWriter: Send + Sync {
    /// Opens a new session sub-channel towards the peer.
    async fn open_session(&self) -> Result<SubChannelId, TransportError>;

    /// Opens a direct-tcpip sub-channel towards the peer.
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: (&str, u32),
    ) -> Result<SubChannelId, TransportError>;

    /// Issues a channel request and returns the peer's accept/refuse
    /// answer. Requests that carry no reply on the wire answer `true`.
    async fn channel_request(
        &self,
        id: SubChannelId,
        request: SubChannelRequest,
    ) -> Result<bool, TransportError>;

    async fn data(&self, id: SubChannelId, payload: &[u8]) -> Result<(), TransportError>;

    async fn extended_data(
        &self,
        id: SubChannelId,
        ext: u32,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn eof(&self, id: SubChannelId) -> Result<(), TransportError>;

    /// Reports a command's exit status on a sub-channel (server leg only).
    async fn exit_status(&self, id: SubChannelId, status: u32) -> Result<(), TransportError>;

    async fn close_sub_channel(&self, id: SubChannelId) -> Result<(), TransportError>;

    /// Closes the whole transport. Idempotent: closing an already-closed
    /// transport is a no-op, not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One leg of a session: the peer's ordered event stream plus the writer
/// for our half of the conversation.
pub struct TransportChannel {
    events: mpsc::Receiver<TransportEvent>,
    writer: Arc<dyn TransportWriter>,
}

impl TransportChannel {
    pub fn new(events: mpsc::Receiver<TransportEvent>, writer: Arc<dyn TransportWriter>) -> Self {
        Self { events, writer }
    }

    /// Next event from the peer. `None` once the leg is finished and its
    /// final `Disconnected` has been consumed.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn writer(&self) -> Arc<dyn TransportWriter> {
        Arc::clone(&self.writer)
    }
}
