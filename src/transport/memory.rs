//! In-process transport leg for tests.
//!
//! The [`MemoryPeer`] plays the remote side: it injects events exactly as
//! an SSH leg would and records every writer call the proxy makes, so
//! proxy behavior can be asserted without a network or an SSH stack.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::channel::{TransportChannel, TransportWriter};
use super::types::{
    AuthOutcome, AuthReply, ReplySlot, SubChannelId, SubChannelRequest, TransportEvent,
    TRANSPORT_EVENT_CAPACITY,
};
use crate::auth::{Method, Secret};
use crate::error_handling::types::TransportError;

/// One writer call as the peer observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterCall {
    OpenSession(SubChannelId),
    OpenDirectTcpip {
        id: SubChannelId,
        host: String,
        port: u32,
    },
    Request {
        id: SubChannelId,
        request: SubChannelRequest,
    },
    Data {
        id: SubChannelId,
        payload: Vec<u8>,
    },
    ExtendedData {
        id: SubChannelId,
        ext: u32,
        payload: Vec<u8>,
    },
    Eof(SubChannelId),
    ExitStatus {
        id: SubChannelId,
        status: u32,
    },
    CloseSubChannel(SubChannelId),
    Close,
}

struct MemoryState {
    calls: Vec<WriterCall>,
}

pub struct MemoryWriter {
    state: Mutex<MemoryState>,
    next_id: AtomicU32,
    refuse_requests: AtomicBool,
    fail_opens: AtomicBool,
    closed: AtomicBool,
}

impl MemoryWriter {
    fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState { calls: Vec::new() }),
            next_id: AtomicU32::new(0),
            refuse_requests: AtomicBool::new(false),
            fail_opens: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: WriterCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn open_session(&self) -> Result<SubChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("open refused".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(WriterCall::OpenSession(id));
        Ok(id)
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        _originator: (&str, u32),
    ) -> Result<SubChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("open refused".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(WriterCall::OpenDirectTcpip {
            id,
            host: host.to_string(),
            port,
        });
        Ok(id)
    }

    async fn channel_request(
        &self,
        id: SubChannelId,
        request: SubChannelRequest,
    ) -> Result<bool, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.record(WriterCall::Request { id, request });
        Ok(!self.refuse_requests.load(Ordering::SeqCst))
    }

    async fn data(&self, id: SubChannelId, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.record(WriterCall::Data {
            id,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn extended_data(
        &self,
        id: SubChannelId,
        ext: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.record(WriterCall::ExtendedData {
            id,
            ext,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn eof(&self, id: SubChannelId) -> Result<(), TransportError> {
        self.record(WriterCall::Eof(id));
        Ok(())
    }

    async fn exit_status(&self, id: SubChannelId, status: u32) -> Result<(), TransportError> {
        self.record(WriterCall::ExitStatus { id, status });
        Ok(())
    }

    async fn close_sub_channel(&self, id: SubChannelId) -> Result<(), TransportError> {
        self.record(WriterCall::CloseSubChannel(id));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(WriterCall::Close);
        }
        Ok(())
    }
}

/// The remote side of an in-process leg.
#[derive(Clone)]
pub struct MemoryPeer {
    events: mpsc::Sender<TransportEvent>,
    writer: Arc<MemoryWriter>,
    next_id: Arc<AtomicU32>,
}

impl MemoryPeer {
    /// Injects a credential attempt and waits for the proxy's decision.
    pub async fn attempt_auth(&self, username: &str, method: Method, secret: &str) -> AuthOutcome {
        let (reply, rx) = AuthReply::new();
        if self
            .events
            .send(TransportEvent::AuthAttempt {
                username: username.to_string(),
                method,
                secret: Secret::new(secret),
                reply,
            })
            .await
            .is_err()
        {
            return AuthOutcome::Disconnect;
        }
        rx.await.unwrap_or(AuthOutcome::Deny)
    }

    /// Asks for a new session sub-channel; returns its id when accepted.
    pub async fn open_session(&self) -> Option<SubChannelId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = ReplySlot::new();
        self.events
            .send(TransportEvent::SessionOpen { id, reply })
            .await
            .ok()?;
        if rx.await.unwrap_or(false) {
            Some(id)
        } else {
            None
        }
    }

    pub async fn open_direct_tcpip(&self, host: &str, port: u32) -> Option<SubChannelId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = ReplySlot::new();
        self.events
            .send(TransportEvent::DirectTcpipOpen {
                id,
                host: host.to_string(),
                port,
                originator: ("127.0.0.1".to_string(), 0),
                reply,
            })
            .await
            .ok()?;
        if rx.await.unwrap_or(false) {
            Some(id)
        } else {
            None
        }
    }

    /// Issues a channel request and returns the proxy's answer.
    pub async fn request(&self, id: SubChannelId, request: SubChannelRequest) -> bool {
        let (reply, rx) = ReplySlot::new();
        if self
            .events
            .send(TransportEvent::ChannelRequest { id, request, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn send_data(&self, id: SubChannelId, payload: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::Data {
                id,
                payload: payload.to_vec(),
            })
            .await;
    }

    pub async fn send_extended_data(&self, id: SubChannelId, ext: u32, payload: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::ExtendedData {
                id,
                ext,
                payload: payload.to_vec(),
            })
            .await;
    }

    pub async fn send_eof(&self, id: SubChannelId) {
        let _ = self.events.send(TransportEvent::Eof { id }).await;
    }

    pub async fn send_exit_status(&self, id: SubChannelId, status: u32) {
        let _ = self
            .events
            .send(TransportEvent::ExitStatus { id, status })
            .await;
    }

    pub async fn close_sub_channel(&self, id: SubChannelId) {
        let _ = self.events.send(TransportEvent::SubChannelClosed { id }).await;
    }

    pub async fn disconnect(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Every writer call the proxy has made on this leg so far.
    pub fn calls(&self) -> Vec<WriterCall> {
        self.writer.lock().calls.clone()
    }

    /// Payload bytes written to one sub-channel, concatenated.
    pub fn written_to(&self, id: SubChannelId) -> Vec<u8> {
        let mut out = Vec::new();
        for call in self.writer.lock().calls.iter() {
            if let WriterCall::Data { id: cid, payload } = call {
                if *cid == id {
                    out.extend_from_slice(payload);
                }
            }
        }
        out
    }

    pub fn transport_closed(&self) -> bool {
        self.writer.closed.load(Ordering::SeqCst)
    }

    /// Makes future session/direct-tcpip opens on the writer fail.
    pub fn fail_opens(&self) {
        self.writer.fail_opens.store(true, Ordering::SeqCst);
    }

    /// Makes the writer refuse future channel requests.
    pub fn refuse_requests(&self) {
        self.writer.refuse_requests.store(true, Ordering::SeqCst);
    }
}

/// Builds one in-process leg: the channel the proxy consumes and the peer
/// handle the test drives.
pub fn memory_leg() -> (TransportChannel, MemoryPeer) {
    let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let writer = Arc::new(MemoryWriter::new());
    let channel = TransportChannel::new(rx, Arc::clone(&writer) as Arc<dyn TransportWriter>);
    let peer = MemoryPeer {
        events: tx,
        writer,
        next_id: Arc::new(AtomicU32::new(0)),
    };
    (channel, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_events_arrive_in_order() {
        let (mut channel, peer) = memory_leg();
        peer.send_data(0, b"first").await;
        peer.send_data(0, b"second").await;
        peer.disconnect("done").await;

        match channel.next_event().await {
            Some(TransportEvent::Data { payload, .. }) => assert_eq!(payload, b"first"),
            other => panic!("unexpected event: {:?}", other),
        }
        match channel.next_event().await {
            Some(TransportEvent::Data { payload, .. }) => assert_eq!(payload, b"second"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            channel.next_event().await,
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn writer_calls_are_recorded() {
        let (channel, peer) = memory_leg();
        let writer = channel.writer();
        let id = writer.open_session().await.unwrap();
        writer.data(id, b"uname").await.unwrap();
        writer.close().await.unwrap();
        // A second close is a no-op.
        writer.close().await.unwrap();

        assert_eq!(
            peer.calls(),
            vec![
                WriterCall::OpenSession(id),
                WriterCall::Data {
                    id,
                    payload: b"uname".to_vec()
                },
                WriterCall::Close,
            ]
        );
        assert!(peer.transport_closed());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (channel, _peer) = memory_leg();
        let writer = channel.writer();
        writer.close().await.unwrap();
        assert!(matches!(
            writer.data(0, b"late").await,
            Err(TransportError::Closed)
        ));
    }
}
