//! Backend-facing SSH client leg.
//!
//! The proxy talks to the sandboxed backend with our own credentials,
//! never the attacker's. Every sub-channel gets a pump task that owns the
//! SSH channel object: it forwards the peer's messages into the transport
//! event stream and executes the proxy's write commands, so channel
//! ownership never crosses task boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, warn};
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::channel::{TransportChannel, TransportWriter};
use super::types::{
    SubChannelId, SubChannelRequest, TransportEvent, TRANSPORT_EVENT_CAPACITY,
};
use crate::error_handling::types::{ProvisionError, TransportError};

/// Write commands handed to a sub-channel pump.
enum WriteCmd {
    Data(Vec<u8>),
    Request {
        request: SubChannelRequest,
        reply: oneshot::Sender<bool>,
    },
    Eof,
    Close,
}

/// Per-channel command queue depth. Small on purpose: a stalled backend
/// channel should push back on the relay, not buffer.
const WRITE_QUEUE_CAPACITY: usize = 64;

struct BackendClientHandler {
    events: mpsc::Sender<TransportEvent>,
}

impl Drop for BackendClientHandler {
    fn drop(&mut self) {
        let _ = self.events.try_send(TransportEvent::Disconnected {
            reason: "backend connection closed".to_string(),
        });
    }
}

impl russh::client::Handler for BackendClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The backend is a sandbox we provisioned ourselves; there is no
        // key continuity to verify.
        Ok(true)
    }
}

/// Connects and authenticates against the backend, returning the leg the
/// proxy relays through.
pub async fn connect(
    addr: &str,
    username: &str,
    password: &str,
) -> Result<TransportChannel, ProvisionError> {
    let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let config = Arc::new(russh::client::Config::default());
    let handler = BackendClientHandler {
        events: events_tx.clone(),
    };
    let mut handle = russh::client::connect(config, addr, handler)
        .await
        .map_err(|e| match e {
            TransportError::SshError(russh::Error::IO(io)) => ProvisionError::Unreachable(io),
            TransportError::IoError(io) => ProvisionError::Unreachable(io),
            other => ProvisionError::Handshake(other.to_string()),
        })?;
    let auth = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| ProvisionError::Handshake(e.to_string()))?;
    if !auth.success() {
        return Err(ProvisionError::AuthFailed);
    }
    debug!("Backend leg authenticated as '{}' at {}", username, addr);

    let writer = Arc::new(BackendWriter {
        handle: Mutex::new(handle),
        channels: StdMutex::new(HashMap::new()),
        events: events_tx,
        next_id: AtomicU32::new(0),
        closed: AtomicBool::new(false),
    });
    Ok(TransportChannel::new(
        events_rx,
        writer as Arc<dyn TransportWriter>,
    ))
}

pub struct BackendWriter {
    handle: Mutex<russh::client::Handle<BackendClientHandler>>,
    channels: StdMutex<HashMap<SubChannelId, mpsc::Sender<WriteCmd>>>,
    events: mpsc::Sender<TransportEvent>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl BackendWriter {
    fn channels(&self) -> MutexGuard<'_, HashMap<SubChannelId, mpsc::Sender<WriteCmd>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pump_of(&self, id: SubChannelId) -> Result<mpsc::Sender<WriteCmd>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.channels()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownSubChannel(id))
    }

    fn adopt(&self, channel: Channel<Msg>) -> SubChannelId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (cmd_tx, cmd_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        self.channels().insert(id, cmd_tx);
        tokio::spawn(pump(channel, id, self.events.clone(), cmd_rx));
        id
    }
}

#[async_trait]
impl TransportWriter for BackendWriter {
    async fn open_session(&self) -> Result<SubChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = {
            let handle = self.handle.lock().await;
            handle.channel_open_session().await?
        };
        Ok(self.adopt(channel))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: (&str, u32),
    ) -> Result<SubChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(host, port, originator.0, originator.1)
                .await?
        };
        Ok(self.adopt(channel))
    }

    async fn channel_request(
        &self,
        id: SubChannelId,
        request: SubChannelRequest,
    ) -> Result<bool, TransportError> {
        let pump = self.pump_of(id)?;
        let (reply, rx) = oneshot::channel();
        pump.send(WriteCmd::Request { request, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn data(&self, id: SubChannelId, payload: &[u8]) -> Result<(), TransportError> {
        let pump = self.pump_of(id)?;
        pump.send(WriteCmd::Data(payload.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn extended_data(
        &self,
        id: SubChannelId,
        _ext: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        // Client-to-server extended data does not exist on the wire;
        // anything the attacker managed to send lands on stdin.
        self.data(id, payload).await
    }

    async fn eof(&self, id: SubChannelId) -> Result<(), TransportError> {
        let pump = self.pump_of(id)?;
        pump.send(WriteCmd::Eof)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn exit_status(&self, id: SubChannelId, _status: u32) -> Result<(), TransportError> {
        Err(TransportError::Protocol(format!(
            "client leg cannot report exit status on sub-channel {}",
            id
        )))
    }

    async fn close_sub_channel(&self, id: SubChannelId) -> Result<(), TransportError> {
        let pump = self.pump_of(id)?;
        self.channels().remove(&id);
        pump.send(WriteCmd::Close)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channels().clear();
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
        Ok(())
    }
}

/// Owns one backend SSH channel: peer messages out, write commands in.
async fn pump(
    mut channel: Channel<Msg>,
    id: SubChannelId,
    events: mpsc::Sender<TransportEvent>,
    mut cmds: mpsc::Receiver<WriteCmd>,
) {
    // One request may be in flight at a time; the SSH layer answers with
    // bare success/failure messages, so replies pair up in order.
    let mut pending: Option<oneshot::Sender<bool>> = None;

    enum Step {
        Msg(Option<ChannelMsg>),
        Cmd(Option<WriteCmd>),
    }

    loop {
        let step = tokio::select! {
            msg = channel.wait() => Step::Msg(msg),
            cmd = cmds.recv() => Step::Cmd(cmd),
        };
        match step {
            Step::Msg(Some(msg)) => match msg {
                ChannelMsg::Data { data } => {
                    if events
                        .send(TransportEvent::Data {
                            id,
                            payload: data.to_vec(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ChannelMsg::ExtendedData { data, ext } => {
                    if events
                        .send(TransportEvent::ExtendedData {
                            id,
                            ext,
                            payload: data.to_vec(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    if events.send(TransportEvent::Eof { id }).await.is_err() {
                        break;
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    if events
                        .send(TransportEvent::ExitStatus {
                            id,
                            status: exit_status,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ChannelMsg::Success => {
                    if let Some(reply) = pending.take() {
                        let _ = reply.send(true);
                    }
                }
                ChannelMsg::Failure => {
                    if let Some(reply) = pending.take() {
                        let _ = reply.send(false);
                    }
                }
                ChannelMsg::Close => {
                    let _ = events.send(TransportEvent::SubChannelClosed { id }).await;
                    break;
                }
                other => {
                    debug!("Sub-channel {} ignoring backend message {:?}", id, other);
                }
            },
            Step::Msg(None) => {
                let _ = events.send(TransportEvent::SubChannelClosed { id }).await;
                break;
            }
            Step::Cmd(Some(WriteCmd::Data(payload))) => {
                if channel.data(&payload[..]).await.is_err() {
                    warn!("Sub-channel {} write to backend failed", id);
                    let _ = events.send(TransportEvent::SubChannelClosed { id }).await;
                    break;
                }
            }
            Step::Cmd(Some(WriteCmd::Request { request, reply })) => {
                let sent = issue_request(&channel, &request).await;
                match (sent, &request) {
                    // Window changes carry no reply message.
                    (Ok(()), SubChannelRequest::WindowChange { .. }) => {
                        let _ = reply.send(true);
                    }
                    (Ok(()), _) => pending = Some(reply),
                    (Err(e), _) => {
                        warn!(
                            "Sub-channel {} {} request failed: {}",
                            id,
                            request.label(),
                            e
                        );
                        let _ = reply.send(false);
                    }
                }
            }
            Step::Cmd(Some(WriteCmd::Eof)) => {
                let _ = channel.eof().await;
            }
            Step::Cmd(Some(WriteCmd::Close)) => {
                let _ = channel.close().await;
                break;
            }
            Step::Cmd(None) => {
                let _ = channel.close().await;
                break;
            }
        }
    }
}

async fn issue_request(
    channel: &Channel<Msg>,
    request: &SubChannelRequest,
) -> Result<(), russh::Error> {
    match request {
        SubChannelRequest::Shell => channel.request_shell(true).await,
        SubChannelRequest::Exec { command } => channel.exec(true, command.clone()).await,
        SubChannelRequest::Subsystem { name } => channel.request_subsystem(true, name).await,
        SubChannelRequest::Pty { term, cols, rows } => {
            channel
                .request_pty(true, term, *cols, *rows, 0, 0, &[])
                .await
        }
        SubChannelRequest::Env { name, value } => channel.set_env(true, name, value).await,
        SubChannelRequest::WindowChange { cols, rows } => {
            channel.window_change(*cols, *rows, 0, 0).await
        }
    }
}
