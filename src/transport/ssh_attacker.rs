//! Attacker-facing SSH server leg.
//!
//! Each accepted connection gets an [`AttackerHandler`] that bridges the
//! SSH callbacks into the transport event stream and an [`AttackerWriter`]
//! the proxy writes back through. The handler blocks on the proxy's
//! accept/refuse decisions so the attacker only ever sees answers that
//! came from the mirrored backend exchange.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect};
use tokio::sync::mpsc;

use super::channel::{TransportChannel, TransportWriter};
use super::types::{
    AuthOutcome, AuthReply, ReplySlot, SubChannelId, SubChannelRequest, TransportEvent,
    TRANSPORT_EVENT_CAPACITY,
};
use crate::auth::{Method, Secret};
use crate::configuration::config::Config;
use crate::error_handling::types::TransportError;

/// Invoked once per accepted connection, before key exchange finishes.
/// The callee owns the session from here on.
pub type ConnectionHook = Arc<dyn Fn(TransportChannel, SocketAddr) + Send + Sync>;

/// Builds the SSH server configuration: host key, banner, auth pacing.
pub fn server_config(config: &Config) -> Result<Arc<russh::server::Config>, TransportError> {
    let key = match &config.host_key_path {
        Some(path) => russh::keys::load_secret_key(path, None)
            .map_err(|e| TransportError::Handshake(e.to_string()))?,
        None => {
            debug!("No host key configured, generating an ephemeral ed25519 key");
            russh::keys::PrivateKey::random(&mut rand::rngs::OsRng, russh::keys::Algorithm::Ed25519)
                .map_err(|e| TransportError::Handshake(e.to_string()))?
        }
    };
    let mut ssh = russh::server::Config::default();
    ssh.keys.push(key);
    ssh.server_id = russh::SshId::Standard(config.server_id.clone());
    // Same rejection pacing a stock sshd shows.
    ssh.auth_rejection_time = Duration::from_secs(1);
    ssh.auth_rejection_time_initial = Some(Duration::ZERO);
    Ok(Arc::new(ssh))
}

/// Runs the decoy listener until the task is cancelled or the bind fails.
pub async fn run_server(
    listen_addr: String,
    ssh_config: Arc<russh::server::Config>,
    hook: ConnectionHook,
) -> Result<(), TransportError> {
    use russh::server::Server as _;
    let mut server = DecoyServer { hook };
    server.run_on_address(ssh_config, &listen_addr as &str).await?;
    Ok(())
}

struct DecoyServer {
    hook: ConnectionHook,
}

impl russh::server::Server for DecoyServer {
    type Handler = AttackerHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> AttackerHandler {
        let peer = peer_addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (handler, channel) = AttackerHandler::new();
        (self.hook)(channel, peer);
        handler
    }
}

/// Proxy-side writer over the server handle.
pub struct AttackerWriter {
    handle: OnceLock<Handle>,
    channels: Mutex<HashMap<SubChannelId, ChannelId>>,
    closed: AtomicBool,
}

impl AttackerWriter {
    fn new() -> Self {
        Self {
            handle: OnceLock::new(),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<SubChannelId, ChannelId>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn handle(&self) -> Result<Handle, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.handle
            .get()
            .cloned()
            .ok_or(TransportError::Closed)
    }

    fn resolve(&self, id: SubChannelId) -> Result<ChannelId, TransportError> {
        self.channels()
            .get(&id)
            .copied()
            .ok_or(TransportError::UnknownSubChannel(id))
    }
}

#[async_trait]
impl TransportWriter for AttackerWriter {
    async fn open_session(&self) -> Result<SubChannelId, TransportError> {
        // The server leg only ever answers the attacker's opens.
        Err(TransportError::Protocol(
            "server leg cannot open session sub-channels".to_string(),
        ))
    }

    async fn open_direct_tcpip(
        &self,
        _host: &str,
        _port: u32,
        _originator: (&str, u32),
    ) -> Result<SubChannelId, TransportError> {
        Err(TransportError::Protocol(
            "server leg cannot open direct-tcpip sub-channels".to_string(),
        ))
    }

    async fn channel_request(
        &self,
        id: SubChannelId,
        request: SubChannelRequest,
    ) -> Result<bool, TransportError> {
        Err(TransportError::Protocol(format!(
            "server leg cannot issue {} requests on sub-channel {}",
            request.label(),
            id
        )))
    }

    async fn data(&self, id: SubChannelId, payload: &[u8]) -> Result<(), TransportError> {
        let channel = self.resolve(id)?;
        self.handle()?
            .data(channel, CryptoVec::from_slice(payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn extended_data(
        &self,
        id: SubChannelId,
        ext: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let channel = self.resolve(id)?;
        self.handle()?
            .extended_data(channel, ext, CryptoVec::from_slice(payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn eof(&self, id: SubChannelId) -> Result<(), TransportError> {
        let channel = self.resolve(id)?;
        self.handle()?
            .eof(channel)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn exit_status(&self, id: SubChannelId, status: u32) -> Result<(), TransportError> {
        let channel = self.resolve(id)?;
        self.handle()?
            .exit_status_request(channel, status)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_sub_channel(&self, id: SubChannelId) -> Result<(), TransportError> {
        let channel = self.resolve(id)?;
        self.handle()?
            .close(channel)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.handle.get() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "".to_string(), "".to_string())
                .await;
        }
        Ok(())
    }
}

/// Per-connection SSH callback bridge.
pub struct AttackerHandler {
    events: mpsc::Sender<TransportEvent>,
    writer: Arc<AttackerWriter>,
    next_id: AtomicU32,
}

impl AttackerHandler {
    fn new() -> (Self, TransportChannel) {
        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let writer = Arc::new(AttackerWriter::new());
        let channel = TransportChannel::new(rx, Arc::clone(&writer) as Arc<dyn TransportWriter>);
        (
            Self {
                events: tx,
                writer,
                next_id: AtomicU32::new(0),
            },
            channel,
        )
    }

    fn capture_handle(&self, session: &mut Session) {
        let _ = self.writer.handle.set(session.handle());
    }

    fn sub_channel_of(&self, channel: ChannelId) -> Option<SubChannelId> {
        self.writer
            .channels()
            .iter()
            .find(|(_, cid)| **cid == channel)
            .map(|(id, _)| *id)
    }

    /// Relays a credential attempt to the proxy and waits for the answer.
    async fn decide_auth(
        &mut self,
        username: &str,
        method: Method,
        secret: Secret,
    ) -> Result<Auth, TransportError> {
        let (reply, rx) = AuthReply::new();
        self.events
            .send(TransportEvent::AuthAttempt {
                username: username.to_string(),
                method,
                secret,
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        let outcome = rx.await.unwrap_or(AuthOutcome::Deny);
        Ok(match outcome {
            AuthOutcome::Accept => Auth::Accept,
            AuthOutcome::Deny => Auth::Reject {
                proceed_with_methods: Some(russh::MethodSet::from(
                    [russh::MethodKind::Password].as_slice(),
                )),
                partial_success: false,
            },
            AuthOutcome::Disconnect => Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            },
        })
    }

    /// Relays a channel request and mirrors the proxy's answer back as
    /// channel success or failure.
    async fn mirror_request(
        &mut self,
        channel: ChannelId,
        request: SubChannelRequest,
        session: &mut Session,
    ) -> Result<(), TransportError> {
        self.capture_handle(session);
        let Some(id) = self.sub_channel_of(channel) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let (reply, rx) = ReplySlot::new();
        self.events
            .send(TransportEvent::ChannelRequest { id, request, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        if rx.await.unwrap_or(false) {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }
}

impl Drop for AttackerHandler {
    fn drop(&mut self) {
        let _ = self.events.try_send(TransportEvent::Disconnected {
            reason: "connection closed".to_string(),
        });
    }
}

impl russh::server::Handler for AttackerHandler {
    type Error = TransportError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.decide_auth(user, Method::Password, Secret::new(password))
            .await
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(Default::default()).to_string();
        self.decide_auth(user, Method::PublicKey, Secret::new(fingerprint))
            .await
    }

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        // The usual method probe; steer straight to password without
        // burning one of the session's attempts.
        Ok(Auth::Reject {
            proceed_with_methods: Some(russh::MethodSet::from(
                [russh::MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.capture_handle(session);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.writer.channels().insert(id, channel.id());
        let (reply, rx) = ReplySlot::new();
        self.events
            .send(TransportEvent::SessionOpen { id, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        let accepted = rx.await.unwrap_or(false);
        if !accepted {
            self.writer.channels().remove(&id);
        }
        Ok(accepted)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.capture_handle(session);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.writer.channels().insert(id, channel.id());
        let (reply, rx) = ReplySlot::new();
        self.events
            .send(TransportEvent::DirectTcpipOpen {
                id,
                host: host_to_connect.to_string(),
                port: port_to_connect,
                originator: (originator_address.to_string(), originator_port),
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        let accepted = rx.await.unwrap_or(false);
        if !accepted {
            self.writer.channels().remove(&id);
        }
        Ok(accepted)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.capture_handle(session);
        if let Some(id) = self.sub_channel_of(channel) {
            self.events
                .send(TransportEvent::Data {
                    id,
                    payload: data.to_vec(),
                })
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.capture_handle(session);
        if let Some(id) = self.sub_channel_of(channel) {
            self.events
                .send(TransportEvent::ExtendedData {
                    id,
                    ext,
                    payload: data.to_vec(),
                })
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.mirror_request(channel, SubChannelRequest::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.mirror_request(
            channel,
            SubChannelRequest::Exec {
                command: data.to_vec(),
            },
            session,
        )
        .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.mirror_request(
            channel,
            SubChannelRequest::Subsystem {
                name: name.to_string(),
            },
            session,
        )
        .await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.mirror_request(
            channel,
            SubChannelRequest::Pty {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            },
            session,
        )
        .await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.mirror_request(
            channel,
            SubChannelRequest::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
            session,
        )
        .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Window changes carry no reply on the wire; mirror and move on.
        self.capture_handle(session);
        if let Some(id) = self.sub_channel_of(channel) {
            let (reply, _rx) = ReplySlot::new();
            self.events
                .send(TransportEvent::ChannelRequest {
                    id,
                    request: SubChannelRequest::WindowChange {
                        cols: col_width,
                        rows: row_height,
                    },
                    reply,
                })
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.capture_handle(session);
        if let Some(id) = self.sub_channel_of(channel) {
            self.events
                .send(TransportEvent::Eof { id })
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.capture_handle(session);
        if let Some(id) = self.sub_channel_of(channel) {
            self.writer.channels().remove(&id);
            if self
                .events
                .send(TransportEvent::SubChannelClosed { id })
                .await
                .is_err()
            {
                warn!("Sub-channel {} closed after its session ended", id);
            }
        }
        Ok(())
    }
}
