use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::SessionRegistry;
use super::session::{SubChannel, SubChannelKind};
use super::SessionState;
use crate::auth::{Authenticator, CredentialAttempt, Decision, Method};
use crate::configuration::config::Config;
use crate::configuration::types::ProvisionConfig;
use crate::error_handling::types::TransportError;
use crate::events::{EventBus, SessionEvent};
use crate::provisioning::{provision_with_retry, BackendProvisioner, SessionParams};
use crate::transcript::{Direction, SessionTranscript, TranscriptRecorder};
use crate::transport::{
    AuthOutcome, SubChannelId, SubChannelRequest, TransportChannel, TransportEvent,
    TransportWriter,
};

/// Per-session knobs, snapshotted from the configuration at accept time
/// so a reload never changes a session mid-flight.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_auth_attempts: u32,
    /// Zero disables the idle cutoff.
    pub idle_timeout: Duration,
    pub provision: ProvisionConfig,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_auth_attempts: config.max_auth_attempts,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            provision: config.provision.clone(),
        }
    }
}

/// Outcome of the authentication phase.
enum AuthPhase {
    Accepted { username: String },
    Rejected { reason: String },
    Gone { reason: String },
}

/// What woke the relay loop.
enum RelayStep {
    Attacker(Option<TransportEvent>),
    Backend(Option<TransportEvent>),
    Idle,
    Cancelled,
}

/// Drives one intercepted session from accept to teardown.
///
/// The proxy is the only component that sees both legs. It answers the
/// attacker only with what the mirrored backend exchange produced, feeds
/// every relayed frame to the transcript, and publishes the session's
/// event trail. Teardown always closes the attacker leg first so the
/// attacker-visible ending is a clean SSH disconnect.
pub struct SessionProxy {
    id: Uuid,
    peer_addr: SocketAddr,
    attacker: TransportChannel,
    authenticator: Arc<Authenticator>,
    provisioner: Arc<dyn BackendProvisioner>,
    recorder: Arc<TranscriptRecorder>,
    events: Arc<EventBus>,
    registry: Arc<SessionRegistry>,
    settings: ProxySettings,
    cancel: CancellationToken,
}

impl SessionProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        peer_addr: SocketAddr,
        attacker: TransportChannel,
        authenticator: Arc<Authenticator>,
        provisioner: Arc<dyn BackendProvisioner>,
        recorder: Arc<TranscriptRecorder>,
        events: Arc<EventBus>,
        registry: Arc<SessionRegistry>,
        settings: ProxySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            attacker,
            authenticator,
            provisioner,
            recorder,
            events,
            registry,
            settings,
            cancel,
        }
    }

    fn set_state(&self, state: SessionState) {
        debug!("[{}] state -> {}", self.id, state);
        self.registry.update_state(self.id, state);
    }

    /// Runs the session to completion. Never panics the caller; every
    /// failure path ends in an orderly teardown.
    pub async fn run(mut self) {
        let id = self.id;
        info!("[{}] Session accepted from {}", id, self.peer_addr);
        self.events
            .publish(SessionEvent::connect(id, self.peer_addr));
        let transcript = self.recorder.begin_session(id);
        let attacker_writer = self.attacker.writer();

        self.set_state(SessionState::Authenticating);
        let username = match self.authenticate().await {
            AuthPhase::Accepted { username } => username,
            AuthPhase::Rejected { reason } => {
                info!("[{}] Rejected: {}", id, reason);
                let _ = attacker_writer.close().await;
                self.events
                    .publish(SessionEvent::disconnect(id, "authentication failed"));
                self.finish(&transcript, SessionState::Rejected).await;
                return;
            }
            AuthPhase::Gone { reason } => {
                info!("[{}] Attacker left during auth: {}", id, reason);
                let _ = attacker_writer.close().await;
                self.events.publish(SessionEvent::disconnect(id, &reason));
                self.finish(&transcript, SessionState::Rejected).await;
                return;
            }
        };
        self.registry.set_username(id, &username);

        self.set_state(SessionState::Provisioning);
        let params = SessionParams {
            session_id: id,
            peer_addr: self.peer_addr,
            username,
        };
        let backend = match provision_with_retry(
            self.provisioner.as_ref(),
            &self.settings.provision,
            &params,
        )
        .await
        {
            Ok(backend) => backend,
            Err(e) => {
                // The attacker sees nothing but a clean disconnect.
                error!("[{}] Backend provisioning failed: {}", id, e);
                let _ = attacker_writer.close().await;
                self.events
                    .publish(SessionEvent::disconnect(id, "backend unavailable"));
                self.finish(&transcript, SessionState::Rejected).await;
                return;
            }
        };

        self.set_state(SessionState::Relaying);
        let backend_writer = backend.writer();
        let reason = self.relay(&transcript, backend).await;

        self.set_state(SessionState::Closing);
        info!("[{}] Closing: {}", id, reason);
        // Attacker leg first, then backend, so the attacker-facing socket
        // never lingers past the session.
        let _ = attacker_writer.close().await;
        let _ = backend_writer.close().await;
        self.events.publish(SessionEvent::disconnect(id, &reason));
        self.finish(&transcript, SessionState::Closed).await;
    }

    async fn finish(&self, transcript: &SessionTranscript, state: SessionState) {
        if let Err(e) = transcript.finalize().await {
            warn!("[{}] Transcript finalize: {}", self.id, e);
        }
        self.set_state(state);
        info!("[{}] Session {}", self.id, state);
    }

    /// Consumes attacker events until authentication resolves.
    async fn authenticate(&mut self) -> AuthPhase {
        let mut attempts: u32 = 0;
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return AuthPhase::Gone {
                        reason: "terminated".to_string(),
                    }
                }
                event = self.attacker.next_event() => event,
            };
            match event {
                None => {
                    return AuthPhase::Gone {
                        reason: "connection closed".to_string(),
                    }
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    return AuthPhase::Gone { reason }
                }
                Some(TransportEvent::AuthAttempt {
                    username,
                    method,
                    secret,
                    reply,
                }) => {
                    if method == Method::Password {
                        attempts += 1;
                    }
                    let index = attempts.max(1);
                    self.events.publish(SessionEvent::auth_attempt(
                        self.id, &username, method, index,
                    ));
                    let decision = self.authenticator.evaluate(index, &username, method, &secret);
                    let accepted = decision == Decision::Accept;
                    self.events.publish(SessionEvent::auth_result(
                        self.id,
                        CredentialAttempt {
                            username: username.clone(),
                            method,
                            secret,
                            accepted,
                            index,
                        },
                    ));
                    match decision {
                        Decision::Accept => {
                            info!("[{}] Decoy auth accepted for '{}'", self.id, username);
                            reply.answer(AuthOutcome::Accept);
                            return AuthPhase::Accepted { username };
                        }
                        Decision::ChallengeMore => reply.answer(AuthOutcome::Deny),
                        Decision::Reject(err) => {
                            debug!("[{}] Auth attempt {} rejected: {}", self.id, index, err);
                            if attempts >= self.settings.max_auth_attempts {
                                reply.answer(AuthOutcome::Disconnect);
                                return AuthPhase::Rejected {
                                    reason: format!(
                                        "attempt limit of {} reached",
                                        self.settings.max_auth_attempts
                                    ),
                                };
                            }
                            reply.answer(AuthOutcome::Deny);
                        }
                    }
                }
                // Channel traffic before auth: the dropped reply slot
                // refuses it on the wire.
                Some(other) => {
                    debug!("[{}] Ignoring pre-auth event: {:?}", self.id, other);
                }
            }
        }
    }

    /// The relaying phase: both legs multiplexed through one loop so the
    /// sub-channel maps never need locking.
    async fn relay(&mut self, transcript: &SessionTranscript, mut backend: TransportChannel) -> String {
        let attacker_writer = self.attacker.writer();
        let backend_writer = backend.writer();
        // Keyed by attacker-side id; backend_index maps the other way.
        let mut channels: HashMap<SubChannelId, SubChannel> = HashMap::new();
        let mut backend_index: HashMap<SubChannelId, SubChannelId> = HashMap::new();
        let mut last_activity = Instant::now();

        loop {
            let deadline = if self.settings.idle_timeout.is_zero() {
                last_activity + Duration::from_secs(86_400 * 365)
            } else {
                last_activity + self.settings.idle_timeout
            };
            let step = tokio::select! {
                _ = self.cancel.cancelled() => RelayStep::Cancelled,
                _ = tokio::time::sleep_until(deadline) => RelayStep::Idle,
                event = self.attacker.next_event() => RelayStep::Attacker(event),
                event = backend.next_event() => RelayStep::Backend(event),
            };
            match step {
                RelayStep::Cancelled => {
                    self.close_remaining(&mut channels, &mut backend_index);
                    return "terminated".to_string();
                }
                RelayStep::Idle => {
                    self.close_remaining(&mut channels, &mut backend_index);
                    return "idle timeout".to_string();
                }
                RelayStep::Attacker(None) => {
                    self.close_remaining(&mut channels, &mut backend_index);
                    return "attacker connection closed".to_string();
                }
                RelayStep::Backend(None) => {
                    self.close_remaining(&mut channels, &mut backend_index);
                    return "backend connection closed".to_string();
                }
                RelayStep::Attacker(Some(event)) => {
                    last_activity = Instant::now();
                    if let Some(reason) = self
                        .on_attacker_event(
                            event,
                            transcript,
                            &*backend_writer,
                            &mut channels,
                            &mut backend_index,
                        )
                        .await
                    {
                        self.close_remaining(&mut channels, &mut backend_index);
                        return reason;
                    }
                }
                RelayStep::Backend(Some(event)) => {
                    last_activity = Instant::now();
                    if let Some(reason) = self
                        .on_backend_event(
                            event,
                            transcript,
                            &*attacker_writer,
                            &mut channels,
                            &mut backend_index,
                        )
                        .await
                    {
                        self.close_remaining(&mut channels, &mut backend_index);
                        return reason;
                    }
                }
            }
        }
    }

    /// Emits close events for channels still open at teardown.
    fn close_remaining(
        &self,
        channels: &mut HashMap<SubChannelId, SubChannel>,
        backend_index: &mut HashMap<SubChannelId, SubChannelId>,
    ) {
        backend_index.clear();
        for (id, ch) in channels.drain() {
            self.events.publish(SessionEvent::channel_close(
                self.id,
                id,
                ch.bytes_in,
                ch.bytes_out,
            ));
        }
    }

    fn record(
        &self,
        transcript: &SessionTranscript,
        id: SubChannelId,
        direction: Direction,
        payload: Vec<u8>,
    ) {
        if let Err(e) = transcript.append(id, direction, payload) {
            debug!("[{}] Transcript append skipped: {}", self.id, e);
        }
    }

    /// Returns a teardown reason when the session must end.
    async fn on_attacker_event(
        &self,
        event: TransportEvent,
        transcript: &SessionTranscript,
        backend: &dyn TransportWriter,
        channels: &mut HashMap<SubChannelId, SubChannel>,
        backend_index: &mut HashMap<SubChannelId, SubChannelId>,
    ) -> Option<String> {
        match event {
            TransportEvent::SessionOpen { id, reply } => {
                match backend.open_session().await {
                    Ok(backend_id) => {
                        let kind = SubChannelKind::Session;
                        self.events.publish(SessionEvent::channel_open(
                            self.id,
                            id,
                            &kind.label(),
                        ));
                        self.record(transcript, id, Direction::Control, b"open session".to_vec());
                        channels.insert(id, SubChannel::new(id, backend_id, kind));
                        backend_index.insert(backend_id, id);
                        reply.accept();
                    }
                    Err(e) => {
                        debug!("[{}] Backend refused session open: {}", self.id, e);
                        reply.refuse();
                    }
                }
                None
            }
            TransportEvent::DirectTcpipOpen {
                id,
                host,
                port,
                originator,
                reply,
            } => {
                match backend
                    .open_direct_tcpip(&host, port, (&originator.0, originator.1))
                    .await
                {
                    Ok(backend_id) => {
                        let kind = SubChannelKind::DirectTcpip {
                            host: host.clone(),
                            port,
                        };
                        self.events.publish(SessionEvent::channel_open(
                            self.id,
                            id,
                            &kind.label(),
                        ));
                        self.record(
                            transcript,
                            id,
                            Direction::Control,
                            format!("open direct-tcpip {}:{}", host, port).into_bytes(),
                        );
                        channels.insert(id, SubChannel::new(id, backend_id, kind));
                        backend_index.insert(backend_id, id);
                        reply.accept();
                    }
                    Err(e) => {
                        debug!("[{}] Backend refused direct-tcpip: {}", self.id, e);
                        reply.refuse();
                    }
                }
                None
            }
            TransportEvent::ChannelRequest { id, request, reply } => {
                let Some(ch) = channels.get_mut(&id) else {
                    reply.refuse();
                    return None;
                };
                match backend.channel_request(ch.backend_id, request.clone()).await {
                    Ok(true) => {
                        match &request {
                            SubChannelRequest::Shell | SubChannelRequest::Pty { .. } => {
                                ch.interactive = true;
                            }
                            SubChannelRequest::Exec { command } => {
                                self.events.publish(SessionEvent::command(
                                    self.id,
                                    id,
                                    String::from_utf8_lossy(command).into_owned(),
                                ));
                            }
                            _ => {}
                        }
                        self.record(
                            transcript,
                            id,
                            Direction::Control,
                            request_note(&request),
                        );
                        reply.accept();
                    }
                    Ok(false) => reply.refuse(),
                    Err(e) => {
                        debug!(
                            "[{}] Backend {} request failed: {}",
                            self.id,
                            request.label(),
                            e
                        );
                        reply.refuse();
                    }
                }
                None
            }
            TransportEvent::Data { id, payload } => {
                let Some(ch) = channels.get_mut(&id) else {
                    return None;
                };
                ch.bytes_in += payload.len() as u64;
                self.record(transcript, id, Direction::AttackerToBackend, payload.clone());
                if ch.interactive {
                    for command in ch.commands.feed(&payload) {
                        self.events
                            .publish(SessionEvent::command(self.id, id, command));
                    }
                }
                match backend.data(ch.backend_id, &payload).await {
                    Ok(()) | Err(TransportError::UnknownSubChannel(_)) => None,
                    Err(e) => {
                        warn!("[{}] Backend write failed: {}", self.id, e);
                        Some("backend write failed".to_string())
                    }
                }
            }
            TransportEvent::ExtendedData { id, ext, payload } => {
                let Some(ch) = channels.get_mut(&id) else {
                    return None;
                };
                ch.bytes_in += payload.len() as u64;
                self.record(transcript, id, Direction::AttackerToBackend, payload.clone());
                let _ = backend.extended_data(ch.backend_id, ext, &payload).await;
                None
            }
            TransportEvent::Eof { id } => {
                if let Some(ch) = channels.get(&id) {
                    let _ = backend.eof(ch.backend_id).await;
                }
                None
            }
            TransportEvent::SubChannelClosed { id } => {
                if let Some(ch) = channels.remove(&id) {
                    backend_index.remove(&ch.backend_id);
                    let _ = backend.close_sub_channel(ch.backend_id).await;
                    self.events.publish(SessionEvent::channel_close(
                        self.id,
                        id,
                        ch.bytes_in,
                        ch.bytes_out,
                    ));
                }
                None
            }
            TransportEvent::AuthAttempt { reply, .. } => {
                // Re-auth after success is not a thing we relay.
                reply.answer(AuthOutcome::Deny);
                None
            }
            TransportEvent::ExitStatus { .. } => None,
            TransportEvent::Disconnected { reason } => {
                Some(format!("attacker disconnected: {}", reason))
            }
        }
    }

    async fn on_backend_event(
        &self,
        event: TransportEvent,
        transcript: &SessionTranscript,
        attacker: &dyn TransportWriter,
        channels: &mut HashMap<SubChannelId, SubChannel>,
        backend_index: &mut HashMap<SubChannelId, SubChannelId>,
    ) -> Option<String> {
        match event {
            TransportEvent::Data { id, payload } => {
                let Some(&attacker_id) = backend_index.get(&id) else {
                    return None;
                };
                if let Some(ch) = channels.get_mut(&attacker_id) {
                    ch.bytes_out += payload.len() as u64;
                }
                self.record(
                    transcript,
                    attacker_id,
                    Direction::BackendToAttacker,
                    payload.clone(),
                );
                match attacker.data(attacker_id, &payload).await {
                    Ok(()) | Err(TransportError::UnknownSubChannel(_)) => None,
                    Err(e) => {
                        warn!("[{}] Attacker write failed: {}", self.id, e);
                        Some("attacker write failed".to_string())
                    }
                }
            }
            TransportEvent::ExtendedData { id, ext, payload } => {
                let Some(&attacker_id) = backend_index.get(&id) else {
                    return None;
                };
                if let Some(ch) = channels.get_mut(&attacker_id) {
                    ch.bytes_out += payload.len() as u64;
                }
                self.record(
                    transcript,
                    attacker_id,
                    Direction::BackendToAttacker,
                    payload.clone(),
                );
                let _ = attacker.extended_data(attacker_id, ext, &payload).await;
                None
            }
            TransportEvent::Eof { id } => {
                if let Some(&attacker_id) = backend_index.get(&id) {
                    let _ = attacker.eof(attacker_id).await;
                }
                None
            }
            TransportEvent::ExitStatus { id, status } => {
                if let Some(&attacker_id) = backend_index.get(&id) {
                    self.record(
                        transcript,
                        attacker_id,
                        Direction::Control,
                        format!("exit-status {}", status).into_bytes(),
                    );
                    let _ = attacker.exit_status(attacker_id, status).await;
                }
                None
            }
            TransportEvent::SubChannelClosed { id } => {
                if let Some(attacker_id) = backend_index.remove(&id) {
                    if let Some(ch) = channels.remove(&attacker_id) {
                        let _ = attacker.close_sub_channel(attacker_id).await;
                        self.events.publish(SessionEvent::channel_close(
                            self.id,
                            attacker_id,
                            ch.bytes_in,
                            ch.bytes_out,
                        ));
                    }
                }
                None
            }
            // The sandbox has no business opening channels towards us;
            // the dropped reply refuses on the wire.
            TransportEvent::SessionOpen { id, .. }
            | TransportEvent::DirectTcpipOpen { id, .. } => {
                debug!("[{}] Refusing backend-initiated sub-channel {}", self.id, id);
                None
            }
            TransportEvent::ChannelRequest { request, .. } => {
                debug!(
                    "[{}] Ignoring backend {} request",
                    self.id,
                    request.label()
                );
                None
            }
            TransportEvent::AuthAttempt { reply, .. } => {
                reply.answer(AuthOutcome::Deny);
                None
            }
            TransportEvent::Disconnected { reason } => {
                Some(format!("backend disconnected: {}", reason))
            }
        }
    }
}

fn request_note(request: &SubChannelRequest) -> Vec<u8> {
    match request {
        SubChannelRequest::Shell => b"shell".to_vec(),
        SubChannelRequest::Exec { command } => {
            let mut note = b"exec ".to_vec();
            note.extend_from_slice(command);
            note
        }
        SubChannelRequest::Subsystem { name } => format!("subsystem {}", name).into_bytes(),
        SubChannelRequest::Pty { term, cols, rows } => {
            format!("pty {} {}x{}", term, cols, rows).into_bytes()
        }
        SubChannelRequest::Env { name, value } => format!("env {}={}", name, value).into_bytes(),
        SubChannelRequest::WindowChange { cols, rows } => {
            format!("window-change {}x{}", cols, rows).into_bytes()
        }
    }
}
