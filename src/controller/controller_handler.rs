use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::configuration::config::{Config, ConfigHandle};
use crate::error_handling::types::ControllerError;
use crate::events::EventBus;
use crate::provisioning::SshBackendProvisioner;
use crate::session_management::registry::SessionRegistry;
use crate::session_management::session::SessionInfo;
use crate::session_management::session_proxy::{ProxySettings, SessionProxy};
use crate::transcript::{FileTranscriptStore, TranscriptRecorder};
use crate::transport::ssh_attacker::{self, ConnectionHook};

/// How long a shutdown waits for cancelled sessions to finish their
/// teardown before giving up on them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the long-lived pieces and accepts sessions into them.
///
/// # Fields Overview
///
/// - `config_handle`: live configuration, re-published on reload
/// - `config_path`: the file SIGHUP re-reads
/// - `registry`: every live session and its termination handle
/// - `events`: the sink fan-out bus
/// - `recorder`: hands out per-session transcript handles
pub struct Controller {
    config_handle: ConfigHandle,
    config_path: PathBuf,
    registry: Arc<SessionRegistry>,
    events: Arc<EventBus>,
    recorder: Arc<TranscriptRecorder>,
}

impl Controller {
    /// Loads the configuration file and wires up the shared subsystems.
    /// Must run inside the runtime; sink drain tasks spawn here.
    pub fn new(config_path: PathBuf) -> Result<Self, ControllerError> {
        let config = Config::from_file(&config_path)?;
        let store = FileTranscriptStore::new(&config.recorder.transcript_dir)
            .map_err(ControllerError::StorageError)?;
        let recorder = Arc::new(TranscriptRecorder::new(
            Arc::new(store),
            config.recorder.clone(),
        ));
        let events = Arc::new(EventBus::new());
        events.apply_config(&config.sinks);
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        Ok(Self {
            config_handle: ConfigHandle::new(config),
            config_path,
            registry,
            events,
            recorder,
        })
    }

    /// Runs the decoy listener until a termination signal arrives, then
    /// drains the live sessions.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let config = self.config_handle.current();
        let ssh_config = ssh_attacker::server_config(&config)
            .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?;
        info!("Decoy SSH service listening on {}", config.listen_addr);
        let mut server = tokio::spawn(ssh_attacker::run_server(
            config.listen_addr.clone(),
            ssh_config,
            self.connection_hook(),
        ));

        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sighup.recv() => self.reload(),
                result = &mut server => {
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(ControllerError::InitializationFailed(format!(
                            "listener failed: {}",
                            e
                        ))),
                        Err(e) => Err(ControllerError::InitializationFailed(format!(
                            "listener task ended abnormally: {}",
                            e
                        ))),
                    };
                }
            }
        }
        server.abort();
        self.drain().await;
        Ok(())
    }

    /// Re-reads the configuration file. On any error the running
    /// configuration stays in force.
    pub fn reload(&self) {
        info!("Reload requested, re-reading {}", self.config_path.display());
        match Config::from_file(&self.config_path) {
            Ok(config) => {
                self.events.apply_config(&config.sinks);
                self.config_handle.publish(config);
            }
            Err(e) => error!("Reload failed, keeping the running configuration: {}", e),
        }
    }

    /// The per-connection entry point handed to the listener. Admission,
    /// configuration snapshot and proxy spawn all happen here.
    pub fn connection_hook(&self) -> ConnectionHook {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let recorder = Arc::clone(&self.recorder);
        let config_handle = self.config_handle.clone();
        Arc::new(move |channel, peer_addr| {
            let id = Uuid::new_v4();
            match registry.register(SessionInfo::new(id, peer_addr)) {
                Ok(cancel) => {
                    // Sessions run on the configuration as of their accept;
                    // reloads only affect sessions accepted afterwards.
                    let config = config_handle.current();
                    let proxy = SessionProxy::new(
                        id,
                        peer_addr,
                        channel,
                        Arc::new(Authenticator::new(config.auth.clone())),
                        Arc::new(SshBackendProvisioner::new(config.backend.clone())),
                        Arc::clone(&recorder),
                        Arc::clone(&events),
                        Arc::clone(&registry),
                        ProxySettings::from_config(&config),
                        cancel,
                    );
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        proxy.run().await;
                        registry.remove(id);
                    });
                }
                Err(_) => {
                    // Over the cap. The attacker just sees the connection
                    // drop, like an overloaded sshd.
                    let writer = channel.writer();
                    tokio::spawn(async move {
                        let _ = writer.close().await;
                    });
                }
            }
        })
    }

    /// Cancels every live session and waits for their teardowns.
    async fn drain(&self) {
        self.registry.terminate_all();
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover = self.registry.count();
        if leftover > 0 {
            warn!("{} sessions still open at shutdown", leftover);
        }
        self.events.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::path::Path;

    use crate::transport::memory::memory_leg;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("guepier.toml");
        let transcripts = dir.join("transcripts");
        let raw = format!(
            r#"
                listen_addr = "127.0.0.1:2222"

                {}

                [backend]
                addr = "127.0.0.1:22"
                username = "sandbox"
                password = "sandbox"

                [recorder]
                transcript_dir = "{}"
            "#,
            body,
            transcripts.display()
        );
        std::fs::write(&path, raw).unwrap();
        path
    }

    #[tokio::test]
    async fn new_registers_configured_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
                [[sinks]]
                name = "ops-log"
                kind = "log"
            "#,
        );
        let controller = Controller::new(path).unwrap();
        assert_eq!(controller.events.sink_names(), vec!["ops-log".to_string()]);
    }

    #[tokio::test]
    async fn reload_swaps_sinks_and_publishes_the_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
                [[sinks]]
                name = "old"
                kind = "log"
            "#,
        );
        let controller = Controller::new(path).unwrap();

        write_config(
            dir.path(),
            r#"
                max_auth_attempts = 7

                [[sinks]]
                name = "new"
                kind = "log"
            "#,
        );
        controller.reload();

        assert_eq!(controller.events.sink_names(), vec!["new".to_string()]);
        assert_eq!(controller.config_handle.current().max_auth_attempts, 7);
    }

    #[tokio::test]
    async fn broken_reload_keeps_the_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "max_auth_attempts = 4");
        let controller = Controller::new(path.clone()).unwrap();

        std::fs::write(&path, "listen_addr = ").unwrap();
        controller.reload();

        assert_eq!(controller.config_handle.current().max_auth_attempts, 4);
    }

    #[tokio::test]
    async fn hook_closes_connections_over_the_session_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "max_sessions = 1");
        let controller = Controller::new(path).unwrap();
        let hook = controller.connection_hook();
        let peer_addr: SocketAddr = "203.0.113.7:40022".parse().unwrap();

        let (first_leg, first) = memory_leg();
        hook(first_leg, peer_addr);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.registry.count(), 1);

        let (second_leg, second) = memory_leg();
        hook(second_leg, peer_addr);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(second.transport_closed());
        assert!(!first.transport_closed());

        controller.registry.terminate_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.registry.count(), 0);
    }
}
