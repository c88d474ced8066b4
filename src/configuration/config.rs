use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::types::*;
use crate::error_handling::types::ConfigError;

/// Application configuration, loaded from a TOML file.
///
/// # Fields Overview
///
/// - `listen_addr`: where the decoy SSH service listens
/// - `server_id`: the SSH version banner presented to attackers
/// - `host_key_path`: PEM/OpenSSH host key; a fresh ephemeral key is
///   generated when absent
/// - `max_sessions`: concurrent session cap, protects the process itself
/// - `max_auth_attempts`: attempts granted before the session is rejected
/// - `idle_timeout_secs`: relay idle cutoff; `0` disables it
/// - `auth`: the decoy [`AuthPolicy`]
/// - `backend`: address and real credentials for the sandboxed backend
/// - `provision`: retry/backoff/timeout policy for backend provisioning
/// - `recorder`: transcript queue and flush tuning
/// - `sinks`: event sink registrations, re-read on reload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthPolicy,
    pub backend: BackendConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

fn default_server_id() -> String {
    // Matches a stock Ubuntu sshd so the banner alone gives nothing away.
    "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.10".to_string()
}

fn default_max_sessions() -> usize {
    256
}

fn default_max_auth_attempts() -> u32 {
    3
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Structural validation beyond what serde can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::BadListenAddr(format!("{}: {}", self.listen_addr, e)))?;
        self.backend
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::BadBackendAddr(format!("{}: {}", self.backend.addr, e)))?;
        if self.max_sessions == 0 {
            return Err(ConfigError::NotInRange(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.max_auth_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        if self.provision.attempts == 0 {
            return Err(ConfigError::NotInRange(
                "provision.attempts must be at least 1".to_string(),
            ));
        }
        if self.recorder.queue_capacity == 0 {
            return Err(ConfigError::NotInRange(
                "recorder.queue_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(path) = &self.host_key_path {
            if !path.exists() {
                return Err(ConfigError::DirectoryDoesNotExist(format!(
                    "host key {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Shared handle through which the running system observes configuration
/// changes.
///
/// Watching the configuration source is an external concern; whoever
/// notices a change (the controller's SIGHUP handler, a test) re-reads the
/// file and calls [`ConfigHandle::publish`]. Subscribers pick up sink
/// registrations and policy parameters without disrupting active sessions.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<Config>,
}

impl ConfigHandle {
    pub fn new(initial: Config) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Config {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.tx.subscribe()
    }

    /// Publishes a validated replacement configuration.
    pub fn publish(&self, config: Config) {
        info!("Configuration update published ({} sinks)", config.sinks.len());
        let _ = self.tx.send(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            listen_addr = "0.0.0.0:2222"

            [backend]
            addr = "127.0.0.1:22"
            username = "sandbox"
            password = "sandbox"
        "#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.idle_timeout_secs, 600);
        assert_eq!(config.auth, AuthPolicy::AcceptAll);
        assert_eq!(config.provision.attempts, 3);
        assert_eq!(config.recorder.queue_capacity, 1024);
        assert!(config.sinks.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let raw = r#"
            listen_addr = "0.0.0.0:2222"
            server_id = "SSH-2.0-OpenSSH_9.6"
            max_sessions = 32
            max_auth_attempts = 5
            idle_timeout_secs = 120

            [auth]
            mode = "accept-after"
            attempts = 2

            [backend]
            addr = "10.0.0.5:22"
            username = "sandbox"
            password = "sandbox"

            [provision]
            attempts = 4
            initial_backoff_ms = 100
            attempt_timeout_secs = 2

            [recorder]
            queue_capacity = 64
            flush_timeout_ms = 50
            transcript_dir = "/var/lib/guepier/transcripts"

            [[sinks]]
            name = "ops-log"
            kind = "log"

            [[sinks]]
            name = "events"
            kind = "json-file"
            path = "/var/lib/guepier/events.jsonl"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.auth, AuthPolicy::AcceptAfter { attempts: 2 });
        assert_eq!(config.sinks.len(), 2);
        assert_eq!(config.sinks[0].kind, SinkKind::Log);
        assert!(matches!(config.sinks[1].kind, SinkKind::JsonFile { .. }));
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let raw = minimal_toml().replace("0.0.0.0:2222", "not-an-address");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadListenAddr(_))
        ));
    }

    #[test]
    fn zero_attempt_budgets_are_rejected() {
        let raw = format!("max_auth_attempts = 0\n{}", minimal_toml());
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn handle_publishes_to_subscribers() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let handle = ConfigHandle::new(config.clone());
        let mut rx = handle.subscribe();

        let mut updated = config;
        updated.max_sessions = 8;
        handle.publish(updated);

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().max_sessions, 8);
    }
}
