use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadListenAddr(String),
    BadBackendAddr(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadListenAddr(e) => write!(f, "Listen address error: {}", e),
            ConfigError::BadBackendAddr(e) => write!(f, "Backend address error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Transport-leg failures. Always confined to one leg of one session.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the stream cleanly.
    Closed,
    /// Handshake or key exchange failed before the transport became usable.
    Handshake(String),
    /// The multiplexing layer saw something it cannot carry.
    Protocol(String),
    /// No sub-channel with that id is open on this leg.
    UnknownSubChannel(u32),
    IoError(std::io::Error),
    SshError(russh::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Transport closed by peer"),
            TransportError::Handshake(e) => write!(f, "Transport handshake failed: {}", e),
            TransportError::Protocol(e) => write!(f, "Transport protocol error: {}", e),
            TransportError::UnknownSubChannel(id) => write!(f, "Unknown sub-channel id {}", id),
            TransportError::IoError(e) => write!(f, "Transport IO error: {}", e),
            TransportError::SshError(e) => write!(f, "SSH transport error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err)
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::SshError(err)
    }
}

/// Diagnostic codes attached to rejected credential attempts.
///
/// Malformed input is a rejection, never a crash (the decoy must keep
/// talking to the attacker no matter what is thrown at it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MalformedCredential(String),
    PolicyDenied,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MalformedCredential(e) => write!(f, "Malformed credential: {}", e),
            AuthError::PolicyDenied => write!(f, "Denied by decoy policy"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum ProvisionError {
    Unreachable(std::io::Error),
    Handshake(String),
    AuthFailed,
    Refused(String),
    /// All configured attempts were spent; terminal for the session.
    Exhausted(u32),
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::Unreachable(e) => write!(f, "Backend unreachable: {}", e),
            ProvisionError::Handshake(e) => write!(f, "Backend handshake failed: {}", e),
            ProvisionError::AuthFailed => write!(f, "Backend rejected our credentials"),
            ProvisionError::Refused(e) => write!(f, "Backend refused provisioning: {}", e),
            ProvisionError::Exhausted(n) => {
                write!(f, "Backend provisioning exhausted after {} attempts", n)
            }
        }
    }
}

impl std::error::Error for ProvisionError {}

impl From<std::io::Error> for ProvisionError {
    fn from(err: std::io::Error) -> Self {
        ProvisionError::Unreachable(err)
    }
}

#[derive(Debug)]
pub enum StorageError {
    WriteFailed,
    ReadFailed,
    Corrupt(String),
    NotFound,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::Corrupt(e) => write!(f, "Storage record corrupt: {}", e),
            StorageError::NotFound => write!(f, "Storage record not found"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum RecorderError {
    /// Degraded-mode signal: the bounded queue overflowed and old frames
    /// were dropped. The session keeps relaying.
    Overflow(u64),
    /// A frame arrived with a sequence number below the last accepted one.
    OutOfOrder { expected: u64, got: u64 },
    StorageError(StorageError),
    Finalized,
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::Overflow(n) => {
                write!(f, "Recorder queue overflow, {} frames dropped", n)
            }
            RecorderError::OutOfOrder { expected, got } => {
                write!(f, "Out-of-order append: expected seq >= {}, got {}", expected, got)
            }
            RecorderError::StorageError(e) => write!(f, "Recorder storage error: {}", e),
            RecorderError::Finalized => write!(f, "Recorder already finalized"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<StorageError> for RecorderError {
    fn from(err: StorageError) -> Self {
        RecorderError::StorageError(err)
    }
}

#[derive(Debug)]
pub enum SinkError {
    Unavailable(String),
    SerializationFailed(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Unavailable(e) => write!(f, "Sink unavailable: {}", e),
            SinkError::SerializationFailed(e) => write!(f, "Sink serialization failed: {}", e),
        }
    }
}

impl std::error::Error for SinkError {}

#[derive(Debug)]
pub enum SessionError {
    SessionLimitReached,
    NotFound,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::SessionLimitReached => write!(f, "Session limit reached"),
            SessionError::NotFound => write!(f, "Session not found"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}
