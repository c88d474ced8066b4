use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Decoy authentication policy.
///
/// `accept-all` gives maximal capture; `fixed` only lets configured pairs
/// in; `accept-after` fails the first N-1 password attempts so the final
/// success looks guessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AuthPolicy {
    AcceptAll,
    Fixed { users: Vec<FixedUser> },
    AcceptAfter { attempts: u32 },
}

impl Default for AuthPolicy {
    fn default() -> Self {
        AuthPolicy::AcceptAll
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedUser {
    pub username: String,
    pub password: String,
}

/// Where the real (sandboxed) backend lives and which credentials the
/// proxy uses on that leg. The attacker's own credentials never reach the
/// backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub addr: String,
    pub username: String,
    pub password: String,
}

/// Retry policy for backend provisioning. A per-attempt timeout is
/// mandatory: the proxy never blocks indefinitely on a provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 250,
            attempt_timeout_secs: 5,
        }
    }
}

/// Transcript recorder tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Frames buffered in memory while storage is slow or down.
    pub queue_capacity: usize,
    /// Longest a finalize/flush may stall a teardown path.
    pub flush_timeout_ms: u64,
    /// Directory the file transcript store writes into.
    pub transcript_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            flush_timeout_ms: 200,
            transcript_dir: PathBuf::from("transcripts"),
        }
    }
}

/// One registered event sink. Sinks can be added or removed at reload
/// without touching active sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SinkKind {
    /// Mirror events into the operational log.
    Log,
    /// Append events as JSON lines to a file.
    JsonFile { path: PathBuf },
}

/// Per-sink queue depth; events beyond this are dropped for that sink only.
pub const SINK_QUEUE_CAPACITY: usize = 256;
