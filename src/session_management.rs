//! Session management core module.
//!
//! A session is one attacker connection and everything attached to it:
//! the mirrored backend leg, the transcript, the event trail. The proxy
//! drives each session through its lifecycle; the registry tracks what is
//! alive and can terminate it.

use serde::{Deserialize, Serialize};

/// Submodule for session data structures and utilities.
pub mod session;
/// Submodule for the live-session registry.
pub mod registry;
/// Submodule for the interception proxy state machine.
pub mod session_proxy;

/// Lifecycle state of a session.
///
/// The happy path runs top to bottom; `Rejected` is the terminal state
/// for sessions that never reached relaying, whether authentication
/// failed or no backend could be provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Connection accepted, SSH handshake in progress.
    Accepting,
    /// Credential attempts are being evaluated.
    Authenticating,
    /// Decoy auth succeeded, backend being provisioned.
    Provisioning,
    /// Both legs up, frames flowing.
    Relaying,
    /// Teardown started, flushing and closing.
    Closing,
    Closed,
    /// Authentication never succeeded.
    Rejected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Accepting => "accepting",
            SessionState::Authenticating => "authenticating",
            SessionState::Provisioning => "provisioning",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        };
        write!(f, "{}", name)
    }
}
