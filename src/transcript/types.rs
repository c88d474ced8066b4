use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which way a frame travelled through the proxy.
///
/// `Control` frames carry session-level annotations (window changes,
/// exit statuses) rather than relayed payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    AttackerToBackend,
    BackendToAttacker,
    Control,
}

impl Direction {
    /// Stable one-byte wire code used by the on-disk record layout.
    pub fn to_wire(self) -> u8 {
        match self {
            Direction::AttackerToBackend => 0,
            Direction::BackendToAttacker => 1,
            Direction::Control => 2,
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::AttackerToBackend),
            1 => Some(Direction::BackendToAttacker),
            2 => Some(Direction::Control),
            _ => None,
        }
    }
}

/// One captured frame, exactly as it will be persisted.
///
/// # Fields Overview
///
/// - `session_id`: the session this frame belongs to
/// - `subchannel_id`: attacker-side sub-channel the bytes moved on
/// - `direction`: attacker-to-backend, backend-to-attacker, or control
/// - `seq`: gapless per-session sequence number, starting at 0
/// - `timestamp`: capture time, microsecond precision
/// - `payload`: the raw bytes, unmodified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFrame {
    pub session_id: Uuid,
    pub subchannel_id: u32,
    pub direction: Direction,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_wire_codes_round_trip() {
        for d in [
            Direction::AttackerToBackend,
            Direction::BackendToAttacker,
            Direction::Control,
        ] {
            assert_eq!(Direction::from_wire(d.to_wire()), Some(d));
        }
        assert_eq!(Direction::from_wire(9), None);
    }
}
