//! Transcript capture subsystem.
//!
//! Every frame relayed through a session proxy lands here: the recorder
//! assigns per-session, gapless sequence numbers, buffers frames through a
//! bounded in-memory queue so storage hiccups never stall the relay, and a
//! pluggable append-only store persists them in a stable record layout that
//! replay tooling reads back sequentially.

pub mod recorder;
pub mod store;
pub mod types;

pub use recorder::{SessionTranscript, TranscriptRecorder};
pub use store::{replay_streams, FileTranscriptStore, TranscriptStore};
pub use types::{Direction, TranscriptFrame};
