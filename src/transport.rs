//! Session transport.
//!
//! A [`channel::TransportChannel`] is one leg of a session: an ordered
//! event stream coming from the peer plus a [`channel::TransportWriter`]
//! for everything we push back. The proxy never touches SSH directly; the
//! attacker-facing server leg (`ssh_attacker`), the backend client leg
//! (`ssh_backend`) and the in-process test leg (`memory`) all speak this
//! one interface.

pub mod channel;
pub mod memory;
pub mod ssh_attacker;
pub mod ssh_backend;
pub mod types;

pub use channel::{TransportChannel, TransportWriter};
pub use types::{
    AuthOutcome, AuthReply, ReplySlot, SubChannelId, SubChannelRequest, TransportEvent,
};
