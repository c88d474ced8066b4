//! SSH interception honeypot.
//!
//! A decoy SSH server accepts attacker connections, pretends their
//! credentials worked, and transparently relays the session to a
//! sandboxed backend over a second SSH leg. Every relayed frame is
//! captured into an ordered transcript and the session's lifecycle is
//! published to pluggable event sinks.

pub mod auth;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod events;
pub mod provisioning;
pub mod session_management;
pub mod transcript;
pub mod transport;
