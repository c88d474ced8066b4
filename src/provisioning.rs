//! Backend provisioning.
//!
//! The proxy consumes a [`provisioner::BackendProvisioner`]: something
//! that can produce a ready, authenticated backend leg for a session.
//! Provisioning failures are retried with capped backoff and a hard
//! per-attempt timeout; the attacker never observes anything but latency
//! until the budget runs out.

pub mod provisioner;
pub mod ssh_provisioner;

pub use provisioner::{provision_with_retry, BackendProvisioner, SessionParams};
pub use ssh_provisioner::SshBackendProvisioner;
