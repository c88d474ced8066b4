//! Decoy authentication.
//!
//! The honeypot never checks credentials against anything real: the
//! [`authenticator::Authenticator`] only decides, per configured policy,
//! whether an attempt is *pretended* to succeed. Every attempt is evaluated
//! independently and surfaces as a distinct
//! [`authenticator::CredentialAttempt`].

pub mod authenticator;

pub use authenticator::{Authenticator, CredentialAttempt, Decision, Method, Secret};
