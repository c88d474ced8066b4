//! Process orchestration.
//!
//! The controller owns everything with process lifetime: configuration,
//! the transcript recorder, the event bus, the session registry and the
//! decoy listener. Signals are handled here; sessions themselves never
//! see them.

pub mod controller_handler;

pub use controller_handler::Controller;
