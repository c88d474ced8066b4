//! Session event pipeline.
//!
//! Proxies publish structured lifecycle events; the bus fans them out to
//! every registered sink through one bounded queue per sink, so a slow or
//! failing sink never stalls a session or its sibling sinks.

pub mod command_parser;
pub mod fanout;
pub mod sinks;
pub mod types;

pub use command_parser::CommandBuffer;
pub use fanout::{EventBus, EventSink};
pub use types::{EventKind, SessionEvent};
