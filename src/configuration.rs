//! Runtime configuration.
//!
//! Submodules:
//! - `types`: the individual configuration sections.
//! - `config`: the top-level [`config::Config`] struct, TOML loading,
//!   validation and the hot-reload handle.

pub mod config;
pub mod types;
