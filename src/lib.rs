#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! merf library — relay and agent building blocks for subdomain reverse tunnels.
//!
//! - `tunnel` — registry, routing, wire transport, relay and agent
//! - `routes` — the relay's own base-domain routes (status, health)
//! - `config` — configuration loading
//! - `error` — error types

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tunnel;

pub use config::Config;
pub use error::{AgentError, ConfigError, RegistryError, TunnelError};
pub use state::RelayState;
pub use tunnel::agent::{Agent, LocalTarget};
pub use tunnel::registry::{Registry, RegistrySettings};
