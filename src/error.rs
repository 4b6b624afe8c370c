//! Error types for the relay, the tunnel transport and the agent.
//!
//! Relay-side errors never escape a single registration or request: they are
//! logged and turned into an HTTP status by the handler. Agent errors and
//! [`ConfigError`] are fatal to the process.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while registering a new tunnel connection.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Every generated label collided with a live or reserved hostname.
    #[error("no free subdomain after {attempts} attempts")]
    NamespaceExhausted { attempts: usize },

    /// The greeting line could not be written to the agent.
    #[error("failed to send subdomain to agent: {0}")]
    Greeting(#[source] std::io::Error),

    /// The HTTP/1.1 client handshake over the tunnel socket failed.
    #[error("tunnel handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
}

/// Failures of a single request/response exchange over a tunnel.
///
/// Any of these means the tunnel is unusable and must be evicted.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel connection closed")]
    Closed,

    #[error("tunnel did not answer within {0:?}")]
    Timeout(Duration),

    #[error("tunnel exchange failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Fatal agent failures. The agent never reconnects on its own.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to relay at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to read subdomain from relay: {0}")]
    Greeting(#[source] std::io::Error),

    #[error("relay closed the connection before sending a subdomain")]
    NoGreeting,

    #[error("invalid local target '{url}': {message}")]
    InvalidLocal { url: String, message: String },

    #[error("tunnel failed")]
    Tunnel(#[from] hyper::Error),

    #[error("local server request failed")]
    Local(#[from] hyper_util::client::legacy::Error),

    #[error("could not rewrite request target: {0}")]
    Rewrite(#[from] axum::http::uri::InvalidUriParts),

    #[error("relay closed the tunnel")]
    RelayClosed,
}

/// Errors raised while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("failed to read status template {path}: {source}")]
    Template {
        path: PathBuf,
        source: std::io::Error,
    },
}
