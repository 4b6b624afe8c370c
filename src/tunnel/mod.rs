//! Reverse tunnel over a single persistent TCP connection per agent.
//!
//! - **Relay** ([`relay`]): accepts agent tunnels on the control port and
//!   proxies public HTTP traffic to them by Host header.
//! - **Agent** ([`agent`]): dials the relay, receives a subdomain, and
//!   forwards tunneled requests to a local HTTP server.
//!
//! [`registry`], [`router`], [`naming`] and [`transport`] are the relay's
//! building blocks.

pub mod agent;
pub mod naming;
pub mod registry;
pub mod relay;
pub mod router;
pub mod transport;
