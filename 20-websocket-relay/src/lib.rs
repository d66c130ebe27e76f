//! WebSocket relay: every message a client sends is passed on to every
//! other connected client.
//!
//! - [`hub`] owns the set of live connections. One control loop serializes
//!   registration, unregistration and broadcast fan-out, and drops clients
//!   whose outbound queue is full instead of waiting for them.
//! - [`connection`] runs the per-connection read and write tasks.
//! - [`origin`] decides which cross-origin handshakes are accepted.
//! - [`server`] mounts the WebSocket endpoint and static files on an axum
//!   router.
//! - [`cli`] parses the `serve` and `client` subcommands.
//! - [`client`] is a small terminal client for trying the relay out.
//!
//! Payloads are opaque: the relay never looks inside a text or binary frame.

pub mod cli;
pub mod client;
pub mod connection;
pub mod hub;
pub mod origin;
pub mod server;
