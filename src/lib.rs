//! A single-threaded, readiness-driven RFC 6455 WebSocket endpoint and
//! server library.
//!
//! Three layers, leaves first: a pure protocol engine ([`handshake`],
//! [`frame`], [`protocol`], [`utf8`]) that only ever touches byte slices;
//! an [`endpoint`] that binds that engine to a non-blocking socket and
//! implements the closing handshake and ping/pong auto-replies; and a
//! [`server`]/[`client`] pair that multiplex endpoints over a `mio`
//! readiness loop with timer-driven heartbeats and handshake deadlines.
//! Every callback runs inline on the loop thread - there is no internal
//! concurrency and no locking on connection state.

pub mod buffer;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod list;
pub mod message;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod slot;
pub mod timer;
pub mod utf8;

pub use callbacks::{Callbacks, ConnectRequest, ConnectResponse};
pub use client::Client;
pub use config::{ClientOptions, RandFunc, ServerOptions, Settings};
pub use endpoint::{Connection, Endpoint};
pub use error::Error;
pub use message::Message;
pub use server::{Server, ServerStopHandle};
