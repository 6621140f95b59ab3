//! Application callback surface (spec.md §9 "Callbacks as polymorphism"):
//! a capability interface in place of the source's function-pointer
//! struct. The auto-pong and close-ack behaviors run in [`Endpoint::read`]
//! around these calls, never inside them, so an application cannot observe
//! a ping without the pong already having been queued for a later flush.

use crate::endpoint::Connection;
use crate::handshake::HeaderSet;
use crate::message::Message;

/// The incoming handshake request, handed to `on_connect` so the
/// application can inspect offered subprotocols/extensions and any other
/// header before choosing.
pub struct ConnectRequest<'a> {
    pub resource: &'a str,
    pub headers: &'a HeaderSet,
}

impl<'a> ConnectRequest<'a> {
    pub fn offered_subprotocols(&self) -> Vec<&'a str> {
        self.headers.get_values("Sec-WebSocket-Protocol")
    }

    pub fn offered_extensions(&self) -> Vec<&'a str> {
        self.headers.get_values("Sec-WebSocket-Extensions")
    }
}

/// The application's accept decision: which subprotocol/extensions (if
/// any, from those offered) to echo back in the response.
#[derive(Debug, Clone, Default)]
pub struct ConnectResponse {
    pub subprotocol: Option<String>,
    pub extensions: Vec<String>,
}

/// Per-server (or per-client) callback set, shared across every connection
/// it owns; `U` is the opaque per-connection userdata type (spec.md §6
/// "userdata").
pub trait Callbacks<U> {
    /// Called once the handshake request has parsed successfully.
    /// Returning `None` rejects the connection (spec.md §6: "Return false
    /// rejects; rejection closes with code 1002 and no response body").
    fn on_connect(&mut self, _conn: &mut Connection<'_, U>, _request: &ConnectRequest) -> Option<ConnectResponse> {
        Some(ConnectResponse::default())
    }

    /// Called after the handshake response has been queued (server) or
    /// verified (client).
    fn on_open(&mut self, _conn: &mut Connection<'_, U>) {}

    fn on_message(&mut self, _conn: &mut Connection<'_, U>, _message: Message) {}

    /// The pong auto-reply is queued strictly after this returns.
    fn on_ping(&mut self, _conn: &mut Connection<'_, U>, _payload: &[u8]) {}

    fn on_pong(&mut self, _conn: &mut Connection<'_, U>, _payload: &[u8]) {}

    /// Called exactly once per connection, regardless of how it ended.
    fn on_close(&mut self, _conn: &mut Connection<'_, U>, _code: u16, _reason: &str) {}
}
