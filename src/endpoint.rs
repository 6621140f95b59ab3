//! Per-connection state machine binding the protocol engine to a
//! non-blocking socket (spec.md §4.4). An `Endpoint` owns its buffers and
//! drives the handshake codec and frame assembler; it never touches the fd
//! itself except through the `Read`/`Write` impl handed to `read`/`write`,
//! so it can be driven by mio, a plain `TcpStream`, or a test double.

use std::io::{self, Read, Write};

use base64::prelude::*;
use log::warn;

use crate::callbacks::{Callbacks, ConnectRequest};
use crate::config::Settings;
use crate::error::Error;
use crate::frame::{OpCode, Role};
use crate::handshake::{self, HeaderSet, ParseOutcome as HandshakeOutcome};
use crate::message::Message;
use crate::protocol::{FrameAssembler, FrameEvent};

const READ_CHUNK: usize = 64 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

/// Where a connection sits in the handshake/application lifecycle
/// (spec.md §3 "Protocol connection state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadHandshake,
    WriteHandshake,
    Connected,
    Closed,
}

/// Result of pumping [`Endpoint::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were consumed; the caller should keep readable readiness
    /// armed.
    Progressed,
    /// The socket would block; nothing more to do until it's readable
    /// again.
    WouldBlock,
    /// The connection finished its close handshake (or was force-closed);
    /// `on_close` has already fired. Release the fd.
    Closed,
}

/// Result of pumping [`Endpoint::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Partial write; keep writable readiness armed.
    Continue,
    /// Write buffer fully drained; disarm writable readiness.
    Done,
    /// The close handshake completed as the write drained; `on_close` has
    /// already fired. Release the fd.
    Closed,
}

/// A handle an application callback uses to act on the connection that
/// invoked it - the capability surface of spec.md §6 ("Per-connection
/// operations").
pub struct Connection<'a, U> {
    endpoint: &'a mut Endpoint<U>,
}

impl<'a, U> Connection<'a, U> {
    pub fn send_msg(&mut self, message: Message) -> Result<(), Error> {
        self.endpoint.send_msg(message)
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<(), Error> {
        self.send_msg(Message::Text(text.into()))
    }

    pub fn send_binary(&mut self, bytes: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send_msg(Message::Binary(bytes.into()))
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.endpoint.send_control(OpCode::Ping, payload)
    }

    pub fn send_pong(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.endpoint.send_control(OpCode::Pong, payload)
    }

    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        self.endpoint.enqueue_close(code, reason)
    }

    pub fn get_subprotocol(&self) -> Option<&str> {
        self.endpoint.negotiated_subprotocol.as_deref()
    }

    pub fn get_extensions(&self) -> &[String] {
        &self.endpoint.negotiated_extensions
    }

    pub fn get_header_values(&self, name: &str) -> Vec<&str> {
        self.endpoint
            .request_headers
            .as_ref()
            .map(|h| h.get_values(name))
            .unwrap_or_default()
    }

    pub fn userdata(&self) -> &U {
        &self.endpoint.userdata
    }

    pub fn userdata_mut(&mut self) -> &mut U {
        &mut self.endpoint.userdata
    }

    pub fn set_userdata(&mut self, value: U) {
        self.endpoint.userdata = value;
    }
}

/// A client-side handshake request waiting to be queued once the endpoint
/// is driven for the first time.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub resource: String,
    pub host: String,
    pub subprotocols: Vec<String>,
    pub extensions: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
}

/// Per-connection state: buffers, protocol state machine, and the close
/// handshake flags (spec.md §4.3/§4.4).
pub struct Endpoint<U> {
    role: Role,
    state: ConnState,
    settings: Settings,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_cursor: usize,
    handshake_buf: Vec<u8>,
    assembler: FrameAssembler,

    close_send_pending: bool,
    close_sent: bool,
    close_received: bool,
    should_fail: bool,
    /// The peer's close code/reason, once a `CLOSE` frame has been received
    /// (spec.md §7: `on_close` reports "the best-known close code and
    /// reason"). `None` when we initiated the close or never got a reply.
    peer_close: Option<(u16, String)>,
    /// Set when a `PONG` has been processed since the last
    /// `take_pong_received()` call, so the server's heartbeat tracker can
    /// clear a slot's `Pending` state without the endpoint knowing anything
    /// about heartbeats itself.
    pong_received: bool,

    negotiated_subprotocol: Option<String>,
    negotiated_extensions: Vec<String>,
    request_headers: Option<HeaderSet>,
    stashed_key_b64: Option<String>,
    pending_client_handshake: Option<ClientHandshake>,

    pub userdata: U,
}

impl<U> Endpoint<U> {
    pub fn new_server(settings: Settings, userdata: U) -> Self {
        let init_len = settings.init_buf_len;
        Self {
            role: Role::Server,
            state: ConnState::ReadHandshake,
            settings,
            read_buf: Vec::with_capacity(init_len),
            write_buf: Vec::with_capacity(init_len),
            write_cursor: 0,
            handshake_buf: Vec::new(),
            assembler: FrameAssembler::new(),
            close_send_pending: false,
            close_sent: false,
            close_received: false,
            should_fail: false,
            peer_close: None,
            pong_received: false,
            negotiated_subprotocol: None,
            negotiated_extensions: Vec::new(),
            request_headers: None,
            stashed_key_b64: None,
            pending_client_handshake: None,
            userdata,
        }
    }

    pub fn new_client(settings: Settings, handshake: ClientHandshake, userdata: U) -> Self {
        let init_len = settings.init_buf_len;
        Self {
            role: Role::Client,
            state: ConnState::WriteHandshake,
            settings,
            read_buf: Vec::with_capacity(init_len),
            write_buf: Vec::with_capacity(init_len),
            write_cursor: 0,
            handshake_buf: Vec::new(),
            assembler: FrameAssembler::new(),
            close_send_pending: false,
            close_sent: false,
            close_received: false,
            should_fail: false,
            peer_close: None,
            pong_received: false,
            negotiated_subprotocol: None,
            negotiated_extensions: Vec::new(),
            request_headers: None,
            stashed_key_b64: None,
            pending_client_handshake: Some(handshake),
            userdata,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Reports and clears whether a `PONG` has arrived since the last call,
    /// so a heartbeat tracker can mark the connection live without the
    /// endpoint itself knowing about heartbeats (spec.md §4.5).
    pub fn take_pong_received(&mut self) -> bool {
        std::mem::replace(&mut self.pong_received, false)
    }

    /// Whether bytes remain unflushed, i.e. writable readiness should stay
    /// armed.
    pub fn has_pending_write(&self) -> bool {
        self.write_cursor < self.write_buf.len()
    }

    /// Queue the client's handshake request onto the write buffer. Called
    /// once, the first time the connecting socket becomes writable
    /// (spec.md §4.6); a no-op if already queued.
    pub fn queue_client_handshake(&mut self) {
        let Some(hs) = self.pending_client_handshake.take() else {
            return;
        };
        let mut key = [0u8; 16];
        self.settings.rand_func.fill(&mut key);
        let key_b64 = BASE64_STANDARD.encode(key);
        let bytes = handshake::build_request(
            &hs.resource,
            &hs.host,
            &key_b64,
            &hs.subprotocols,
            &hs.extensions,
            &hs.extra_headers,
        );
        self.stashed_key_b64 = Some(key_b64);
        self.write_buf.extend_from_slice(&bytes);
    }

    // --- outgoing -----------------------------------------------------

    fn mask_key_gen(&self) -> Option<impl FnMut() -> [u8; 4]> {
        match self.role {
            Role::Client => {
                let rand = self.settings.rand_func.clone();
                Some(move || rand.next_u32())
            }
            Role::Server => None,
        }
    }

    pub fn send_msg(&mut self, message: Message) -> Result<(), Error> {
        if self.close_send_pending {
            return Ok(());
        }
        let mut gen = self.mask_key_gen();
        let mut bytes = Vec::new();
        crate::protocol::serialize_outgoing(
            &mut bytes,
            &message,
            self.settings.write_max_frame_size,
            gen.as_mut().map(|g| g as &mut dyn FnMut() -> [u8; 4]),
        )?;
        self.write_buf.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OpCode::Ping, payload)
    }

    pub fn send_pong(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OpCode::Pong, payload)
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        if self.close_send_pending {
            return Ok(());
        }
        let mut gen = self.mask_key_gen();
        let mut bytes = Vec::new();
        crate::protocol::serialize_control(
            &mut bytes,
            opcode,
            payload,
            gen.as_mut().map(|g| g as &mut dyn FnMut() -> [u8; 4]),
        );
        self.write_buf.extend_from_slice(&bytes);
        Ok(())
    }

    /// Enqueue our close frame. Per spec.md §4.3, once queued all further
    /// sends are silently dropped; a second call to `close` is itself a
    /// no-op.
    pub fn enqueue_close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        if self.close_send_pending {
            return Ok(());
        }
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        let mut gen = self.mask_key_gen();
        let mut bytes = Vec::new();
        crate::protocol::serialize_control(
            &mut bytes,
            OpCode::Close,
            &payload,
            gen.as_mut().map(|g| g as &mut dyn FnMut() -> [u8; 4]),
        );
        self.write_buf.extend_from_slice(&bytes);
        self.close_send_pending = true;
        Ok(())
    }

    fn fail_connection(&mut self, err: &Error) {
        if let Some(code) = err.close_code() {
            let _ = self.enqueue_close(code, "");
        }
        if self.settings.fail_by_drop {
            self.should_fail = true;
        }
    }

    // --- reading --------------------------------------------------------

    /// Pull up to 64 KiB into the read buffer, then drive the parser
    /// (handshake or frame, depending on state) until it runs out of
    /// complete units to process (spec.md §4.4 `read(fd)`).
    pub fn read<S: Read>(
        &mut self,
        stream: &mut S,
        callbacks: &mut dyn Callbacks<U>,
    ) -> Result<ReadOutcome, Error> {
        let start = self.read_buf.len();
        self.read_buf.resize(start + READ_CHUNK, 0);
        let mut would_block = false;
        match stream.read(&mut self.read_buf[start..]) {
            Ok(0) => {
                self.read_buf.truncate(start);
                return self.handle_eof(callbacks);
            }
            Ok(n) => self.read_buf.truncate(start + n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.read_buf.truncate(start);
                would_block = true;
            }
            Err(e) => {
                self.read_buf.truncate(start);
                return self.handle_io_error(callbacks, e);
            }
        };

        // Even on WouldBlock there may be bytes left over from a state
        // transition (e.g. pipelined frame bytes that arrived alongside a
        // handshake and are only now eligible for parsing), so the parser
        // always gets a chance to run over whatever is already buffered.
        match self.pump(callbacks) {
            Ok(()) => {
                if self.state == ConnState::Closed {
                    Ok(ReadOutcome::Closed)
                } else if would_block {
                    Ok(ReadOutcome::WouldBlock)
                } else {
                    Ok(ReadOutcome::Progressed)
                }
            }
            Err(err) => {
                self.fail_connection(&err);
                if self.should_fail {
                    self.force_close(callbacks, err.close_code().unwrap_or(1002), "");
                    Ok(ReadOutcome::Closed)
                } else {
                    Ok(ReadOutcome::Progressed)
                }
            }
        }
    }

    fn handle_eof(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<ReadOutcome, Error> {
        self.force_close(callbacks, 0, "");
        Ok(ReadOutcome::Closed)
    }

    fn handle_io_error(
        &mut self,
        callbacks: &mut dyn Callbacks<U>,
        err: io::Error,
    ) -> Result<ReadOutcome, Error> {
        warn!("socket I/O error: {err}");
        self.force_close(callbacks, 0, "");
        Ok(ReadOutcome::Closed)
    }

    /// Force the connection closed without a close-frame exchange -
    /// socket errors, EOF, heartbeat expiry, and handshake timeouts all
    /// go through here (spec.md §7). Fires `on_close` exactly once.
    pub fn force_close(&mut self, callbacks: &mut dyn Callbacks<U>, code: u16, reason: &str) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let reason = reason.to_string();
        let mut conn = Connection { endpoint: self };
        callbacks.on_close(&mut conn, code, &reason);
    }

    /// Drive the handshake or frame parser over whatever is currently
    /// buffered, dispatching callbacks as units complete.
    fn pump(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<(), Error> {
        loop {
            match self.state {
                ConnState::ReadHandshake if self.role == Role::Server => {
                    if !self.pump_server_handshake(callbacks)? {
                        return Ok(());
                    }
                }
                ConnState::ReadHandshake => {
                    if !self.pump_client_handshake(callbacks)? {
                        return Ok(());
                    }
                }
                ConnState::WriteHandshake => return Ok(()),
                ConnState::Connected => {
                    if !self.pump_frames(callbacks)? {
                        return Ok(());
                    }
                }
                ConnState::Closed => return Ok(()),
            }
        }
    }

    fn pump_server_handshake(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<bool, Error> {
        self.handshake_buf.extend_from_slice(&self.read_buf);
        self.read_buf.clear();

        let outcome = handshake::parse_request(&self.handshake_buf, self.settings.max_handshake_size)?;
        let (request, consumed) = match outcome {
            HandshakeOutcome::Continue => return Ok(false),
            HandshakeOutcome::Complete { value, consumed } => (value, consumed),
        };

        let key = handshake::validate_request(&request.headers)?;
        let key = key.to_string();

        let decision = {
            let connect_request = ConnectRequest {
                resource: &request.resource,
                headers: &request.headers,
            };
            let mut conn = Connection { endpoint: self };
            callbacks.on_connect(&mut conn, &connect_request)
        };
        self.request_headers = Some(request.headers);

        self.handshake_buf.drain(0..consumed);

        let Some(decision) = decision else {
            return Err(Error::ConnectionRejected);
        };

        self.negotiated_subprotocol = decision.subprotocol.clone();
        self.negotiated_extensions = decision.extensions.clone();

        let response = handshake::build_response(
            &key,
            decision.subprotocol.as_deref(),
            (!decision.extensions.is_empty())
                .then(|| decision.extensions.join(", "))
                .as_deref(),
        );
        self.write_buf.extend_from_slice(&response);
        self.state = ConnState::WriteHandshake;
        self.read_buf.extend_from_slice(&self.handshake_buf);
        self.handshake_buf.clear();
        Ok(false)
    }

    fn pump_client_handshake(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<bool, Error> {
        self.handshake_buf.extend_from_slice(&self.read_buf);
        self.read_buf.clear();

        let outcome = handshake::parse_response(&self.handshake_buf, self.settings.max_handshake_size)?;
        let (response, consumed) = match outcome {
            HandshakeOutcome::Continue => return Ok(false),
            HandshakeOutcome::Complete { value, consumed } => (value, consumed),
        };

        let stashed = self.stashed_key_b64.clone().unwrap_or_default();
        handshake::validate_response(&response.headers, response.status, &stashed)?;

        self.negotiated_subprotocol = response
            .headers
            .get_first("Sec-WebSocket-Protocol")
            .map(|s| s.to_string());
        self.negotiated_extensions = response
            .headers
            .get_values("Sec-WebSocket-Extensions")
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        self.request_headers = Some(response.headers);

        self.handshake_buf.drain(0..consumed);
        self.read_buf.extend_from_slice(&self.handshake_buf);
        self.handshake_buf.clear();

        self.state = ConnState::Connected;
        let mut conn = Connection { endpoint: self };
        callbacks.on_open(&mut conn);
        Ok(true)
    }

    fn pump_frames(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<bool, Error> {
        let outcome = self.assembler.process_next(&self.read_buf, self.role, &self.settings)?;
        let (consumed, event) = match outcome {
            None => return Ok(false),
            Some(v) => v,
        };
        self.read_buf.drain(0..consumed);

        let Some(event) = event else {
            return Ok(true);
        };

        match event {
            FrameEvent::Message(message) => {
                let mut conn = Connection { endpoint: self };
                callbacks.on_message(&mut conn, message);
            }
            FrameEvent::Ping(payload) => {
                {
                    let mut conn = Connection { endpoint: self };
                    callbacks.on_ping(&mut conn, &payload);
                }
                self.send_control(OpCode::Pong, &payload)?;
            }
            FrameEvent::Pong(payload) => {
                self.pong_received = true;
                let mut conn = Connection { endpoint: self };
                callbacks.on_pong(&mut conn, &payload);
            }
            FrameEvent::Close(info) => {
                self.close_received = true;
                let code = info.code.unwrap_or(1000);
                self.peer_close = Some((code, info.reason.clone()));
                if !self.close_send_pending {
                    self.enqueue_close(code, &info.reason)?;
                } else if self.close_sent {
                    self.state = ConnState::Closed;
                    let mut conn = Connection { endpoint: self };
                    callbacks.on_close(&mut conn, code, &info.reason);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // --- writing --------------------------------------------------------

    /// Flush buffered bytes, advancing `write_cursor` (spec.md §4.4
    /// `write(fd)`).
    pub fn write<S: Write>(
        &mut self,
        stream: &mut S,
        callbacks: &mut dyn Callbacks<U>,
    ) -> Result<WriteOutcome, Error> {
        if self.write_cursor >= self.write_buf.len() {
            return Ok(WriteOutcome::Done);
        }

        let end = (self.write_cursor + WRITE_CHUNK).min(self.write_buf.len());
        match stream.write(&self.write_buf[self.write_cursor..end]) {
            Ok(0) => Ok(WriteOutcome::Continue),
            Ok(n) => {
                self.write_cursor += n;
                self.after_write_progress(callbacks)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::Continue),
            Err(e) => {
                warn!("socket I/O error: {e}");
                self.force_close(callbacks, 0, "");
                Ok(WriteOutcome::Closed)
            }
        }
    }

    fn after_write_progress(&mut self, callbacks: &mut dyn Callbacks<U>) -> Result<WriteOutcome, Error> {
        if self.write_cursor < self.write_buf.len() {
            return Ok(WriteOutcome::Continue);
        }

        match self.state {
            ConnState::WriteHandshake => {
                self.write_buf.clear();
                self.write_cursor = 0;
                match self.role {
                    Role::Server => {
                        self.state = ConnState::Connected;
                        let mut conn = Connection { endpoint: self };
                        callbacks.on_open(&mut conn);
                    }
                    Role::Client => {
                        self.state = ConnState::ReadHandshake;
                    }
                }
                Ok(WriteOutcome::Done)
            }
            _ if self.close_send_pending && !self.close_sent => {
                self.close_sent = true;
                self.write_buf.clear();
                self.write_cursor = 0;
                if self.close_received || self.should_fail {
                    self.state = ConnState::Closed;
                    let (code, reason) = self.peer_close.clone().unwrap_or((1000, String::new()));
                    let mut conn = Connection { endpoint: self };
                    callbacks.on_close(&mut conn, code, &reason);
                    Ok(WriteOutcome::Closed)
                } else {
                    Ok(WriteOutcome::Done)
                }
            }
            _ => {
                self.write_buf.clear();
                self.write_cursor = 0;
                Ok(WriteOutcome::Done)
            }
        }
    }

    /// Scrub per-connection state for slot reuse, keeping the buffers'
    /// allocations (spec.md §4.4 `reset()`).
    pub fn reset(&mut self, userdata: U) {
        self.state = if self.role == Role::Server {
            ConnState::ReadHandshake
        } else {
            ConnState::WriteHandshake
        };
        self.read_buf.clear();
        self.write_buf.clear();
        self.write_cursor = 0;
        self.handshake_buf.clear();
        self.assembler = FrameAssembler::new();
        self.close_send_pending = false;
        self.close_sent = false;
        self.close_received = false;
        self.should_fail = false;
        self.peer_close = None;
        self.pong_received = false;
        self.negotiated_subprotocol = None;
        self.negotiated_extensions.clear();
        self.request_headers = None;
        self.stashed_key_b64 = None;
        self.pending_client_handshake = None;
        self.userdata = userdata;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::collections::VecDeque;

    struct Pipe {
        inbound: VecDeque<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"));
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        opened: bool,
        messages: Vec<Message>,
        closed: Option<u16>,
    }

    impl Callbacks<()> for RecordingCallbacks {
        fn on_open(&mut self, _conn: &mut Connection<'_, ()>) {
            self.opened = true;
        }
        fn on_message(&mut self, _conn: &mut Connection<'_, ()>, message: Message) {
            self.messages.push(message);
        }
        fn on_close(&mut self, _conn: &mut Connection<'_, ()>, code: u16, _reason: &str) {
            self.closed = Some(code);
        }
    }

    #[test]
    fn server_handshake_then_message_round_trip() {
        let request = b"GET /chat HTTP/1.1\r\n\
Host: x\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";
        let mut frame = Vec::new();
        let mut gen = || [0x12u8, 0x34, 0x56, 0x78];
        crate::frame::serialize_message(&mut frame, OpCode::Text, b"hi", None, Some(&mut gen));

        let mut inbound: VecDeque<u8> = request.iter().copied().collect();
        inbound.extend(frame);
        let mut pipe = Pipe { inbound };

        let mut endpoint = Endpoint::new_server(Settings::default(), ());
        let mut cb = RecordingCallbacks::default();

        endpoint.read(&mut pipe, &mut cb).unwrap();
        assert_eq!(endpoint.state(), ConnState::WriteHandshake);

        endpoint.write(&mut pipe, &mut cb).unwrap();
        assert_eq!(endpoint.state(), ConnState::Connected);
        assert!(cb.opened);

        endpoint.read(&mut pipe, &mut cb).unwrap();
        assert_eq!(cb.messages, vec![Message::Text("hi".into())]);
    }

    #[test]
    fn close_after_both_sides_exchange_fires_on_close_once() {
        let mut endpoint = Endpoint::new_server(Settings::default(), ());
        endpoint.state = ConnState::Connected;
        let mut cb = RecordingCallbacks::default();

        endpoint.enqueue_close(1000, "bye").unwrap();
        let mut pipe = Pipe {
            inbound: VecDeque::new(),
        };
        let outcome = endpoint.write(&mut pipe, &mut cb).unwrap();
        assert_eq!(outcome, WriteOutcome::Done);
        assert!(cb.closed.is_none());

        let mut close_frame = Vec::new();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let mut gen = || [0x12u8, 0x34, 0x56, 0x78];
        crate::frame::serialize_message(&mut close_frame, OpCode::Close, &payload, None, Some(&mut gen));
        pipe.inbound = close_frame.into_iter().collect();
        endpoint.read(&mut pipe, &mut cb).unwrap();
        assert_eq!(cb.closed, Some(1000));
    }
}
