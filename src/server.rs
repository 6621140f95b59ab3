//! Accept loop, slot allocator, and heartbeat/timeout supervisor
//! (spec.md §4.5). Runs a single-threaded readiness loop over a
//! preallocated slot table; every callback invocation happens inline on
//! the loop thread (spec.md §5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::callbacks::Callbacks;
use crate::config::ServerOptions;
use crate::endpoint::{ConnState, Endpoint, ReadOutcome, WriteOutcome};
use crate::list::{Links, LinksAccessor, SlotList};
use crate::reactor::{now_ms, Reactor};
use crate::slot::{HeartbeatState, Slot};
use crate::timer::{TimerHeap, TimerKind};

const LISTENER_TOKEN: Token = Token(0);
const SERVER_WATCHDOG_FREQ_MS: u64 = 100;
const HANDSHAKE_SWEEP_FREQ_MS: u64 = 300;
const HEARTBEAT_PING_PAYLOAD: &[u8] = b"reactor-ws-heartbeat";

/// A cheap, `Send + Sync` handle that flips the stop flag. Safe to call
/// from a signal handler (spec.md §5: "only flips an atomic flag checked
/// by the stop watchdog").
#[derive(Clone)]
pub struct ServerStopHandle(Arc<AtomicBool>);

impl ServerStopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn token_for(slot_index: usize) -> Token {
    Token(slot_index + 1)
}

fn slot_index_for(token: Token) -> usize {
    token.0 - 1
}

/// The readiness-driven server (spec.md §4.5). `CB` is the shared
/// callback set; `U` is the opaque per-connection userdata, created fresh
/// (via `Default`) for each accepted connection.
pub struct Server<CB, U> {
    options: ServerOptions,
    callbacks: CB,
    listener: Option<TcpListener>,
    reactor: Reactor,
    slots: Vec<Slot<U>>,
    free: SlotList,
    active: SlotList,
    handshake_pending: SlotList,
    heartbeat_tracked: SlotList,
    timers: TimerHeap,
    stop_flag: Arc<AtomicBool>,
    stopping: bool,
}

impl<CB, U> Server<CB, U>
where
    CB: Callbacks<U>,
    U: Default,
{
    pub fn new(options: ServerOptions, callbacks: CB) -> io::Result<Self> {
        let max_clients = options.max_clients;
        let mut slots = Vec::with_capacity(max_clients);
        let mut free = SlotList::new();
        for i in 0..max_clients {
            slots.push(Slot::empty());
            free.push_back(
                i,
                &mut LinksView {
                    slots: &mut slots,
                    kind: ListKind::Free,
                },
            );
        }

        let mut timers = TimerHeap::new();
        let now = now_ms();
        timers.push(now + SERVER_WATCHDOG_FREQ_MS, TimerKind::StopWatchdog);
        if let Some(interval) = options.heartbeat_interval {
            timers.push(now + interval.as_millis() as u64, TimerKind::HeartbeatSend);
        }
        if options.handshake_timeout.is_some() {
            timers.push(now + HANDSHAKE_SWEEP_FREQ_MS, TimerKind::HandshakeTimeout);
        }

        Ok(Self {
            reactor: Reactor::new(max_clients + 1)?,
            options,
            callbacks,
            listener: None,
            slots,
            free,
            active: SlotList::new(),
            handshake_pending: SlotList::new(),
            heartbeat_tracked: SlotList::new(),
            timers,
            stop_flag: Arc::new(AtomicBool::new(false)),
            stopping: false,
        })
    }

    pub fn stop_handle(&self) -> ServerStopHandle {
        ServerStopHandle(self.stop_flag.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind and register the listening socket. Bind/listen failure
    /// surfaces here and the loop never starts (spec.md §7).
    pub fn listen(&mut self) -> io::Result<()> {
        let mut listener = TcpListener::bind(self.options.bind_addr)?;
        self.reactor
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Run the readiness loop until `server_stop()` has been called and
    /// every active connection has drained its shutdown close frame.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            let timeout = self.timers.next_deadline().map(|deadline| {
                let now = now_ms();
                Duration::from_millis(deadline.saturating_sub(now))
            });

            let fired: Vec<_> = self.reactor.poll(timeout)?.collect();
            for event in fired {
                if event.token == LISTENER_TOKEN {
                    self.accept_loop();
                } else {
                    self.handle_slot_event(slot_index_for(event.token), event.readable, event.writable || event.error);
                }
            }

            self.run_expired_timers();
            if self.stopping && self.active.is_empty() {
                return Ok(());
            }
        }
    }

    fn accept_loop(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else { return };
            match listener.accept() {
                Ok((stream, _addr)) => self.handle_accept(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept() failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_accept(&mut self, mut stream: TcpStream) {
        let Some(index) = self.free.head() else {
            warn!("server at capacity ({} clients); dropping new connection", self.options.max_clients);
            drop(stream);
            return;
        };
        self.free.remove(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Free,
            },
        );
        let _ = stream.set_nodelay(true);

        if let Err(e) = self
            .reactor
            .register(&mut stream, token_for(index), Interest::READABLE)
        {
            warn!("failed to register accepted socket: {e}");
            return;
        }

        let endpoint = Endpoint::new_server(self.options.settings.clone(), U::default());
        let slot = &mut self.slots[index];
        slot.endpoint = Some(endpoint);
        slot.stream = Some(stream);
        slot.heartbeat = HeartbeatState::Idle;
        slot.handshake_deadline_ms = self
            .options
            .handshake_timeout
            .map(|d| now_ms() + d.as_millis() as u64)
            .unwrap_or(u64::MAX);

        self.active.push_back(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Active,
            },
        );
        if self.options.handshake_timeout.is_some() {
            self.handshake_pending.push_back(
                index,
                &mut LinksView {
                    slots: &mut self.slots,
                    kind: ListKind::Handshake,
                },
            );
        }
    }

    fn handle_slot_event(&mut self, index: usize, readable: bool, writable: bool) {
        if index >= self.slots.len() || self.slots[index].is_free() {
            return;
        }

        if readable {
            let outcome = {
                let slot = &mut self.slots[index];
                let endpoint = slot.endpoint.as_mut().unwrap();
                let stream = slot.stream.as_mut().unwrap();
                endpoint.read(stream, &mut self.callbacks)
            };
            match outcome {
                Ok(ReadOutcome::Closed) | Err(_) => {
                    self.teardown(index);
                    return;
                }
                _ => {}
            }
            self.note_pong_if_received(index);
        }

        if writable && !self.slots[index].is_free() {
            let outcome = {
                let slot = &mut self.slots[index];
                let endpoint = slot.endpoint.as_mut().unwrap();
                let stream = slot.stream.as_mut().unwrap();
                endpoint.write(stream, &mut self.callbacks)
            };
            match outcome {
                Ok(WriteOutcome::Closed) | Err(_) => {
                    self.teardown(index);
                    return;
                }
                _ => {}
            }
        }

        self.on_state_settled(index);
        self.sync_interest(index);
    }

    /// A `PONG` clears the slot's pending heartbeat and moves it to the
    /// tail of the heartbeat-tracked list, so the list stays ordered by
    /// recency of received pong (spec.md §4.5) and a responsive connection
    /// survives past `heartbeat_expire_sweep`.
    fn note_pong_if_received(&mut self, index: usize) {
        let got_pong = self.slots[index]
            .endpoint
            .as_mut()
            .is_some_and(|endpoint| endpoint.take_pong_received());
        if !got_pong {
            return;
        }
        self.slots[index].heartbeat = HeartbeatState::Idle;
        if self.slots[index].heartbeat_links.linked {
            self.heartbeat_tracked.move_to_back(
                index,
                &mut LinksView {
                    slots: &mut self.slots,
                    kind: ListKind::Heartbeat,
                },
            );
        }
    }

    /// After a read/write pass, react to a handshake having just
    /// completed: move the slot off the handshake-pending list and onto
    /// the heartbeat-tracked list (spec.md §4.5 "List discipline").
    fn on_state_settled(&mut self, index: usize) {
        let Some(endpoint) = self.slots[index].endpoint.as_ref() else {
            return;
        };
        if endpoint.state() != ConnState::Connected {
            return;
        }
        if self.slots[index].handshake_links.linked {
            self.handshake_pending.remove(
                index,
                &mut LinksView {
                    slots: &mut self.slots,
                    kind: ListKind::Handshake,
                },
            );
            if self.options.heartbeat_interval.is_some() {
                self.heartbeat_tracked.push_back(
                    index,
                    &mut LinksView {
                        slots: &mut self.slots,
                        kind: ListKind::Heartbeat,
                    },
                );
            }
        }
    }

    fn sync_interest(&mut self, index: usize) {
        if self.slots[index].is_free() {
            return;
        }
        let pending_write = self.slots[index].endpoint.as_ref().unwrap().has_pending_write();
        let interest = if pending_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let slot = &mut self.slots[index];
        if let Some(stream) = slot.stream.as_mut() {
            let _ = self.reactor.reregister(stream, token_for(index), interest);
        }
    }

    fn teardown(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(stream) = slot.stream.as_mut() {
            let _ = self.reactor.deregister(stream);
        }
        slot.stream = None;
        slot.endpoint = None;
        self.active.remove(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Active,
            },
        );
        self.handshake_pending.remove(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Handshake,
            },
        );
        self.heartbeat_tracked.remove(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Heartbeat,
            },
        );
        self.free.push_back(
            index,
            &mut LinksView {
                slots: &mut self.slots,
                kind: ListKind::Free,
            },
        );
    }

    fn run_expired_timers(&mut self) {
        let now = now_ms();
        for kind in self.timers.drain_expired(now) {
            match kind {
                TimerKind::StopWatchdog => self.stop_watchdog_sweep(now),
                TimerKind::HeartbeatSend => self.heartbeat_send_sweep(now),
                TimerKind::HeartbeatExpire => self.heartbeat_expire_sweep(now),
                TimerKind::HandshakeTimeout => self.handshake_timeout_sweep(now),
            }
        }
    }

    fn stop_watchdog_sweep(&mut self, now: u64) {
        if self.stop_flag.load(Ordering::SeqCst) && !self.stopping {
            self.stopping = true;
            for index in self.active.iter(|idx| self.slots[idx].active_links) {
                if let Some(endpoint) = self.slots[index].endpoint.as_mut() {
                    let _ = endpoint.enqueue_close(1001, "server shutting down");
                }
                self.sync_interest(index);
            }
        }
        if !self.stopping || !self.active.is_empty() {
            self.timers.push(now + SERVER_WATCHDOG_FREQ_MS, TimerKind::StopWatchdog);
        }
    }

    fn heartbeat_send_sweep(&mut self, now: u64) {
        for index in self.heartbeat_tracked.iter(|idx| self.slots[idx].heartbeat_links) {
            if let Some(endpoint) = self.slots[index].endpoint.as_mut() {
                let _ = endpoint.send_ping(HEARTBEAT_PING_PAYLOAD);
            }
            self.slots[index].heartbeat = HeartbeatState::Pending { sent_at_ms: now };
            self.sync_interest(index);
        }
        if let Some(interval) = self.options.heartbeat_interval {
            self.timers.push(now + interval.as_millis() as u64, TimerKind::HeartbeatSend);
            if let Some(ttl) = self.options.heartbeat_ttl {
                self.timers.push(now + ttl.as_millis() as u64, TimerKind::HeartbeatExpire);
            }
        }
    }

    fn heartbeat_expire_sweep(&mut self, now: u64) {
        let Some(ttl) = self.options.heartbeat_ttl else { return };
        let indices = self.heartbeat_tracked.iter(|idx| self.slots[idx].heartbeat_links);
        for index in indices {
            if let HeartbeatState::Pending { sent_at_ms } = self.slots[index].heartbeat {
                if now.saturating_sub(sent_at_ms) >= ttl.as_millis() as u64 {
                    if let Some(endpoint) = self.slots[index].endpoint.as_mut() {
                        endpoint.force_close(&mut self.callbacks, 0, "heartbeat expired");
                    }
                    self.teardown(index);
                }
            }
        }
    }

    fn handshake_timeout_sweep(&mut self, now: u64) {
        let indices = self.handshake_pending.iter(|idx| self.slots[idx].handshake_links);
        for index in indices {
            if self.slots[index].handshake_deadline_ms <= now {
                if let Some(endpoint) = self.slots[index].endpoint.as_mut() {
                    endpoint.force_close(&mut self.callbacks, 0, "handshake timed out");
                }
                self.teardown(index);
            }
        }
        if self.options.handshake_timeout.is_some() {
            self.timers.push(now + HANDSHAKE_SWEEP_FREQ_MS, TimerKind::HandshakeTimeout);
        }
    }
}

use std::io;

#[derive(Clone, Copy)]
enum ListKind {
    Free,
    Active,
    Handshake,
    Heartbeat,
}

/// Borrows `slots` for the duration of one list operation and routes
/// `links()` to whichever of a slot's four `Links` fields `kind` selects.
/// Exists because the list's membership bookkeeping can't otherwise reach
/// into a field nested inside the caller's own element type.
struct LinksView<'a, U> {
    slots: &'a mut [Slot<U>],
    kind: ListKind,
}

impl<'a, U> LinksAccessor for LinksView<'a, U> {
    fn links(&mut self, index: usize) -> &mut Links {
        match self.kind {
            ListKind::Free => &mut self.slots[index].free_links,
            ListKind::Active => &mut self.slots[index].active_links,
            ListKind::Handshake => &mut self.slots[index].handshake_links,
            ListKind::Heartbeat => &mut self.slots[index].heartbeat_links,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{ConnectRequest, ConnectResponse};
    use crate::endpoint::Connection;
    use crate::message::Message;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct EchoCallbacks;

    impl Callbacks<()> for EchoCallbacks {
        fn on_connect(&mut self, _conn: &mut Connection<'_, ()>, _req: &ConnectRequest) -> Option<ConnectResponse> {
            Some(ConnectResponse::default())
        }
        fn on_message(&mut self, conn: &mut Connection<'_, ()>, message: Message) {
            let _ = conn.send_msg(message);
        }
    }

    #[test]
    fn accepts_connection_and_echoes_a_message() {
        let mut options = ServerOptions::new("127.0.0.1:0".parse().unwrap(), 4);
        options.handshake_timeout = None;
        let mut server = Server::new(options, EchoCallbacks).unwrap();
        server.listen().unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            ready_tx.send(()).unwrap();
            server.run().unwrap();
        });
        ready_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        ).unwrap();

        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 101"));

        let mut frame = Vec::new();
        let mut gen = || [1u8, 2, 3, 4];
        crate::frame::serialize_message(&mut frame, crate::frame::OpCode::Text, b"ping", None, Some(&mut gen));
        client.write_all(&frame).unwrap();

        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x81, 0x04, b'p', b'i', b'n', b'g'][..]);

        stop.stop();
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn responsive_connection_survives_past_heartbeat_ttl() {
        let mut options = ServerOptions::new("127.0.0.1:0".parse().unwrap(), 4);
        options.handshake_timeout = None;
        options.heartbeat_interval = Some(Duration::from_millis(30));
        options.heartbeat_ttl = Some(Duration::from_millis(40));
        let mut server = Server::new(options, EchoCallbacks).unwrap();
        server.listen().unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            ready_tx.send(()).unwrap();
            server.run().unwrap();
        });
        ready_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        ).unwrap();

        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 101"));

        // A background reader keeps answering every heartbeat PING with a
        // PONG carrying the same payload, for longer than the TTL, while
        // the main thread waits to see whether the server still echoes a
        // plain message afterwards.
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut responder = client.try_clone().unwrap();
        let (text_tx, text_rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut pending = Vec::new();
            loop {
                let frame = loop {
                    if pending.len() >= 2 {
                        let len = pending[1] as usize;
                        if pending.len() >= 2 + len {
                            let payload = pending[2..2 + len].to_vec();
                            let opcode = pending[0] & 0x0f;
                            pending.drain(0..2 + len);
                            break (opcode, payload);
                        }
                    }
                    let mut tmp = [0u8; 512];
                    match responder.read(&mut tmp) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => pending.extend_from_slice(&tmp[..n]),
                    }
                };
                let (opcode, payload) = frame;
                if opcode == crate::frame::OpCode::Ping as u8 {
                    let mut pong = Vec::new();
                    let mut gen = || [9u8, 8, 7, 6];
                    crate::frame::serialize_message(&mut pong, crate::frame::OpCode::Pong, &payload, None, Some(&mut gen));
                    if responder.write_all(&pong).is_err() {
                        return;
                    }
                } else if opcode == crate::frame::OpCode::Text as u8 {
                    let _ = text_tx.send(payload);
                    return;
                }
            }
        });

        thread::sleep(Duration::from_millis(120));

        let mut frame = Vec::new();
        let mut gen = || [1u8, 2, 3, 4];
        crate::frame::serialize_message(&mut frame, crate::frame::OpCode::Text, b"still alive", None, Some(&mut gen));
        client.write_all(&frame).unwrap();

        let echoed = text_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("connection closed before echoing a post-TTL message");
        assert_eq!(echoed, b"still alive");

        reader.join().unwrap();
        stop.stop();
        drop(client);
        handle.join().unwrap();
    }
}
