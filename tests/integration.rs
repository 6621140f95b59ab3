//! End-to-end client/server coverage over real TCP sockets (spec.md §8):
//! a `Server` and a `Client` drive a full handshake, exchange messages, and
//! close, each on its own thread with no shared state but the socket.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use reactor_ws::{Callbacks, ClientOptions, Connection, Message, Server, ServerOptions};

#[derive(Default)]
struct EchoServer;

impl Callbacks<()> for EchoServer {
    fn on_connect(
        &mut self,
        _conn: &mut Connection<'_, ()>,
        _req: &reactor_ws::ConnectRequest,
    ) -> Option<reactor_ws::ConnectResponse> {
        Some(reactor_ws::ConnectResponse::default())
    }

    fn on_message(&mut self, conn: &mut Connection<'_, ()>, message: Message) {
        let _ = conn.send_msg(message);
    }
}

#[derive(Default)]
struct RecordingClient {
    received: Vec<Message>,
    closed: bool,
}

impl Callbacks<()> for RecordingClient {
    fn on_open(&mut self, conn: &mut Connection<'_, ()>) {
        let _ = conn.send_text("ping");
    }

    fn on_message(&mut self, conn: &mut Connection<'_, ()>, message: Message) {
        self.received.push(message);
        let _ = conn.close(1000, "done");
    }

    fn on_close(&mut self, _conn: &mut Connection<'_, ()>, _code: u16, _reason: &str) {
        self.closed = true;
    }
}

#[test]
fn client_and_server_exchange_a_message_then_close() {
    let mut options = ServerOptions::new("127.0.0.1:0".parse().unwrap(), 4);
    options.handshake_timeout = None;
    let mut server = Server::new(options, EchoServer).unwrap();
    server.listen().unwrap();
    let addr = server.local_addr().unwrap();
    let stop = server.stop_handle();

    let (ready_tx, ready_rx) = mpsc::channel();
    let server_handle = thread::spawn(move || {
        ready_tx.send(()).unwrap();
        server.run().unwrap();
    });
    ready_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));

    let client_options = ClientOptions::new("127.0.0.1", "/");
    let mut client = reactor_ws::Client::connect(addr, client_options, RecordingClient::default(), ()).unwrap();
    client.run().unwrap();

    stop.stop();
    server_handle.join().unwrap();
}
