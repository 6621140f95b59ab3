//! Active-connect variant of the endpoint (spec.md §4.6): opens a
//! non-blocking socket, connects, and drives the handshake request/response
//! once the socket reports writable for the first time.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::callbacks::Callbacks;
use crate::config::ClientOptions;
use crate::endpoint::{ClientHandshake, Endpoint, ReadOutcome, WriteOutcome};
use crate::reactor::Reactor;

const CLIENT_TOKEN: Token = Token(0);

/// A single outbound WebSocket connection (spec.md §4.6). `CB` is the
/// callback set; `U` the opaque userdata.
pub struct Client<CB, U> {
    callbacks: CB,
    reactor: Reactor,
    stream: TcpStream,
    endpoint: Endpoint<U>,
    connecting: bool,
}

impl<CB, U> Client<CB, U>
where
    CB: Callbacks<U>,
{
    /// Open the socket and queue the connect; the handshake request isn't
    /// sent until the first writable event confirms the TCP connect
    /// succeeded (spec.md §4.6).
    pub fn connect(addr: SocketAddr, options: ClientOptions, callbacks: CB, userdata: U) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        let mut reactor = Reactor::new(4)?;
        reactor.register(&mut stream, CLIENT_TOKEN, Interest::WRITABLE)?;

        let handshake = ClientHandshake {
            resource: options.resource.clone(),
            host: options.host.clone(),
            subprotocols: options.subprotocols.clone(),
            extensions: options.extensions.clone(),
            extra_headers: options.extra_headers.clone(),
        };
        let endpoint = Endpoint::new_client(options.settings, handshake, userdata);

        Ok(Self {
            callbacks,
            reactor,
            stream,
            endpoint,
            connecting: true,
        })
    }

    pub fn endpoint(&self) -> &Endpoint<U> {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint<U> {
        &mut self.endpoint
    }

    /// Drive the event loop until the connection closes.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            let fired: Vec<_> = self.reactor.poll(Some(Duration::from_millis(200)))?.collect();
            for event in fired {
                if event.token != CLIENT_TOKEN {
                    continue;
                }

                if self.connecting {
                    match self.stream.take_error() {
                        Ok(None) => {
                            self.connecting = false;
                            self.endpoint.queue_client_handshake();
                        }
                        Ok(Some(e)) | Err(e) => return Err(e),
                    }
                }

                if event.writable && !self.connecting {
                    match self.endpoint.write(&mut self.stream, &mut self.callbacks) {
                        Ok(WriteOutcome::Closed) | Err(_) => return Ok(()),
                        _ => {}
                    }
                }

                if event.readable {
                    match self.endpoint.read(&mut self.stream, &mut self.callbacks) {
                        Ok(ReadOutcome::Closed) | Err(_) => return Ok(()),
                        _ => {}
                    }
                }

                self.sync_interest()?;
            }

            if self.endpoint.is_closed() {
                return Ok(());
            }
        }
    }

    fn sync_interest(&mut self) -> io::Result<()> {
        let interest = if self.connecting || self.endpoint.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.reactor.reregister(&mut self.stream, CLIENT_TOKEN, interest)
    }
}
