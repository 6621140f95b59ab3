//! The readiness-driven event loop primitive (spec.md §4.5/§5): a thin
//! wrapper over `mio::Poll` that registers a descriptor with an interest
//! mask and a `Token`, waits with a timeout bounded by the caller's timer
//! heap, and hands back the set of fired events. The server and client
//! drive their own dispatch on top of this; the reactor itself knows
//! nothing about WebSocket state.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Wraps `mio::Poll` plus its reusable `Events` buffer.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn register(&mut self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(&mut self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&mut self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until at least one descriptor is ready or `timeout` elapses
    /// (`None` blocks indefinitely - the caller should always derive this
    /// from the timer heap's next deadline so periodic sweeps still run).
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<impl Iterator<Item = FiredEvent> + '_> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().map(|e| FiredEvent {
            token: e.token(),
            readable: e.is_readable(),
            writable: e.is_writable(),
            error: e.is_error() || e.is_read_closed() || e.is_write_closed(),
        }))
    }
}

/// One fired readiness event, decoupled from `mio`'s borrowed `Event` type
/// so callers can collect them before mutating the slot array.
#[derive(Debug, Clone, Copy)]
pub struct FiredEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Milliseconds since `UNIX_EPOCH`, the clock the timer heap is keyed on.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
