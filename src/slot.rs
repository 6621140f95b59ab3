//! A preallocated per-connection slot (spec.md §4.5 "Server", §9 "In-place
//! linked-list membership for slots"). Every slot lives at a stable index
//! in the server's slot array and carries one `Links` per list it can
//! belong to, so moving it between lists is two pointer swings and never
//! touches the heap.

use mio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::list::Links;

/// Whether a connected slot is waiting on a heartbeat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Pending { sent_at_ms: u64 },
}

/// One entry in the server's fixed-size slot array. `endpoint`/`stream`
/// are `None` while the slot sits in the free list.
pub struct Slot<U> {
    pub endpoint: Option<Endpoint<U>>,
    pub stream: Option<TcpStream>,
    pub writable_armed: bool,
    pub handshake_deadline_ms: u64,
    pub heartbeat: HeartbeatState,

    pub free_links: Links,
    pub active_links: Links,
    pub handshake_links: Links,
    pub heartbeat_links: Links,
}

impl<U> Slot<U> {
    pub fn empty() -> Self {
        Self {
            endpoint: None,
            stream: None,
            writable_armed: false,
            handshake_deadline_ms: 0,
            heartbeat: HeartbeatState::Idle,
            free_links: Links::default(),
            active_links: Links::default(),
            handshake_links: Links::default(),
            heartbeat_links: Links::default(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.endpoint.is_none()
    }
}

impl<U> Default for Slot<U> {
    fn default() -> Self {
        Self::empty()
    }
}
