//! Connection settings and server/client options (spec.md §3 "Connection
//! settings", §6 "Options (server)" and the client `connect()` parameter
//! list).

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The RNG hook used to draw client-side masking keys and handshake
/// `Sec-WebSocket-Key` bytes (spec.md §3). Wrapped in a `Mutex` because the
/// reactor only ever calls it from the loop thread (spec.md §5), but
/// `Settings` is `Clone` and handed to every endpoint.
#[derive(Clone)]
pub struct RandFunc(Arc<Mutex<dyn RngCore + Send>>);

impl RandFunc {
    pub fn new(rng: impl RngCore + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(rng)))
    }

    pub fn fill(&self, dest: &mut [u8]) {
        self.0.lock().unwrap().fill_bytes(dest);
    }

    pub fn next_u32(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        buf
    }
}

impl std::fmt::Debug for RandFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RandFunc(..)")
    }
}

impl Default for RandFunc {
    fn default() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

/// Per-connection protocol settings, shared by server and client endpoints.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Outgoing frames are split at this payload size. `None` = unlimited.
    pub write_max_frame_size: Option<usize>,
    /// Hard cap on a single accumulated message; exceeding it fails the
    /// connection with close code 1009. `None` = unlimited.
    pub read_max_msg_size: Option<usize>,
    /// Cap on fragment count per message; exceeding it fails with 1009 per
    /// the resolved spec.md §9 open question ("enforced strictly").
    pub read_max_num_frames: Option<u32>,
    /// Cap on bytes consumed parsing the handshake request/response.
    pub max_handshake_size: usize,
    /// Initial capacity of the read/write/handshake buffers.
    pub init_buf_len: usize,
    /// On protocol error, skip the closing handshake and tear down
    /// immediately instead of exchanging close frames.
    pub fail_by_drop: bool,
    /// RNG hook for client masking keys and handshake nonces.
    pub rand_func: RandFunc,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            write_max_frame_size: None,
            read_max_msg_size: None,
            read_max_num_frames: None,
            max_handshake_size: 16 * 1024,
            init_buf_len: 4 * 1024,
            fail_by_drop: false,
            rand_func: RandFunc::default(),
        }
    }
}

/// Server-wide options (spec.md §6 "Options (server)").
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: std::net::SocketAddr,
    pub max_clients: usize,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// `None` disables heartbeat expiry (ping sent but never followed up).
    pub heartbeat_ttl: Option<Duration>,
    /// `None` disables the handshake deadline.
    pub handshake_timeout: Option<Duration>,
    pub settings: Settings,
}

impl ServerOptions {
    pub fn new(bind_addr: std::net::SocketAddr, max_clients: usize) -> Self {
        Self {
            bind_addr,
            max_clients,
            heartbeat_interval: None,
            heartbeat_ttl: None,
            handshake_timeout: Some(Duration::from_secs(10)),
            settings: Settings::default(),
        }
    }
}

/// Parameters for `Client::connect` (spec.md §6).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub resource: String,
    pub host: String,
    pub subprotocols: Vec<String>,
    pub extensions: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
    pub settings: Settings,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            host: host.into(),
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            extra_headers: Vec::new(),
            settings: Settings::default(),
        }
    }
}
