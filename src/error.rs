use std::io;
use thiserror::Error;

/// Every fallible path through the protocol engine and endpoint surfaces
/// through this enum. Each variant that represents a protocol violation
/// knows the RFC 6455 close code it maps to (spec.md §4.3/§7); I/O and
/// handshake failures don't get a close frame at all, so they have none.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    // Handshake errors - none of these get a close frame; the socket is
    // simply dropped (spec.md §7: "drop the socket").
    #[error("malformed HTTP request line in handshake")]
    MalformedRequestLine,

    #[error("malformed header line in handshake")]
    MalformedHeaderLine,

    #[error("handshake exceeded max_handshake_size before completing")]
    HandshakeTooLarge,

    #[error("missing or invalid Upgrade header")]
    InvalidUpgradeHeader,

    #[error("missing or invalid Connection header")]
    InvalidConnectionHeader,

    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,

    #[error("Sec-WebSocket-Key missing or not 24 characters")]
    InvalidSecWebSocketKey,

    #[error("Sec-WebSocket-Accept did not match the expected digest")]
    InvalidSecWebSocketAccept,

    #[error("handshake response did not carry HTTP status 101")]
    HandshakeNotUpgraded,

    #[error("application rejected the connection in on_connect")]
    ConnectionRejected,

    // Framing errors - these map to a close code and fail the connection
    // per spec.md §4.3/§7.
    #[error("reserved opcode")]
    ReservedOpcode,

    #[error("RSV bits set with no extension negotiated")]
    RsvNotZero,

    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFramePayloadTooLarge,

    #[error("server received an unmasked frame")]
    UnmaskedClientFrame,

    #[error("client received a masked frame")]
    MaskedServerFrame,

    #[error("data frame received while no fragmented message is in progress")]
    UnexpectedContinuation,

    #[error("non-continuation data frame received mid-fragment")]
    InterleavedDataFrame,

    #[error("invalid close code")]
    InvalidCloseCode,

    #[error("message exceeds read_max_msg_size")]
    MessageTooLarge,

    #[error("fragment count exceeds read_max_num_frames")]
    TooManyFragments,

    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    #[error("attempted to send invalid UTF-8 as a text message")]
    InvalidUtf8Outgoing,
}

impl Error {
    /// The RFC 6455 §7.4 close code this error should be reported under, if
    /// it is the kind of error that results in a close frame at all.
    pub fn close_code(&self) -> Option<u16> {
        use Error::*;
        match self {
            InvalidUtf8 | InvalidUtf8Outgoing => Some(1007),
            MessageTooLarge | TooManyFragments => Some(1009),
            ReservedOpcode
            | RsvNotZero
            | ControlFrameFragmented
            | ControlFramePayloadTooLarge
            | UnmaskedClientFrame
            | MaskedServerFrame
            | UnexpectedContinuation
            | InterleavedDataFrame
            | InvalidCloseCode => Some(1002),
            IOError { .. }
            | MalformedRequestLine
            | MalformedHeaderLine
            | HandshakeTooLarge
            | InvalidUpgradeHeader
            | InvalidConnectionHeader
            | UnsupportedVersion
            | InvalidSecWebSocketKey
            | InvalidSecWebSocketAccept
            | HandshakeNotUpgraded
            | ConnectionRejected => None,
        }
    }
}

/// Reserved / invalid close-code ranges per RFC 6455 §7.4: these must be
/// rejected when *received* in a peer's close frame.
pub fn is_reserved_close_code(code: u16) -> bool {
    matches!(code, 0..=999 | 1004..=1006 | 1015 | 5000..=u16::MAX)
}
