//! Handshake codec (spec.md §4.1): the HTTP Upgrade exchange that
//! bootstraps a connection, for both the server-accepting and
//! client-initiating roles.
//!
//! Parsed header names/values are stored as `(offset, len)` ranges into a
//! raw byte buffer owned by the [`HeaderSet`] rather than as copied
//! `String`s (spec.md §9 "Handshake byte ownership": "Models without
//! interior pointers should store (offset, length) pairs instead and
//! provide accessors that slice on demand").

use base64::prelude::*;
use sha1::{Digest, Sha1};
use std::ops::Range;

use crate::error::Error;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header names whose value is a comma-separated list of independent
/// tokens (spec.md §3 "Handshake header set").
const COMMA_DELIMITED: [&str; 6] = [
    "sec-websocket-protocol",
    "sec-websocket-extensions",
    "accept-encoding",
    "te",
    "connection",
    "upgrade",
];

fn is_comma_delimited(name_lower: &str) -> bool {
    COMMA_DELIMITED.contains(&name_lower)
}

fn eq_ignore_case(a: &[u8], b: &str) -> bool {
    a.len() == b.len() && a.iter().zip(b.bytes()).all(|(x, y)| x.eq_ignore_ascii_case(&y))
}

#[derive(Debug, Clone)]
struct HeaderRecord {
    name: Range<usize>,
    values: Vec<Range<usize>>,
}

/// A parsed set of HTTP headers plus the raw bytes they were parsed from.
/// Accessors slice into the raw buffer on demand; nothing here is copied
/// out at parse time.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    raw: Vec<u8>,
    records: Vec<HeaderRecord>,
}

impl HeaderSet {
    fn slice(&self, r: &Range<usize>) -> &str {
        std::str::from_utf8(&self.raw[r.clone()]).unwrap_or("")
    }

    /// All values for `name` (case-insensitive), each comma-token already
    /// split out if `name` is one of the designated comma-delimited
    /// headers. Empty if the header is absent; multiple records for the
    /// same name are concatenated in arrival order.
    pub fn get_values(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for record in &self.records {
            if eq_ignore_case(self.raw[record.name.clone()].as_ref(), name) {
                out.extend(record.values.iter().map(|v| self.slice(v)));
            }
        }
        out
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_values(name).into_iter().next()
    }

    /// Case-insensitive containment check among comma-split tokens
    /// (e.g. `Connection: keep-alive, Upgrade`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_values(name).iter().any(|v| v.eq_ignore_ascii_case(token))
    }
}

#[derive(Debug, Clone, Default)]
struct HeaderSetBuilder {
    raw: Vec<u8>,
    records: Vec<HeaderRecord>,
}

impl HeaderSetBuilder {
    fn push_bytes(&mut self, bytes: &[u8]) -> Range<usize> {
        let start = self.raw.len();
        self.raw.extend_from_slice(bytes);
        start..self.raw.len()
    }

    fn push_header(&mut self, name: &[u8], value: &[u8]) {
        let name_range = self.push_bytes(name);
        let name_lower = String::from_utf8_lossy(name).to_lowercase();
        let values = if is_comma_delimited(&name_lower) {
            value
                .split(|&b| b == b',')
                .map(|tok| self.push_bytes(trim(tok)))
                .collect()
        } else {
            vec![self.push_bytes(trim(value))]
        };
        self.records.push(HeaderRecord {
            name: name_range,
            values,
        });
    }

    fn finish(self) -> HeaderSet {
        HeaderSet {
            raw: self.raw,
            records: self.records,
        }
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Outcome of attempting to parse a complete HTTP request/response head
/// from a handshake buffer.
pub enum ParseOutcome<T> {
    Continue,
    Complete { value: T, consumed: usize },
}

/// A parsed server-side handshake request.
pub struct Request {
    pub resource: String,
    pub headers: HeaderSet,
}

/// Scan `buf` for a complete `\r\n\r\n`-terminated HTTP request. Returns
/// `Continue` if the terminator hasn't arrived yet and `buf.len() <=
/// max_handshake_size`; fails with `HandshakeTooLarge` if it's been
/// exceeded without completing, or with a malformed-line error if the
/// request line or headers don't parse (spec.md §4.1).
pub fn parse_request(buf: &[u8], max_handshake_size: usize) -> Result<ParseOutcome<Request>, Error> {
    let Some(head_end) = find_double_crlf(buf) else {
        if buf.len() > max_handshake_size {
            return Err(Error::HandshakeTooLarge);
        }
        return Ok(ParseOutcome::Continue);
    };

    let head = &buf[..head_end];
    let mut lines = split_lines(head);
    let request_line = lines.next().ok_or(Error::MalformedRequestLine)?;
    let resource = parse_request_line(request_line)?;
    let headers = parse_header_lines(lines)?;

    Ok(ParseOutcome::Complete {
        value: Request { resource, headers },
        consumed: head_end + 4,
    })
}

fn parse_request_line(line: &[u8]) -> Result<String, Error> {
    // "GET <resource> HTTP/<d+>.<d+>"
    let text = std::str::from_utf8(line).map_err(|_| Error::MalformedRequestLine)?;
    let mut parts = text.split_ascii_whitespace();
    let method = parts.next().ok_or(Error::MalformedRequestLine)?;
    if method != "GET" {
        return Err(Error::MalformedRequestLine);
    }
    let resource = parts.next().ok_or(Error::MalformedRequestLine)?;
    let version = parts.next().ok_or(Error::MalformedRequestLine)?;
    if !is_http_version(version) {
        return Err(Error::MalformedRequestLine);
    }
    Ok(resource.to_string())
}

fn is_http_version(v: &str) -> bool {
    let Some(rest) = v.strip_prefix("HTTP/") else {
        return false;
    };
    let Some((major, minor)) = rest.split_once('.') else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.bytes().all(|b| b.is_ascii_digit())
        && minor.bytes().all(|b| b.is_ascii_digit())
}

/// A parsed client-side handshake response status line plus headers.
pub struct Response {
    pub status: u16,
    pub headers: HeaderSet,
}

pub fn parse_response(buf: &[u8], max_handshake_size: usize) -> Result<ParseOutcome<Response>, Error> {
    let Some(head_end) = find_double_crlf(buf) else {
        if buf.len() > max_handshake_size {
            return Err(Error::HandshakeTooLarge);
        }
        return Ok(ParseOutcome::Continue);
    };

    let head = &buf[..head_end];
    let mut lines = split_lines(head);
    let status_line = lines.next().ok_or(Error::MalformedRequestLine)?;
    let status = parse_status_line(status_line)?;
    let headers = parse_header_lines(lines)?;

    Ok(ParseOutcome::Complete {
        value: Response { status, headers },
        consumed: head_end + 4,
    })
}

fn parse_status_line(line: &[u8]) -> Result<u16, Error> {
    // "HTTP/<d+>.<d+> <status> <reason>"
    let text = std::str::from_utf8(line).map_err(|_| Error::MalformedRequestLine)?;
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().ok_or(Error::MalformedRequestLine)?;
    if !is_http_version(version) {
        return Err(Error::MalformedRequestLine);
    }
    let status = parts
        .next()
        .ok_or(Error::MalformedRequestLine)?
        .parse::<u16>()
        .map_err(|_| Error::MalformedRequestLine)?;
    Ok(status)
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n').map(|line| {
        if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<HeaderSet, Error> {
    let mut builder = HeaderSetBuilder::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(Error::MalformedHeaderLine)?;
        let (name, value) = line.split_at(colon);
        builder.push_header(name, &value[1..]);
    }
    Ok(builder.finish())
}

/// Validate the server-side request per spec.md §4.1: `Upgrade: websocket`,
/// `Connection: Upgrade` (a token among `Connection`'s comma-delimited
/// list), `Sec-WebSocket-Version: 13`, and a 24-character
/// `Sec-WebSocket-Key`.
pub fn validate_request(headers: &HeaderSet) -> Result<&str, Error> {
    if !headers.has_token("Upgrade", "websocket") {
        return Err(Error::InvalidUpgradeHeader);
    }
    if !headers.has_token("Connection", "Upgrade") {
        return Err(Error::InvalidConnectionHeader);
    }
    if headers.get_first("Sec-WebSocket-Version") != Some("13") {
        return Err(Error::UnsupportedVersion);
    }
    let key = headers
        .get_first("Sec-WebSocket-Key")
        .ok_or(Error::InvalidSecWebSocketKey)?;
    if key.len() != 24 {
        return Err(Error::InvalidSecWebSocketKey);
    }
    Ok(key)
}

/// `base64(sha1(key || GUID))` (spec.md §4.1).
pub fn accept_digest(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` server response.
pub fn build_response(key: &str, protocol: Option<&str>, extensions: Option<&str>) -> Vec<u8> {
    let accept = accept_digest(key);
    let mut out = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(p) = protocol {
        out.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
    }
    if let Some(e) = extensions {
        out.push_str(&format!("Sec-WebSocket-Extensions: {e}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Build the client-side request, returning the bytes plus the
/// base64-encoded key that must be stashed to verify the response later.
pub fn build_request(
    resource: &str,
    host: &str,
    key_b64: &str,
    subprotocols: &[String],
    extensions: &[String],
    extra_headers: &[(String, String)],
) -> Vec<u8> {
    let mut out = format!(
        "GET {resource} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key_b64}\r\n"
    );
    if !subprotocols.is_empty() {
        out.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocols.join(", ")));
    }
    if !extensions.is_empty() {
        out.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions.join(", ")));
    }
    for (name, value) in extra_headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Validate the client-side response per spec.md §4.1.
pub fn validate_response(headers: &HeaderSet, status: u16, stashed_key_b64: &str) -> Result<(), Error> {
    if status != 101 {
        return Err(Error::HandshakeNotUpgraded);
    }
    if !headers.has_token("Upgrade", "websocket") {
        return Err(Error::InvalidUpgradeHeader);
    }
    if !headers.has_token("Connection", "Upgrade") {
        return Err(Error::InvalidConnectionHeader);
    }
    let expected = accept_digest(stashed_key_b64);
    if headers.get_first("Sec-WebSocket-Accept") != Some(expected.as_str()) {
        return Err(Error::InvalidSecWebSocketAccept);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_accept_digest_matches_rfc_example() {
        assert_eq!(
            accept_digest("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_request_and_validates() {
        let req = b"GET /chat HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: keep-alive, Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Protocol: chat, superchat\r\n\
\r\n";
        let ParseOutcome::Complete { value, consumed } = parse_request(req, 4096).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(consumed, req.len());
        assert_eq!(value.resource, "/chat");
        let key = validate_request(&value.headers).unwrap();
        assert_eq!(key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(
            value.headers.get_values("Sec-WebSocket-Protocol"),
            vec!["chat", "superchat"]
        );
    }

    #[test]
    fn incomplete_request_reports_continue() {
        let partial = b"GET /chat HTTP/1.1\r\nHost: x\r\n";
        assert!(matches!(
            parse_request(partial, 4096).unwrap(),
            ParseOutcome::Continue
        ));
    }

    #[test]
    fn oversize_handshake_fails() {
        let partial = vec![b'x'; 100];
        assert!(matches!(
            parse_request(&partial, 10),
            Err(Error::HandshakeTooLarge)
        ));
    }

    #[test]
    fn rejects_missing_upgrade_header() {
        let req = b"GET / HTTP/1.1\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let ParseOutcome::Complete { value, .. } = parse_request(req, 4096).unwrap() else {
            panic!()
        };
        assert!(matches!(
            validate_request(&value.headers),
            Err(Error::InvalidUpgradeHeader)
        ));
    }

    #[test]
    fn builds_response_with_expected_accept() {
        let resp = build_response("dGhlIHNhbXBsZSBub25jZQ==", None, None);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[test]
    fn client_request_response_round_trip() {
        let req_bytes = build_request(
            "/",
            "example.com",
            "dGhlIHNhbXBsZSBub25jZQ==",
            &[],
            &[],
            &[],
        );
        assert!(String::from_utf8(req_bytes).unwrap().starts_with("GET / HTTP/1.1\r\n"));

        let resp = build_response("dGhlIHNhbXBsZSBub25jZQ==", None, None);
        let ParseOutcome::Complete { value, .. } = parse_response(&resp, 4096).unwrap() else {
            panic!()
        };
        validate_response(&value.headers, value.status, "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
    }
}
