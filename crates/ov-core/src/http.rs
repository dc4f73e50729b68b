//! Minimal HTTP/1.1 message parser.
//!
//! Covers exactly the surface the webserver needs: a request line, an
//! ordered table of unique-by-name headers, and an optional body delimited
//! by `Content-Length`. No crate in the reference stack pulls in a dedicated
//! HTTP parsing library for this, so this mirrors the hand-rolled framing
//! already used for WebSocket frames and the JSON buffer.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HttpError {
    #[error("request line is malformed")]
    BadRequestLine,
    #[error("header line is malformed: {0}")]
    BadHeader(String),
    #[error("duplicate header: {0}")]
    DuplicateHeader(String),
    #[error("Content-Length is not a valid number")]
    BadContentLength,
}

/// A fully parsed request, plus how many bytes of the input it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HeaderTable,
    pub body: Vec<u8>,
}

/// Case-insensitive, insertion-ordered, unique-by-name header table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderTable {
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl HeaderTable {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_ascii_lowercase())
    }

    fn insert(&mut self, name: &str, value: String) -> Result<(), HttpError> {
        let key = name.to_ascii_lowercase();
        if self.values.contains_key(&key) {
            return Err(HttpError::DuplicateHeader(name.to_string()));
        }
        self.order.push(key.clone());
        self.values.insert(key, value);
        Ok(())
    }

    /// Iterate headers in the order they appeared on the wire, using the
    /// original (lowercased) name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.values[k].as_str()))
    }
}

fn split_lines(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], &buf[pos + 2..]))
}

/// Parse one request out of `buf`. Returns `Ok(None)` when more bytes are
/// needed (headers incomplete, or body shorter than `Content-Length`).
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, HttpError> {
    let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(p) => p,
        None => return Ok(None),
    };
    let head = &buf[..head_end];
    let body_start = head_end + 4;

    let (request_line, mut rest) = split_lines(head).ok_or(HttpError::BadRequestLine)?;
    let request_line = std::str::from_utf8(request_line).map_err(|_| HttpError::BadRequestLine)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    let path = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    let version = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    if parts.next().is_some() {
        return Err(HttpError::BadRequestLine);
    }

    let mut headers = HeaderTable::default();
    while !rest.is_empty() {
        let (line, next) = split_lines(rest).unwrap_or((rest, &[]));
        rest = next;
        let line = std::str::from_utf8(line).map_err(|_| HttpError::BadHeader(String::new()))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::BadHeader(line.to_string()))?;
        headers.insert(name.trim(), value.trim().to_string())?;
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v.parse::<usize>().map_err(|_| HttpError::BadContentLength)?,
        None => 0,
    };

    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    let body = buf[body_start..body_start + content_length].to_vec();
    Ok(Some((
        Request { method, path, version, headers, body },
        body_start + content_length,
    )))
}

/// A response ready to be serialized onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Response { status, reason, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Every successful GET response carries `Accept-Ranges: bytes`, matching
    /// how static file serving advertises range-request support.
    pub fn with_accept_ranges(self) -> Self {
        self.with_header("Accept-Ranges", "bytes")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// `206 Partial Content` helper: a single-range response per a `Range:
/// bytes=start-end` request header, as served by the static file handler.
pub fn partial_content(body: &[u8], start: usize, end_inclusive: usize, total: usize) -> Response {
    Response::new(206, "Partial Content")
        .with_header(
            "Content-Range",
            format!("bytes {start}-{end_inclusive}/{total}"),
        )
        .with_accept_ranges()
        .with_body(body[start..=end_inclusive].to_vec())
}

/// Parse a single-range `Range: bytes=start-end` header value. Open-ended
/// ranges (`bytes=500-`) resolve `end` to `total - 1`; a literal `end` of 0
/// (`bytes=500-0`) means the same thing.
pub fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    let start: usize = start_s.parse().ok()?;
    let end = if end_s.is_empty() {
        total.checked_sub(1)?
    } else {
        match end_s.parse().ok()? {
            0 => total.checked_sub(1)?,
            n => n,
        }
    };
    if start > end || end >= total {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_with_no_body() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.org\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.headers.get("host"), Some("example.org"));
    }

    #[test]
    fn incomplete_headers_yield_progress() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.org\r\n";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn body_shorter_than_content_length_yields_progress() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn body_is_sliced_exactly_to_content_length() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcXYZ";
        let (req, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.body, b"abc");
        assert_eq!(consumed, raw.len() - 3);
    }

    #[test]
    fn duplicate_header_is_rejected() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n";
        assert_eq!(parse_request(raw), Err(HttpError::DuplicateHeader("Host".to_string())));
    }

    #[test]
    fn websocket_upgrade_headers_are_preserved_in_order() {
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap().unwrap();
        let names: Vec<&str> = req.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["upgrade", "connection", "sec-websocket-key", "sec-websocket-version"]);
    }

    #[test]
    fn encode_response_has_accept_ranges_and_content_length() {
        let resp = Response::new(200, "OK").with_accept_ranges().with_body(b"hi".to_vec());
        let encoded = String::from_utf8(resp.encode()).unwrap();
        assert!(encoded.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(encoded.contains("Accept-Ranges: bytes\r\n"));
        assert!(encoded.contains("Content-Length: 2\r\n"));
        assert!(encoded.ends_with("hi"));
    }

    #[test]
    fn range_header_parses_closed_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
    }

    #[test]
    fn range_header_parses_open_ended_range() {
        assert_eq!(parse_range("bytes=900-", 1000), Some((900, 999)));
    }

    #[test]
    fn range_header_out_of_bounds_is_rejected() {
        assert_eq!(parse_range("bytes=0-2000", 1000), None);
    }

    #[test]
    fn range_header_literal_zero_end_means_to_end() {
        assert_eq!(parse_range("bytes=900-0", 1000), Some((900, 999)));
    }

    #[test]
    fn partial_content_sets_content_range_and_accept_ranges() {
        let body = b"0123456789";
        let resp = partial_content(body, 2, 4, body.len());
        assert_eq!(resp.status, 206);
        assert_eq!(resp.body, b"234");
        assert!(resp.headers.iter().any(|(k, v)| k == "Content-Range" && v == "bytes 2-4/10"));
    }
}
