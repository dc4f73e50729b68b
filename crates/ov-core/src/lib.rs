//! Streaming parsers and the cooperative event loop adapter that the rest of
//! the runtime is built on.

pub mod error;
pub mod event_loop;
pub mod http;
pub mod json_buffer;
pub mod ws_frame;

pub use error::CoreError;
pub use event_loop::{EventLoop, EventLoopHandle, Interest, SocketId, TimerId};
pub use json_buffer::{JsonBufferError, JsonIoBuffer, JsonIoBufferPool};
pub use ws_frame::{compute_accept_key, encode_message, WsAction, WsError, WsReassembler};

/// What a connection's decode step produced this round. A connection owns
/// exactly one variant for its lifetime; only [`DecodeOutcome`] varies call
/// to call.
pub enum ParserState {
    /// Raw bytes passed straight to the handler — no framing at all.
    RawPassthrough,
    /// Newline- or buffer-delimited JSON values.
    Json(JsonIoBuffer),
    /// A single HTTP request followed by the connection closing or
    /// upgrading. Carries the residual bytes of a request still being
    /// accumulated.
    Http(bytes::BytesMut),
    /// A WebSocket connection carrying JSON messages: frames are
    /// reassembled, then each complete message is itself fed through a
    /// `JsonIoBuffer`, as the App runtime does for WS-transported signaling.
    WebSocketJson { frames: WsReassembler, json: JsonIoBuffer },
}

/// Outcome of pushing bytes through a [`ParserState`] once.
pub enum DecodeOutcome {
    /// No complete unit yet; more bytes are needed.
    Progress,
    /// One or more complete values were parsed and handed to the caller's
    /// handler, which ran synchronously and returned normally.
    Success(Vec<serde_json::Value>),
    /// A complete HTTP request was parsed; the caller decides the response
    /// (static file lookup, WS upgrade, etc) and drives the connection from
    /// here.
    HttpRequest(http::Request),
    /// A complete HTTP response is ready to send, after which the
    /// connection should be kept open (HTTP keep-alive) or closed.
    Answer(http::Response),
    /// Raw bytes to send back with the connection kept open (a WS `Pong`
    /// reply to a `Ping`).
    AnswerKeep(Vec<u8>),
    /// Like `AnswerKeep`, but the connection must be closed afterward (HTTP
    /// `Connection: close`, or a WS `Close` frame echoed back).
    AnswerClose(Vec<u8>),
    /// The bytes do not belong to this parser (e.g. `objects_only` rejected
    /// a non-object top level). The connection must be dropped.
    Mismatch,
    /// A protocol-level error occurred; the connection must be dropped.
    Error(CoreError),
    /// The peer asked to close (WS `Close` frame, or HTTP `Connection:
    /// close` after a response was already sent).
    Close,
}

impl ParserState {
    pub fn json(objects_only: bool) -> Self {
        ParserState::Json(JsonIoBuffer::new(objects_only))
    }

    pub fn http() -> Self {
        ParserState::Http(bytes::BytesMut::new())
    }

    pub fn web_socket_json(objects_only: bool) -> Self {
        ParserState::WebSocketJson {
            frames: WsReassembler::new(),
            json: JsonIoBuffer::new(objects_only),
        }
    }

    /// Feed newly read bytes through the parser, producing however many
    /// `DecodeOutcome`s resulted (a single WS read can complete more than
    /// one JSON message).
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<DecodeOutcome> {
        match self {
            ParserState::RawPassthrough => vec![DecodeOutcome::Success(vec![])],
            ParserState::Json(buf) => match buf.push(bytes) {
                Ok(values) if values.is_empty() => vec![DecodeOutcome::Progress],
                Ok(values) => vec![DecodeOutcome::Success(values)],
                Err(JsonBufferError::Mismatch) => vec![DecodeOutcome::Mismatch],
                Err(e) => vec![DecodeOutcome::Error(CoreError::Json(e))],
            },
            ParserState::Http(buf) => {
                buf.extend_from_slice(bytes);
                match http::parse_request(buf) {
                    Ok(Some((request, consumed))) => {
                        bytes::Buf::advance(buf, consumed);
                        vec![DecodeOutcome::HttpRequest(request)]
                    }
                    Ok(None) => vec![DecodeOutcome::Progress],
                    Err(e) => vec![DecodeOutcome::Error(CoreError::Http(e))],
                }
            }
            ParserState::WebSocketJson { frames, json } => {
                let actions = match frames.feed(bytes) {
                    Ok(a) => a,
                    Err(e) => return vec![DecodeOutcome::Error(CoreError::Ws(e))],
                };
                let mut out = Vec::new();
                for action in actions {
                    match action {
                        WsAction::Deliver(payload) => match json.push(&payload) {
                            Ok(values) if values.is_empty() => out.push(DecodeOutcome::Progress),
                            Ok(values) => out.push(DecodeOutcome::Success(values)),
                            Err(JsonBufferError::Mismatch) => out.push(DecodeOutcome::Mismatch),
                            Err(e) => out.push(DecodeOutcome::Error(CoreError::Json(e))),
                        },
                        WsAction::SendPong(payload) => {
                            let frame = ws_frame::encode_frame(ws_frame::OPCODE_PONG, true, &payload);
                            out.push(DecodeOutcome::AnswerKeep(frame));
                        }
                        WsAction::Ignored => out.push(DecodeOutcome::Progress),
                        WsAction::Close => out.push(DecodeOutcome::Close),
                    }
                }
                if out.is_empty() {
                    out.push(DecodeOutcome::Progress);
                }
                out
            }
        }
    }

    /// Whether this parser is holding onto unconsumed buffered input (used
    /// by the App's parse-again trampoline to decide whether to re-notify
    /// itself before waiting on the next socket readiness event).
    pub fn has_buffered_input(&self) -> bool {
        match self {
            ParserState::RawPassthrough => false,
            ParserState::Http(buf) => !buf.is_empty(),
            ParserState::Json(buf) => !buf.is_empty(),
            ParserState::WebSocketJson { json, .. } => !json.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_parser_reports_progress_then_success() {
        let mut parser = ParserState::json(false);
        let out = parser.decode(br#"{"a":1"#);
        assert!(matches!(out[0], DecodeOutcome::Progress));
        assert!(parser.has_buffered_input());

        let out = parser.decode(b"}");
        match &out[0] {
            DecodeOutcome::Success(values) => assert_eq!(values[0]["a"], 1),
            _ => panic!("expected Success"),
        }
        assert!(!parser.has_buffered_input());
    }

    #[test]
    fn web_socket_json_parser_composes_frame_and_json_decoding() {
        let mut parser = ParserState::web_socket_json(false);
        let frame = ws_frame::encode_frame(ws_frame::OPCODE_TEXT, true, br#"{"event":"ping"}"#);
        let out = parser.decode(&frame);
        match &out[0] {
            DecodeOutcome::Success(values) => assert_eq!(values[0]["event"], "ping"),
            _ => panic!("expected Success"),
        }
    }

    #[test]
    fn http_parser_buffers_until_request_line_and_headers_complete() {
        let mut parser = ParserState::http();
        let out = parser.decode(b"GET /index.html HTTP/1.1\r\n");
        assert!(matches!(out[0], DecodeOutcome::Progress));
        assert!(parser.has_buffered_input());

        let out = parser.decode(b"Host: example.org\r\n\r\n");
        match &out[0] {
            DecodeOutcome::HttpRequest(request) => {
                assert_eq!(request.method, "GET");
                assert_eq!(request.path, "/index.html");
            }
            _ => panic!("expected HttpRequest"),
        }
        assert!(!parser.has_buffered_input());
    }

    #[test]
    fn web_socket_ping_frame_yields_pong_answer_without_closing() {
        let mut parser = ParserState::web_socket_json(false);
        let ping = ws_frame::encode_frame(ws_frame::OPCODE_PING, true, b"x");
        let out = parser.decode(&ping);
        assert!(matches!(out[0], DecodeOutcome::AnswerKeep(_)));
    }
}
