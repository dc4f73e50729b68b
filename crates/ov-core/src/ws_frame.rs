//! WebSocket frame reassembly and the handshake accept-key computation used
//! by the webserver's upgrade path.
//!
//! Framing itself is hand-rolled (RFC 6455 §5.2) since the reassembly
//! automaton — control frames short-circuiting the data fragmentation state,
//! `Ping`/`Pong`/`Close` handling, outbound chunking above a size limit — is
//! exactly the behavior under test here. The accept-key SHA-1/Base64 step is
//! delegated to the `sha1`/`base64` crates; hand-rolling hashing would be
//! reimplementing a crypto primitive for no benefit.

use bytes::{Buf, BytesMut};
use thiserror::Error;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`.
pub fn compute_accept_key(client_key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[derive(Debug, Error, PartialEq)]
pub enum WsError {
    #[error("fragmentation sequence violated the data-frame automaton")]
    FragmentationError,
    #[error("reserved/unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),
}

struct DecodedFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Parse a single frame out of `buf`. Returns `None` ("Progress": need more
/// bytes) or `Some((frame, consumed_bytes))`.
fn decode_frame(buf: &[u8]) -> Option<(DecodedFrame, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let opcode = b0 & 0x0F;
    let masked = b1 & 0x80 != 0;
    let mut len = u64::from(b1 & 0x7F);
    let mut offset = 2usize;

    if len == 126 {
        if buf.len() < offset + 2 {
            return None;
        }
        len = u64::from(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
        offset += 2;
    } else if len == 127 {
        if buf.len() < offset + 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        len = u64::from_be_bytes(raw);
        offset += 8;
    }

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return None;
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total_needed = offset + len as usize;
    if buf.len() < total_needed {
        return None;
    }

    let mut payload = buf[offset..total_needed].to_vec();
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Some((DecodedFrame { fin, opcode, payload }, total_needed))
}

/// Result of processing one inbound frame through the reassembler.
#[derive(Debug, PartialEq)]
pub enum WsAction {
    /// A complete application message (possibly reassembled from fragments).
    Deliver(Vec<u8>),
    /// Reply with an unmasked `Pong` carrying this payload.
    SendPong(Vec<u8>),
    /// Peer requested close; close the connection.
    Close,
    /// A `Pong` frame — nothing to do.
    Ignored,
}

/// Per-connection fragment reassembly state.
#[derive(Default)]
pub struct WsReassembler {
    residual: BytesMut,
    pending: Vec<u8>,
    in_chain: bool,
}

impl WsReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and decode as many complete frames as are available,
    /// producing an action per frame (data frames may produce zero actions
    /// while buffering a fragment, or one `Deliver` when a chain completes).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<WsAction>, WsError> {
        self.residual.extend_from_slice(bytes);
        let mut actions = Vec::new();
        loop {
            let decoded = decode_frame(&self.residual[..]);
            let (frame, consumed) = match decoded {
                Some(v) => v,
                None => return Ok(actions),
            };
            self.residual.advance(consumed);

            if frame.opcode >= 8 {
                match frame.opcode {
                    OPCODE_PING => actions.push(WsAction::SendPong(frame.payload)),
                    OPCODE_PONG => actions.push(WsAction::Ignored),
                    OPCODE_CLOSE => {
                        actions.push(WsAction::Close);
                        return Ok(actions);
                    }
                    other => return Err(WsError::UnsupportedOpcode(other)),
                }
                continue;
            }

            match (frame.fin, frame.opcode, self.in_chain) {
                // None: unfragmented data frame.
                (true, op, false) if op == OPCODE_TEXT || op == OPCODE_BINARY => {
                    actions.push(WsAction::Deliver(frame.payload));
                }
                // Start: begins a fragmented chain.
                (false, op, false) if op == OPCODE_TEXT || op == OPCODE_BINARY => {
                    self.pending = frame.payload;
                    self.in_chain = true;
                }
                // Continue: mid-chain continuation.
                (false, OPCODE_CONTINUATION, true) => {
                    self.pending.extend_from_slice(&frame.payload);
                }
                // Last: chain completes.
                (true, OPCODE_CONTINUATION, true) => {
                    self.pending.extend_from_slice(&frame.payload);
                    let complete = std::mem::take(&mut self.pending);
                    self.in_chain = false;
                    actions.push(WsAction::Deliver(complete));
                }
                _ => {
                    self.in_chain = false;
                    self.pending.clear();
                    return Err(WsError::FragmentationError);
                }
            }
        }
    }
}

/// Outbound chunk size above which a message is split into a `Text` frame
/// plus trailing `Continuation` frames.
pub const CHUNK_LIMIT: usize = 1000;

/// Encode one frame (server frames are never masked).
pub fn encode_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let b0 = (if fin { 0x80 } else { 0 }) | (opcode & 0x0F);
    out.push(b0);

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Serialize `payload` into one or more outbound frames, chunking at
/// [`CHUNK_LIMIT`] bytes when it exceeds that size.
pub fn encode_message(payload: &[u8], text: bool) -> Vec<Vec<u8>> {
    let first_opcode = if text { OPCODE_TEXT } else { OPCODE_BINARY };
    if payload.len() <= CHUNK_LIMIT {
        return vec![encode_frame(first_opcode, true, payload)];
    }

    let mut frames = Vec::new();
    let mut chunks = payload.chunks(CHUNK_LIMIT).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let is_last = chunks.peek().is_none();
        let opcode = if first { first_opcode } else { OPCODE_CONTINUATION };
        frames.push(encode_frame(opcode, is_last, chunk));
        first = false;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(opcode: u8, fin: bool, payload: &[u8]) -> (bool, u8, Vec<u8>) {
        let frame = encode_frame(opcode, fin, payload);
        let (decoded, consumed) = decode_frame(&frame).expect("frame should decode");
        assert_eq!(consumed, frame.len());
        (decoded.fin, decoded.opcode, decoded.payload)
    }

    #[test]
    fn encode_then_decode_yields_original_payload_and_opcode() {
        let (fin, opcode, payload) = roundtrip(OPCODE_TEXT, true, b"hello");
        assert!(fin);
        assert_eq!(opcode, OPCODE_TEXT);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn truncated_frame_yields_progress() {
        let full = encode_frame(OPCODE_TEXT, true, b"hello world");
        assert!(decode_frame(&full[..full.len() - 3]).is_none());
    }

    #[test]
    fn accept_key_matches_known_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn unfragmented_data_frame_delivers_immediately() {
        let mut r = WsReassembler::new();
        let frame = encode_frame(OPCODE_TEXT, true, b"hi");
        let actions = r.feed(&frame).unwrap();
        assert_eq!(actions, vec![WsAction::Deliver(b"hi".to_vec())]);
    }

    #[test]
    fn fragmented_chain_delivers_only_after_last() {
        let mut r = WsReassembler::new();
        let start = encode_frame(OPCODE_TEXT, false, b"ab");
        let cont = encode_frame(OPCODE_CONTINUATION, false, b"cd");
        let last = encode_frame(OPCODE_CONTINUATION, true, b"ef");

        assert_eq!(r.feed(&start).unwrap(), vec![]);
        assert_eq!(r.feed(&cont).unwrap(), vec![]);
        assert_eq!(
            r.feed(&last).unwrap(),
            vec![WsAction::Deliver(b"abcdef".to_vec())]
        );
    }

    #[test]
    fn continuation_without_start_is_an_error() {
        let mut r = WsReassembler::new();
        let cont = encode_frame(OPCODE_CONTINUATION, true, b"x");
        assert_eq!(r.feed(&cont), Err(WsError::FragmentationError));
    }

    #[test]
    fn start_while_already_in_chain_is_an_error() {
        let mut r = WsReassembler::new();
        let start = encode_frame(OPCODE_TEXT, false, b"a");
        r.feed(&start).unwrap();
        let start2 = encode_frame(OPCODE_TEXT, false, b"b");
        assert_eq!(r.feed(&start2), Err(WsError::FragmentationError));
    }

    #[test]
    fn ping_produces_pong_with_same_payload() {
        let mut r = WsReassembler::new();
        let ping = encode_frame(OPCODE_PING, true, b"ping-data");
        let actions = r.feed(&ping).unwrap();
        assert_eq!(actions, vec![WsAction::SendPong(b"ping-data".to_vec())]);
    }

    #[test]
    fn pong_is_ignored() {
        let mut r = WsReassembler::new();
        let pong = encode_frame(OPCODE_PONG, true, b"");
        assert_eq!(r.feed(&pong).unwrap(), vec![WsAction::Ignored]);
    }

    #[test]
    fn close_frame_requests_close() {
        let mut r = WsReassembler::new();
        let close = encode_frame(OPCODE_CLOSE, true, b"");
        assert_eq!(r.feed(&close).unwrap(), vec![WsAction::Close]);
    }

    #[test]
    fn masked_inbound_frame_is_unmasked_before_delivery() {
        let mut r = WsReassembler::new();
        let payload = b"secret";
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut masked_payload = payload.to_vec();
        for (i, b) in masked_payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        let mut frame = Vec::new();
        frame.push(0x80 | OPCODE_TEXT);
        frame.push(0x80 | (payload.len() as u8));
        frame.extend_from_slice(&mask);
        frame.extend_from_slice(&masked_payload);

        let actions = r.feed(&frame).unwrap();
        assert_eq!(actions, vec![WsAction::Deliver(payload.to_vec())]);
    }

    #[test]
    fn large_message_is_chunked_then_reassembles_to_original() {
        let payload = vec![b'x'; CHUNK_LIMIT * 2 + 7];
        let frames = encode_message(&payload, true);
        assert!(frames.len() >= 3);

        let mut r = WsReassembler::new();
        let mut delivered = Vec::new();
        for f in &frames {
            delivered.extend(r.feed(f).unwrap());
        }
        assert_eq!(delivered, vec![WsAction::Deliver(payload)]);
    }

    #[test]
    fn small_message_is_a_single_unfragmented_frame() {
        let payload = b"small".to_vec();
        let frames = encode_message(&payload, true);
        assert_eq!(frames.len(), 1);
    }
}
