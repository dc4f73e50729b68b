//! JSON IO buffer.
//!
//! Turns a byte stream into a sequence of complete top-level JSON values,
//! retaining only the trailing incomplete bytes. The "tolerant completeness
//! match" is delegated to `serde_json`'s streaming deserializer: attempting to
//! parse the residual buffer either succeeds (consuming `byte_offset()`
//! bytes), reports `eof` (meaning `Progress` — wait for more bytes), or
//! reports a real syntax error (meaning the connection's buffer is malformed
//! and must be dropped).
//!
//! This module does not itself call back into connection/handler code: it
//! returns the values it could parse, and the caller (the App's decode loop)
//! is responsible for delivering them in order and stopping early if a
//! handler drops the connection mid-delivery.

use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum JsonBufferError {
    #[error("top-level value is not a JSON object")]
    Mismatch,
    #[error("malformed JSON: {0}")]
    Malformed(String),
}

fn is_json_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Per-connection residual-buffer state machine.
#[derive(Default)]
pub struct JsonIoBuffer {
    residual: BytesMut,
    objects_only: bool,
}

impl JsonIoBuffer {
    pub fn new(objects_only: bool) -> Self {
        JsonIoBuffer {
            residual: BytesMut::new(),
            objects_only,
        }
    }

    /// Append `bytes` and drain as many complete top-level values as
    /// possible. On success, the trailing incomplete bytes (if any) remain
    /// buffered for the next call. On error, the buffer is dropped — the
    /// caller must not call `push` again without first calling
    /// [`JsonIoBuffer::clear`] (or treat the connection as closed).
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<serde_json::Value>, JsonBufferError> {
        if !bytes.is_empty() {
            self.residual.extend_from_slice(bytes);
        }
        let mut out = Vec::new();
        loop {
            let skip = self.residual.iter().position(|b| !is_json_ws(*b));
            let skip = match skip {
                Some(s) => s,
                None => {
                    self.residual.clear();
                    return Ok(out);
                }
            };
            if skip > 0 {
                self.residual.advance(skip);
            }
            if self.residual.is_empty() {
                return Ok(out);
            }

            if self.objects_only && self.residual[0] != b'{' {
                self.residual.clear();
                return Err(JsonBufferError::Mismatch);
            }

            let mut stream =
                serde_json::Deserializer::from_slice(&self.residual[..]).into_iter::<serde_json::Value>();
            match stream.next() {
                None => return Ok(out),
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset();
                    self.residual.advance(consumed);
                    out.push(value);
                }
                Some(Err(e)) => {
                    if e.is_eof() {
                        return Ok(out);
                    }
                    self.residual.clear();
                    return Err(JsonBufferError::Malformed(e.to_string()));
                }
            }
        }
    }

    /// Discard any buffered, not-yet-complete bytes.
    pub fn clear(&mut self) {
        self.residual.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.residual.is_empty()
    }
}

/// A mapping from connection key (socket handle, uuid, ...) to residual
/// buffer, matching the original's `ov_json_io_buffer` data model directly.
#[derive(Default)]
pub struct JsonIoBufferPool<K> {
    buffers: HashMap<K, JsonIoBuffer>,
    objects_only: bool,
}

impl<K: Eq + Hash + Clone> JsonIoBufferPool<K> {
    pub fn new(objects_only: bool) -> Self {
        JsonIoBufferPool {
            buffers: HashMap::new(),
            objects_only,
        }
    }

    pub fn push(
        &mut self,
        key: K,
        bytes: &[u8],
    ) -> Result<Vec<serde_json::Value>, JsonBufferError> {
        let objects_only = self.objects_only;
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| JsonIoBuffer::new(objects_only));
        let result = buffer.push(bytes);
        if result.is_err() {
            self.buffers.remove(&key);
        }
        result
    }

    /// Drop all content buffered for `key` (e.g. on connection close).
    pub fn drop_key(&mut self, key: &K) {
        self.buffers.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_push_invokes_nothing() {
        let mut buf = JsonIoBuffer::new(false);
        let out = buf.push(b"").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn parses_multiple_values_in_one_chunk_in_order() {
        let mut buf = JsonIoBuffer::new(false);
        let out = buf.push(br#"{"a":1} {"b":2}"#).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["a"], 1);
        assert_eq!(out[1]["b"], 2);
    }

    #[test]
    fn retains_trailing_incomplete_value_across_pushes() {
        let mut buf = JsonIoBuffer::new(false);
        let out = buf.push(br#"{"a":1} {"b""#).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!buf.is_empty());
        let out2 = buf.push(br#":2}"#).unwrap();
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0]["b"], 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn bare_number_waits_for_delimiter() {
        let mut buf = JsonIoBuffer::new(false);
        let out = buf.push(b"12").unwrap();
        assert!(out.is_empty());
        let out2 = buf.push(b"3 ").unwrap();
        assert_eq!(out2, vec![serde_json::json!(123)]);
    }

    #[test]
    fn objects_only_rejects_non_object_top_level() {
        let mut buf = JsonIoBuffer::new(true);
        let err = buf.push(b"[1,2,3]").unwrap_err();
        assert_eq!(err, JsonBufferError::Mismatch);
    }

    #[test]
    fn malformed_input_drops_buffer() {
        let mut buf = JsonIoBuffer::new(false);
        let err = buf.push(b"{not json}").unwrap_err();
        assert!(matches!(err, JsonBufferError::Malformed(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn pool_tracks_independent_buffers_per_key() {
        let mut pool: JsonIoBufferPool<u64> = JsonIoBufferPool::new(false);
        let a = pool.push(1, br#"{"x":1"#).unwrap();
        let b = pool.push(2, br#"{"y":2}"#).unwrap();
        assert!(a.is_empty());
        assert_eq!(b.len(), 1);
        let a2 = pool.push(1, b"}").unwrap();
        assert_eq!(a2.len(), 1);
        assert_eq!(a2[0]["x"], 1);
    }

    #[test]
    fn pool_drops_buffer_on_error_so_later_push_starts_fresh() {
        let mut pool: JsonIoBufferPool<u64> = JsonIoBufferPool::new(false);
        assert!(pool.push(1, b"{bad}").is_err());
        let out = pool.push(1, br#"{"ok":true}"#).unwrap();
        assert_eq!(out.len(), 1);
    }
}
