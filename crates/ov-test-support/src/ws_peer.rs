//! A minimal hand-rolled WebSocket client for integration tests.
//!
//! Deliberately does not pull in a WebSocket crate: the point is to drive
//! the webserver's own handshake and framing code from the outside, the
//! same way `rt-test-utils::MockWsClient` drives the forwarder's WS
//! endpoint with a real client in its corpus — except here the "real
//! client" is this crate's few dozen lines, mirroring the server's own
//! hand-rolled framer in `ov_core::ws_frame`.

use ov_core::ws_frame::{self, OPCODE_TEXT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct WsPeer {
    stream: TcpStream,
}

impl WsPeer {
    /// Perform the HTTP upgrade handshake against `host`/`path` and return
    /// a peer ready to exchange WS frames.
    pub async fn connect(addr: std::net::SocketAddr, host: &str, path: &str) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;

        let key_bytes = uuid::Uuid::new_v4();
        let client_key = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(key_bytes.as_bytes())
        };

        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {client_key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = vec![0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = stream.read(&mut buf).await?;
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let expected_accept = ws_frame::compute_accept_key(&client_key);
        let response = String::from_utf8_lossy(&received);
        assert!(response.contains("101"), "handshake did not upgrade: {response}");
        assert!(
            response.to_lowercase().contains(&expected_accept.to_lowercase()),
            "server returned an unexpected Sec-WebSocket-Accept"
        );

        Ok(WsPeer { stream })
    }

    pub async fn send_text(&mut self, text: &str) -> std::io::Result<()> {
        for chunk in ws_frame::encode_message(text.as_bytes(), true) {
            self.stream.write_all(&chunk).await?;
        }
        Ok(())
    }

    pub async fn send_json(&mut self, value: &serde_json::Value) -> std::io::Result<()> {
        self.send_text(&value.to_string()).await
    }

    /// Read and decode one WS text frame, returning its raw payload bytes.
    /// Panics on a non-text/non-final frame since tests only need the
    /// common case; extend if a test needs fragmentation or control frames.
    pub async fn recv_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await?;
        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        assert!(fin, "fragmented test frames are not supported by WsPeer");
        assert_eq!(opcode, OPCODE_TEXT, "expected a text frame");
        let masked = header[1] & 0x80 != 0;
        let mut len = u64::from(header[1] & 0x7F);
        if len == 126 {
            let mut ext = [0u8; 2];
            self.stream.read_exact(&mut ext).await?;
            len = u64::from(u16::from_be_bytes(ext));
        } else if len == 127 {
            let mut ext = [0u8; 8];
            self.stream.read_exact(&mut ext).await?;
            len = u64::from_be_bytes(ext);
        }
        let mask = if masked {
            let mut m = [0u8; 4];
            self.stream.read_exact(&mut m).await?;
            Some(m)
        } else {
            None
        };
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await?;
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }
        Ok(payload)
    }

    pub async fn recv_json(&mut self) -> std::io::Result<serde_json::Value> {
        let payload = self.recv_frame().await?;
        Ok(serde_json::from_slice(&payload).expect("server sent non-JSON WS payload"))
    }
}
