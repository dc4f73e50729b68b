//! A bare TCP peer for exercising `RawPassthrough`/`Json`/`Http` connections
//! end to end without going through a full [`ov_app::App`] on the test side.
//!
//! Grounded on `rt-test-utils::mock_ws_client`'s shape (connect, then
//! send/recv helpers over the raw stream) but stripped down to plain bytes,
//! since the runtime under test already owns the framing.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub async fn connect(addr: std::net::SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(RawPeer { stream })
    }

    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn send_json_line(&mut self, value: &serde_json::Value) -> std::io::Result<()> {
        self.send(value.to_string().as_bytes()).await
    }

    /// Read until at least one byte has arrived, then drain whatever else
    /// is immediately available without blocking further.
    pub async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn recv_json(&mut self) -> std::io::Result<serde_json::Value> {
        let bytes = self.recv().await?;
        Ok(serde_json::from_slice(&bytes).expect("peer sent non-JSON bytes"))
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
