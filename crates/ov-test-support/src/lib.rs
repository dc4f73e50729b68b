//! Mock TCP/WebSocket test doubles for driving the runtime end to end in
//! integration tests, in the spirit of `rt-test-utils`'s mock server/client
//! pair but built against this workspace's own hand-rolled wire formats.

pub mod raw_peer;
pub mod ws_peer;

pub use raw_peer::RawPeer;
pub use ws_peer::WsPeer;

/// Bind to an ephemeral port and hand back the address, without holding the
/// listener open — used to pre-select an address for an `App::open_server`
/// call so a test can connect to it without racing the bind.
pub async fn reserve_addr() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral port should never fail in tests");
    listener.local_addr().expect("a bound listener always has a local address")
}
