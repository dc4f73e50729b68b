//! Connection and listener data model.

use std::net::SocketAddr;
use std::time::Instant;

use ov_core::ParserState;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;

pub type SocketId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    Accepted,
}

/// Which parser a connection's bytes are decoded with. Carries just enough
/// to construct a fresh [`ParserState`]; the `objects_only` flag mirrors the
/// JSON IO buffer's same-named flag.
#[derive(Debug, Clone, Copy)]
pub enum ParserKind {
    RawPassthrough,
    Json { objects_only: bool },
    Http,
    WebSocketJson { objects_only: bool },
}

impl ParserKind {
    pub fn build(self) -> ParserState {
        match self {
            ParserKind::RawPassthrough => ParserState::RawPassthrough,
            ParserKind::Json { objects_only } => ParserState::json(objects_only),
            ParserKind::Http => ParserState::http(),
            ParserKind::WebSocketJson { objects_only } => ParserState::web_socket_json(objects_only),
        }
    }
}

/// Configuration a socket is opened with.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub parser: ParserKind,
    /// `Some(interval)` gives client connections automatic reconnect;
    /// ignored for server/accepted sockets.
    pub reconnect_interval: Option<std::time::Duration>,
}

impl SocketConfig {
    pub fn new(parser: ParserKind) -> Self {
        SocketConfig { parser, reconnect_interval: None }
    }

    pub fn with_reconnect(mut self, interval: std::time::Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }
}

/// One live connection. The write half is owned here; the read half is
/// moved into a dedicated reader task at connection setup and never
/// touched again from this struct.
pub struct Connection {
    pub socket: SocketId,
    pub uuid: String,
    pub role: Role,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub parser: ParserState,
    pub last_inbound: Instant,
    pub write_half: WriteHalf<TcpStream>,
    pub owning_listener: Option<SocketId>,
    pub config: SocketConfig,
}

impl Connection {
    pub fn new(
        socket: SocketId,
        role: Role,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        write_half: WriteHalf<TcpStream>,
        config: SocketConfig,
        owning_listener: Option<SocketId>,
    ) -> Self {
        Connection {
            socket,
            uuid: uuid::Uuid::new_v4().to_string(),
            role,
            local_addr,
            remote_addr,
            parser: config.parser.build(),
            last_inbound: Instant::now(),
            write_half,
            owning_listener,
            config,
        }
    }
}

/// A listener's bookkeeping.
pub struct Listener {
    pub socket: SocketId,
    pub config: SocketConfig,
    pub children: std::collections::HashSet<SocketId>,
}
