//! App runtime.
//!
//! Grounded on `services/server/src/state.rs`'s `AppState` (shared maps
//! mutated through async methods) and `services/forwarder/src/uplink.rs`'s
//! reconnect loop, but restructured around a single actor: every producer
//! (accept task, per-connection reader, connect/reconnect task) reports
//! through one [`AppCommand`] channel, and [`App::next_event`] is the sole
//! place state is mutated — the same "one thread drains everything"
//! discipline `ov_core::EventLoop` uses, extended here to carry the bytes
//! and socket lifecycle a literal readiness callback can't.
//!
//! Parser `Success`/`Answer`/`Mismatch`/... decode outcomes are queued
//! internally and drained one at a time by `next_event`, checking the
//! connection is still alive before each: a handler dropping its own
//! connection while iterating a `Success` batch's values is what makes the
//! remaining queued outcomes silently disappear.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ov_core::DecodeOutcome;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{Connection, Listener, Role, SocketConfig};
use crate::error::AppError;

pub type SocketId = u64;

enum AppCommand {
    Accepted {
        listener: SocketId,
        socket: SocketId,
        stream: TcpStream,
        remote: Option<SocketAddr>,
    },
    ConnectResult {
        socket: SocketId,
        remote: SocketAddr,
        is_reconnect: bool,
        result: std::io::Result<TcpStream>,
    },
    ReadBytes {
        socket: SocketId,
        bytes: Vec<u8>,
    },
    ReadClosed {
        socket: SocketId,
    },
    CloseRequested {
        socket: SocketId,
    },
}

/// What a signaling/dispatch layer driving `App` observes.
#[derive(Debug)]
pub enum AppEvent {
    Accepted { listener: SocketId, socket: SocketId, uuid: String, remote: Option<SocketAddr> },
    Opened { socket: SocketId, uuid: String },
    Reconnected { socket: SocketId, uuid: String },
    ConnectFailed { socket: SocketId },
    Success { socket: SocketId, uuid: String, remote: Option<SocketAddr>, values: Vec<Value> },
    HttpRequest { socket: SocketId, uuid: String, remote: Option<SocketAddr>, request: ov_core::http::Request },
    Closed { socket: SocketId, uuid: String },
}

/// Data to hand to a connection's `send` path.
pub enum OutboundData {
    Raw(Vec<u8>),
    Json(Value),
}

/// Cheap producer-side handle, mirroring `ov_core::EventLoopHandle`.
#[derive(Clone)]
pub struct AppHandle {
    tx: mpsc::UnboundedSender<AppCommand>,
}

impl AppHandle {
    pub fn close(&self, socket: SocketId) {
        let _ = self.tx.send(AppCommand::CloseRequested { socket });
    }
}

pub struct App {
    tx: mpsc::UnboundedSender<AppCommand>,
    rx: mpsc::UnboundedReceiver<AppCommand>,
    next_socket_id: Arc<AtomicU64>,
    connections: HashMap<SocketId, Connection>,
    uuid_index: HashMap<String, SocketId>,
    listeners: HashMap<SocketId, Listener>,
    pending_outcomes: VecDeque<(SocketId, DecodeOutcome)>,
    pending_client_configs: HashMap<SocketId, SocketConfig>,
    reconnect_configs: HashMap<SocketId, SocketConfig>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        App {
            tx,
            rx,
            next_socket_id: Arc::new(AtomicU64::new(1)),
            connections: HashMap::new(),
            uuid_index: HashMap::new(),
            listeners: HashMap::new(),
            pending_outcomes: VecDeque::new(),
            pending_client_configs: HashMap::new(),
            reconnect_configs: HashMap::new(),
        }
    }

    pub fn handle(&self) -> AppHandle {
        AppHandle { tx: self.tx.clone() }
    }

    pub fn is_connected(&self, socket: SocketId) -> bool {
        self.connections.contains_key(&socket)
    }

    pub fn uuid_of(&self, socket: SocketId) -> Option<&str> {
        self.connections.get(&socket).map(|c| c.uuid.as_str())
    }

    pub fn socket_of(&self, uuid: &str) -> Option<SocketId> {
        self.uuid_index.get(uuid).copied()
    }

    /// Bind a listener and start accepting connections (server-mode `open`).
    /// Returns immediately; acceptance is asynchronous.
    pub async fn open_server(&mut self, addr: SocketAddr, config: SocketConfig) -> std::io::Result<SocketId> {
        let listener = TcpListener::bind(addr).await?;
        let socket = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(socket, Listener { socket, config, children: HashSet::new() });

        let tx = self.tx.clone();
        let next_id = self.next_socket_id.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let child = next_id.fetch_add(1, Ordering::Relaxed);
                        if tx
                            .send(AppCommand::Accepted { listener: socket, socket: child, stream, remote: Some(remote) })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(socket)
    }

    /// Initiate a client connection (client-mode `open`).
    /// Returns the socket id immediately; the connection completes
    /// asynchronously and is reported via [`AppEvent::Opened`] or
    /// [`AppEvent::ConnectFailed`].
    pub fn open_client(&mut self, addr: SocketAddr, config: SocketConfig) -> SocketId {
        let socket = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        self.pending_client_configs.insert(socket, config);
        spawn_connect(socket, addr, false, self.tx.clone());
        socket
    }

    pub fn close(&mut self, socket: SocketId) {
        self.queue_close(socket);
    }

    pub fn connection_close(&mut self, uuid: &str) {
        if let Some(&socket) = self.uuid_index.get(uuid) {
            self.queue_close(socket);
        }
    }

    /// Schedule close of every client connection. Safe to call from a
    /// handler: teardown happens via the normal command queue, not
    /// synchronously.
    pub fn connection_close_all(&self) {
        for (&socket, conn) in &self.connections {
            if conn.role == Role::Client {
                let _ = self.tx.send(AppCommand::CloseRequested { socket });
            }
        }
    }

    fn queue_close(&self, socket: SocketId) {
        let _ = self.tx.send(AppCommand::CloseRequested { socket });
    }

    pub async fn send(&mut self, socket: SocketId, data: OutboundData) -> Result<(), AppError> {
        let conn = self.connections.get_mut(&socket).ok_or(AppError::UnknownSocket(socket))?;
        let bytes = encode_outbound(&conn.parser, data)?;
        conn.write_half.write_all(&bytes).await?;
        Ok(())
    }

    /// Replace a connection's parser in place, e.g. the webserver switching
    /// a connection from `Http` to `WebSocketJson` once a `101` upgrade
    /// response has been sent.
    pub fn set_parser(&mut self, socket: SocketId, kind: crate::connection::ParserKind) -> Result<(), AppError> {
        let conn = self.connections.get_mut(&socket).ok_or(AppError::UnknownSocket(socket))?;
        conn.parser = kind.build();
        Ok(())
    }

    /// Drain internal state until something the caller must act on occurs,
    /// or the command source is exhausted (`None`).
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        loop {
            if let Some((socket, outcome)) = self.pending_outcomes.pop_front() {
                if !self.connections.contains_key(&socket) {
                    continue;
                }
                if let Some(event) = self.handle_outcome(socket, outcome).await {
                    return Some(event);
                }
                continue;
            }

            let cmd = self.rx.recv().await?;
            if let Some(event) = self.apply(cmd).await {
                return Some(event);
            }
        }
    }

    async fn apply(&mut self, cmd: AppCommand) -> Option<AppEvent> {
        match cmd {
            AppCommand::Accepted { listener, socket, stream, remote } => {
                let config = self.listeners.get(&listener)?.config.clone();
                let local = stream.local_addr().ok();
                let (read_half, write_half) = tokio::io::split(stream);
                let conn = Connection::new(socket, Role::Accepted, local, remote, write_half, config, Some(listener));
                let uuid = conn.uuid.clone();
                self.uuid_index.insert(uuid.clone(), socket);
                self.connections.insert(socket, conn);
                if let Some(l) = self.listeners.get_mut(&listener) {
                    l.children.insert(socket);
                }
                spawn_reader(socket, read_half, self.tx.clone());
                Some(AppEvent::Accepted { listener, socket, uuid, remote })
            }
            AppCommand::ConnectResult { socket, remote, is_reconnect, result } => match result {
                Ok(stream) => {
                    let config = self
                        .pending_client_configs
                        .remove(&socket)
                        .or_else(|| self.reconnect_configs.remove(&socket))
                        .unwrap_or_else(|| SocketConfig::new(crate::connection::ParserKind::RawPassthrough));
                    let local = stream.local_addr().ok();
                    let (read_half, write_half) = tokio::io::split(stream);
                    let conn = Connection::new(socket, Role::Client, local, Some(remote), write_half, config, None);
                    let uuid = conn.uuid.clone();
                    self.uuid_index.insert(uuid.clone(), socket);
                    self.connections.insert(socket, conn);
                    spawn_reader(socket, read_half, self.tx.clone());
                    if is_reconnect {
                        Some(AppEvent::Reconnected { socket, uuid })
                    } else {
                        Some(AppEvent::Opened { socket, uuid })
                    }
                }
                Err(e) => {
                    debug!(socket, error = %e, "connect failed");
                    self.pending_client_configs.remove(&socket);
                    self.reconnect_configs.remove(&socket);
                    if is_reconnect { None } else { Some(AppEvent::ConnectFailed { socket }) }
                }
            },
            AppCommand::ReadBytes { socket, bytes } => {
                if let Some(conn) = self.connections.get_mut(&socket) {
                    conn.last_inbound = Instant::now();
                    for outcome in conn.parser.decode(&bytes) {
                        self.pending_outcomes.push_back((socket, outcome));
                    }
                }
                None
            }
            AppCommand::ReadClosed { socket } => self.close_internal(socket).await,
            AppCommand::CloseRequested { socket } => self.close_internal(socket).await,
        }
    }

    async fn handle_outcome(&mut self, socket: SocketId, outcome: DecodeOutcome) -> Option<AppEvent> {
        match outcome {
            DecodeOutcome::Progress => None,
            DecodeOutcome::Success(values) => {
                let conn = self.connections.get(&socket)?;
                Some(AppEvent::Success { socket, uuid: conn.uuid.clone(), remote: conn.remote_addr, values })
            }
            DecodeOutcome::HttpRequest(request) => {
                let conn = self.connections.get(&socket)?;
                Some(AppEvent::HttpRequest { socket, uuid: conn.uuid.clone(), remote: conn.remote_addr, request })
            }
            DecodeOutcome::Answer(response) => {
                let _ = self.send(socket, OutboundData::Raw(response.encode())).await;
                None
            }
            DecodeOutcome::AnswerKeep(bytes) => {
                let _ = self.send(socket, OutboundData::Raw(bytes)).await;
                None
            }
            DecodeOutcome::AnswerClose(bytes) => {
                let _ = self.send(socket, OutboundData::Raw(bytes)).await;
                self.close_internal(socket).await
            }
            DecodeOutcome::Mismatch | DecodeOutcome::Error(_) | DecodeOutcome::Close => {
                self.close_internal(socket).await
            }
        }
    }

    async fn close_internal(&mut self, socket: SocketId) -> Option<AppEvent> {
        let mut conn = self.connections.remove(&socket)?;
        let _ = conn.write_half.shutdown().await;
        self.uuid_index.remove(&conn.uuid);
        if let Some(listener_id) = conn.owning_listener {
            if let Some(l) = self.listeners.get_mut(&listener_id) {
                l.children.remove(&socket);
            }
        }
        self.pending_outcomes.retain(|(s, _)| *s != socket);

        if conn.role == Role::Client {
            if let (Some(interval), Some(remote)) = (conn.config.reconnect_interval, conn.remote_addr) {
                let new_socket = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
                self.reconnect_configs.insert(new_socket, conn.config.clone());
                spawn_reconnect(new_socket, remote, interval, self.tx.clone());
            }
        }

        Some(AppEvent::Closed { socket, uuid: conn.uuid })
    }
}

fn encode_outbound(parser: &ov_core::ParserState, data: OutboundData) -> Result<Vec<u8>, AppError> {
    use ov_core::ParserState::*;
    match (parser, data) {
        (RawPassthrough, OutboundData::Raw(bytes)) => Ok(bytes),
        (Http(_), OutboundData::Raw(bytes)) => Ok(bytes),
        (Json(_), OutboundData::Json(v)) => {
            serde_json::to_vec(&v).map_err(|e| AppError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
        }
        (WebSocketJson { .. }, OutboundData::Json(v)) => {
            let bytes = serde_json::to_vec(&v)
                .map_err(|e| AppError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            Ok(ov_core::encode_message(&bytes, true).concat())
        }
        _ => Err(AppError::EncoderMismatch),
    }
}

fn spawn_reader(socket: SocketId, mut read_half: tokio::io::ReadHalf<TcpStream>, tx: mpsc::UnboundedSender<AppCommand>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(AppCommand::ReadClosed { socket });
                    return;
                }
                Ok(n) => {
                    if tx.send(AppCommand::ReadBytes { socket, bytes: buf[..n].to_vec() }).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    let _ = tx.send(AppCommand::ReadClosed { socket });
                    return;
                }
            }
        }
    });
}

fn spawn_connect(socket: SocketId, addr: SocketAddr, is_reconnect: bool, tx: mpsc::UnboundedSender<AppCommand>) {
    tokio::spawn(async move {
        let result = TcpStream::connect(addr).await;
        let _ = tx.send(AppCommand::ConnectResult { socket, remote: addr, is_reconnect, result });
    });
}

fn spawn_reconnect(socket: SocketId, addr: SocketAddr, interval: Duration, tx: mpsc::UnboundedSender<AppCommand>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = tx.send(AppCommand::ConnectResult { socket, remote: addr, is_reconnect: true, result: Ok(stream) });
                    return;
                }
                Err(_) => continue,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ParserKind;

    #[tokio::test]
    async fn server_receives_json_message_from_client() {
        // Bind via std first to learn the ephemeral port, then hand the
        // address to both App instances; avoids a race on the listener's
        // chosen port.
        let bound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = bound.local_addr().unwrap();
        drop(bound);

        let mut server = App::new();
        server
            .open_server(addr, SocketConfig::new(ParserKind::Json { objects_only: true }))
            .await
            .unwrap();

        let mut client = App::new();
        let client_socket = client.open_client(addr, SocketConfig::new(ParserKind::Json { objects_only: true }));

        let opened = client.next_event().await.unwrap();
        assert!(matches!(opened, AppEvent::Opened { socket, .. } if socket == client_socket));

        client
            .send(client_socket, OutboundData::Json(serde_json::json!({"event": "hello"})))
            .await
            .unwrap();

        let accepted = server.next_event().await.unwrap();
        let child_socket = match accepted {
            AppEvent::Accepted { socket, .. } => socket,
            _ => panic!("expected Accepted"),
        };

        let success = server.next_event().await.unwrap();
        match success {
            AppEvent::Success { socket, values, .. } => {
                assert_eq!(socket, child_socket);
                assert_eq!(values[0]["event"], "hello");
            }
            _ => panic!("expected Success"),
        }
    }

    #[tokio::test]
    async fn closing_a_connection_emits_closed_and_drops_from_index() {
        let bound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = bound.local_addr().unwrap();
        drop(bound);

        let mut server = App::new();
        server
            .open_server(addr, SocketConfig::new(ParserKind::RawPassthrough))
            .await
            .unwrap();
        let mut client = App::new();
        let client_socket = client.open_client(addr, SocketConfig::new(ParserKind::RawPassthrough));
        client.next_event().await.unwrap();

        let accepted = server.next_event().await.unwrap();
        let child_socket = match accepted {
            AppEvent::Accepted { socket, .. } => socket,
            _ => panic!("expected Accepted"),
        };

        server.close(child_socket);
        let closed = server.next_event().await.unwrap();
        assert!(matches!(closed, AppEvent::Closed { socket, .. } if socket == child_socket));
        assert!(!server.is_connected(child_socket));
    }
}
