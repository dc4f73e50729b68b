//! Event-name dispatch table over the App runtime.
//!
//! Grounded on `services/server/src/ws_forwarder.rs`'s axum handler shape
//! (parse → look up by name → call → reply), rebuilt here as a long-lived
//! loop over `App::next_event` rather than a per-request async handler,
//! since one dispatcher instance should serialize every socket's traffic
//! rather than spawning a task per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use ov_app::{App, AppEvent, OutboundData, SocketId};
use ov_proto::Envelope;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

pub enum HandlerOutcome {
    NoReply,
    Reply(Value),
    CloseSocket,
}

pub type Handler = Box<dyn FnMut(&mut App, &Envelope, SocketId, Option<SocketAddr>) -> HandlerOutcome + Send + Sync>;
pub type Monitor = Box<dyn FnMut(Direction, SocketId, Option<SocketAddr>, &Value) + Send + Sync>;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(10);

pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    descriptions: HashMap<String, String>,
    monitor: Option<Monitor>,
    stop_requested: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            handlers: HashMap::new(),
            descriptions: HashMap::new(),
            monitor: None,
            stop_requested: false,
        }
    }

    pub fn register(&mut self, event: impl Into<String>, description: impl Into<String>, handler: Handler) {
        let event = event.into();
        self.descriptions.insert(event.clone(), description.into());
        self.handlers.insert(event, handler);
    }

    pub fn set_monitor(&mut self, monitor: Monitor) {
        self.monitor = Some(monitor);
    }

    /// Drive `app` until it has no more producers (`next_event` returns
    /// `None`) or a `shutdown` command was processed.
    pub async fn run(&mut self, app: &mut App) {
        while !self.stop_requested {
            let event = match app.next_event().await {
                Some(e) => e,
                None => return,
            };
            if let AppEvent::Success { socket, remote, values, .. } = event {
                for value in values {
                    if !app.is_connected(socket) {
                        break;
                    }
                    self.dispatch_one(app, socket, remote, value).await;
                    if self.stop_requested {
                        break;
                    }
                }
            }
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    async fn dispatch_one(&mut self, app: &mut App, socket: SocketId, remote: Option<SocketAddr>, value: Value) {
        if let Some(monitor) = &mut self.monitor {
            monitor(Direction::In, socket, remote, &value);
        }

        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(env) => env,
            Err(_) => {
                warn!(socket, "signaling message missing a top-level `event` field");
                return;
            }
        };

        if envelope.event == "help" {
            self.reply(app, socket, &envelope, serde_json::to_value(&self.descriptions).unwrap()).await;
            return;
        }
        if envelope.event == "shutdown" {
            self.reply(app, socket, &envelope, serde_json::json!({})).await;
            self.stop_requested = true;
            return;
        }

        let outcome = match self.handlers.get_mut(&envelope.event) {
            Some(handler) => handler(app, &envelope, socket, remote),
            None => HandlerOutcome::NoReply,
        };

        match outcome {
            HandlerOutcome::NoReply => {}
            HandlerOutcome::Reply(response) => self.reply(app, socket, &envelope, response).await,
            HandlerOutcome::CloseSocket => app.close(socket),
        }
    }

    async fn reply(&self, app: &mut App, socket: SocketId, request: &Envelope, response: Value) {
        let Some(uuid) = &request.uuid else { return };
        let envelope = Envelope::response(request.event.clone(), uuid.clone(), response);
        let out = serde_json::to_value(&envelope).unwrap();
        let _ = app.send(socket, OutboundData::Json(out)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_and_shutdown_are_reserved_event_names() {
        let d = Dispatcher::new();
        assert!(!d.handlers.contains_key("help"));
        assert!(!d.handlers.contains_key("shutdown"));
    }
}
