//! A canned ICE proxy: connects to the webserver's control-plane socket,
//! registers itself, and answers every `ice_session_create`/`ice_session_update`/
//! `ice_session_drop`/`candidate`/`talk` request with a fixed, configurable
//! reply. Exists to drive the webserver end to end without a real ICE
//! implementation on the other side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ov_app::{App, AppEvent, OutboundData, SocketConfig};
use ov_proto::{Envelope, RegisterParams};
use ov_signaling::{Dispatcher, HandlerOutcome};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server_addr: SocketAddr,
    pub uuid: String,
    pub ssrc: u32,
    pub forward_host: String,
    pub forward_port: u16,
    pub forward_transport: String,
    pub sdp_answer: String,
}

pub async fn run(config: ProxyConfig) {
    let mut app = App::new();
    let socket = app.open_client(
        config.server_addr,
        SocketConfig::new(ov_app::ParserKind::Json { objects_only: true }),
    );

    loop {
        match app.next_event().await {
            Some(AppEvent::Opened { .. }) => break,
            Some(AppEvent::ConnectFailed { .. }) => {
                error!(addr = %config.server_addr, "failed to connect to the control-plane socket");
                return;
            }
            Some(_) => continue,
            None => return,
        }
    }

    info!(addr = %config.server_addr, uuid = %config.uuid, "connected, registering as a proxy");
    let register = Envelope::request("register", "register", serde_json::to_value(RegisterParams { uuid: config.uuid.clone() }).unwrap());
    let _ = app.send(socket, OutboundData::Json(serde_json::to_value(&register).unwrap())).await;

    let session_counter = Arc::new(AtomicU64::new(0));
    let mut dispatcher = Dispatcher::new();

    dispatcher.register(
        "ice_session_create",
        "create a session and return canned forwarding targets",
        make_session_create_handler(config.clone(), session_counter),
    );
    dispatcher.register("ice_session_update", "acknowledge a session update", ack_handler());
    dispatcher.register("ice_session_drop", "acknowledge a session drop", ack_handler());
    dispatcher.register("candidate", "acknowledge a candidate", ack_handler());
    dispatcher.register("talk", "acknowledge a talk toggle", ack_handler());

    dispatcher.run(&mut app).await;
}

fn make_session_create_handler(config: ProxyConfig, session_counter: Arc<AtomicU64>) -> ov_signaling::Handler {
    Box::new(move |_app, _envelope, _socket, _remote| {
        let n = session_counter.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("{}-session-{n}", config.uuid);
        HandlerOutcome::Reply(serde_json::json!({
            "session": session_id,
            "type": "answer",
            "sdp": config.sdp_answer,
            "proxy": [{
                "ssrc": config.ssrc,
                "socket": {"host": config.forward_host, "port": config.forward_port, "type": config.forward_transport},
            }],
        }))
    })
}

fn ack_handler() -> ov_signaling::Handler {
    Box::new(|_app, _envelope, _socket, _remote| HandlerOutcome::Reply(serde_json::json!({})))
}
