//! The control-plane signaling socket ICE proxies connect to, and the
//! request/response correlation that ties a browser's session request to
//! a proxy's reply.
//!
//! Proxies are plain `ov_app::App` TCP clients speaking the
//! `register`/`ice_*` JSON protocol `ov-proto` defines. The TLS-facing
//! domain listener in `domain` never touches a proxy socket directly: it
//! only exchanges [`ClientRequest`]/[`FrontendEvent`] with this module
//! through an [`OrchestratorHandle`], the same "single owner drains
//! everything, everyone else talks to it through a handle" discipline
//! `ov_app::App` itself uses.
//!
//! Every outbound request gets a single-instruction "await proxy reply"
//! program in the VM purely so a stuck proxy can be timed out
//! (`lock_timeout_msecs`); a reply that arrives in time removes the
//! program directly, silently, before it ever times out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ov_app::{App, AppEvent, OutboundData, ParserKind, SocketConfig, SocketId};
use ov_proto::{error_codes, Envelope, Instruction, RegisterParams};
use ov_vm::{StepResult, TriggerOutcome, Vm};
use ov_vocs::{FrontendEvent, FrontendRegistry, IceFrontend};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const OP_AWAIT_PROXY_REPLY: u8 = 0x10;

/// A request the domain-facing listener asks this module to forward to
/// whichever proxy currently has the lowest session load.
pub enum ClientRequest {
    SessionCreate { sdp: String, reply: oneshot::Sender<FrontendEvent> },
    SessionUpdate { session: String, reply: oneshot::Sender<FrontendEvent> },
    SessionDrop { session: String, reply: oneshot::Sender<FrontendEvent> },
    Candidate {
        session: String,
        candidate: String,
        ufrag: String,
        mid: u32,
        mline_index: u32,
        reply: oneshot::Sender<FrontendEvent>,
    },
    Talk { session: String, on: bool, reply: oneshot::Sender<FrontendEvent> },
    /// Register interest in push notifications (inbound `candidate` /
    /// `end_of_candidates`) for a session this caller created.
    Listen { session: String, sink: mpsc::UnboundedSender<FrontendEvent> },
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<ClientRequest>,
}

fn timed_out(kind: &str) -> FrontendEvent {
    let msg = Some(format!("{kind} timed out waiting for a proxy reply"));
    match kind {
        "session_create" => FrontendEvent::SessionCreated { id: String::new(), error_code: error_codes::TIMEOUT, message: msg, session: None },
        "session_update" => FrontendEvent::SessionUpdated { id: String::new(), error_code: error_codes::TIMEOUT, message: msg },
        "session_drop" => FrontendEvent::SessionDropped { id: String::new(), error_code: error_codes::TIMEOUT, message: msg },
        "candidate" => FrontendEvent::Candidate { id: String::new(), error_code: error_codes::TIMEOUT, message: msg },
        _ => FrontendEvent::Talk { id: String::new(), error_code: error_codes::TIMEOUT, message: msg },
    }
}

impl OrchestratorHandle {
    pub async fn session_create(&self, sdp: String) -> FrontendEvent {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ClientRequest::SessionCreate { sdp, reply });
        rx.await.unwrap_or_else(|_| timed_out("session_create"))
    }

    pub async fn session_update(&self, session: String) -> FrontendEvent {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ClientRequest::SessionUpdate { session, reply });
        rx.await.unwrap_or_else(|_| timed_out("session_update"))
    }

    pub async fn session_drop(&self, session: String) -> FrontendEvent {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ClientRequest::SessionDrop { session, reply });
        rx.await.unwrap_or_else(|_| timed_out("session_drop"))
    }

    pub async fn candidate(&self, session: String, candidate: String, ufrag: String, mid: u32, mline_index: u32) -> FrontendEvent {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ClientRequest::Candidate { session, candidate, ufrag, mid, mline_index, reply });
        rx.await.unwrap_or_else(|_| timed_out("candidate"))
    }

    pub async fn talk(&self, session: String, on: bool) -> FrontendEvent {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ClientRequest::Talk { session, on, reply });
        rx.await.unwrap_or_else(|_| timed_out("talk"))
    }

    pub fn listen(&self, session: String, sink: mpsc::UnboundedSender<FrontendEvent>) {
        let _ = self.tx.send(ClientRequest::Listen { session, sink });
    }
}

#[derive(Clone, Copy, Debug)]
enum PendingKind {
    SessionCreate,
    SessionUpdate,
    SessionDrop,
    Candidate,
    Talk,
}

impl PendingKind {
    fn label(&self) -> &'static str {
        match self {
            PendingKind::SessionCreate => "session_create",
            PendingKind::SessionUpdate => "session_update",
            PendingKind::SessionDrop => "session_drop",
            PendingKind::Candidate => "candidate",
            PendingKind::Talk => "talk",
        }
    }

    fn error_event(&self, id: String, error_code: i64, message: String) -> FrontendEvent {
        let message = Some(message);
        match self {
            PendingKind::SessionCreate => FrontendEvent::SessionCreated { id, error_code, message, session: None },
            PendingKind::SessionUpdate => FrontendEvent::SessionUpdated { id, error_code, message },
            PendingKind::SessionDrop => FrontendEvent::SessionDropped { id, error_code, message },
            PendingKind::Candidate => FrontendEvent::Candidate { id, error_code, message },
            PendingKind::Talk => FrontendEvent::Talk { id, error_code, message },
        }
    }
}

type ReplyTable = Arc<Mutex<HashMap<String, (PendingKind, oneshot::Sender<FrontendEvent>)>>>;
type ListenerTable = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<FrontendEvent>>>>;

pub struct Orchestrator {
    app: App,
    registry: FrontendRegistry,
    frontend: IceFrontend,
    vm: Vm<()>,
    replies: ReplyTable,
    listeners: ListenerTable,
    client_rx: mpsc::UnboundedReceiver<ClientRequest>,
}

impl Orchestrator {
    /// Bind the control-plane listener and return the orchestrator plus the
    /// handle the domain listener uses to reach it.
    pub async fn bind(addr: SocketAddr, lock_timeout_msecs: u64) -> std::io::Result<(Self, OrchestratorHandle)> {
        let mut app = App::new();
        app.open_server(addr, SocketConfig::new(ParserKind::Json { objects_only: true })).await?;

        let replies: ReplyTable = Arc::new(Mutex::new(HashMap::new()));
        let listeners: ListenerTable = Arc::new(Mutex::new(HashMap::new()));
        let aborted_replies = replies.clone();
        let mut vm = Vm::new(
            4096,
            (lock_timeout_msecs as i64) * 1000,
            |_data: ()| {},
            |_id| {},
            move |id| {
                if let Some((kind, sender)) = aborted_replies.lock().unwrap().remove(id) {
                    let message = format!("{} timed out waiting for a proxy reply", kind.label());
                    let _ = sender.send(kind.error_event(id.to_string(), error_codes::TIMEOUT, message));
                }
            },
            |_id| {},
        );
        vm.register(
            OP_AWAIT_PROXY_REPLY,
            "await_proxy_reply",
            Box::new(|_program, _args| StepResult::WaitAndNext),
            Some(Box::new(|_program, _args| StepResult::Next)),
        )
        .unwrap();

        let (tx, client_rx) = mpsc::unbounded_channel();
        Ok((
            Orchestrator {
                app,
                registry: FrontendRegistry::new(),
                frontend: IceFrontend::new(),
                vm,
                replies,
                listeners,
                client_rx,
            },
            OrchestratorHandle { tx },
        ))
    }

    fn track(&mut self, uuid: String, kind: PendingKind, reply: oneshot::Sender<FrontendEvent>) {
        self.replies.lock().unwrap().insert(uuid.clone(), (kind, reply));
        let program = vec![Instruction::new(OP_AWAIT_PROXY_REPLY, [0, 0, 0]), Instruction::end()];
        if let TriggerOutcome::TriggerFail(()) = self.vm.trigger(uuid.clone(), program, (), now_usecs()) {
            if let Some((kind, sender)) = self.replies.lock().unwrap().remove(&uuid) {
                let _ = sender.send(kind.error_event(
                    uuid,
                    error_codes::CAPACITY_EXHAUSTED,
                    "too many requests awaiting a proxy reply".to_string(),
                ));
            }
        }
    }

    fn resolve(&mut self, event: FrontendEvent) {
        let id = event_id(&event).to_string();
        let _ = self.vm.store_mut().remove(&id);
        if let Some((_, sender)) = self.replies.lock().unwrap().remove(&id) {
            let _ = sender.send(event);
        }
    }

    async fn send_to_selected_proxy(&mut self, envelope: Envelope) -> Result<(), FrontendEvent> {
        let socket = self.registry.select_proxy().ok_or_else(|| FrontendEvent::SessionCreated {
            id: envelope.uuid.clone().unwrap_or_default(),
            error_code: error_codes::NOT_FOUND,
            message: Some("no ICE proxy is registered".to_string()),
            session: None,
        })?;
        let value = serde_json::to_value(&envelope).unwrap();
        self.app.send(socket, OutboundData::Json(value)).await.map_err(|e| FrontendEvent::SessionCreated {
            id: envelope.uuid.clone().unwrap_or_default(),
            error_code: error_codes::COMMS_ERROR,
            message: Some(e.to_string()),
            session: None,
        })
    }

    async fn handle_client_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::SessionCreate { sdp, reply } => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let envelope = self.frontend.compose_session_create(uuid.clone(), sdp);
                if let Err(event) = self.send_to_selected_proxy(envelope).await {
                    let _ = reply.send(event);
                    return;
                }
                self.track(uuid, PendingKind::SessionCreate, reply);
            }
            ClientRequest::SessionUpdate { session, reply } => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let envelope = self.frontend.compose_session_update(uuid.clone(), session);
                if let Err(event) = self.send_to_selected_proxy(envelope).await {
                    let _ = reply.send(event);
                    return;
                }
                self.track(uuid, PendingKind::SessionUpdate, reply);
            }
            ClientRequest::SessionDrop { session, reply } => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let envelope = self.frontend.compose_session_drop(uuid.clone(), session);
                if let Err(event) = self.send_to_selected_proxy(envelope).await {
                    let _ = reply.send(event);
                    return;
                }
                self.track(uuid, PendingKind::SessionDrop, reply);
            }
            ClientRequest::Candidate { session, candidate, ufrag, mid, mline_index, reply } => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let envelope = self.frontend.compose_candidate(uuid.clone(), session, candidate, ufrag, mid, mline_index);
                if let Err(event) = self.send_to_selected_proxy(envelope).await {
                    let _ = reply.send(event);
                    return;
                }
                self.track(uuid, PendingKind::Candidate, reply);
            }
            ClientRequest::Talk { session, on, reply } => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let envelope = self.frontend.compose_talk(uuid.clone(), session, on);
                if let Err(event) = self.send_to_selected_proxy(envelope).await {
                    let _ = reply.send(event);
                    return;
                }
                self.track(uuid, PendingKind::Talk, reply);
            }
            ClientRequest::Listen { session, sink } => {
                self.listeners.lock().unwrap().insert(session, sink);
            }
        }
    }

    async fn handle_register(&mut self, socket: SocketId, envelope: &Envelope) {
        let params: Option<RegisterParams> = envelope.parameter.clone().and_then(|v| serde_json::from_value(v).ok());
        let Some(params) = params else {
            warn!(socket, "register request missing uuid parameter");
            self.app.close(socket);
            return;
        };
        if self.registry.register_proxy(socket, params.uuid).is_err() {
            warn!(socket, "socket already registered as a proxy");
            self.app.close(socket);
            return;
        }
        if let Some(uuid) = envelope.uuid.clone() {
            let response = Envelope::response("register", uuid, serde_json::json!({}));
            let _ = self.app.send(socket, OutboundData::Json(serde_json::to_value(&response).unwrap())).await;
        }
    }

    fn forward_to_listener(&mut self, session: &str, event: FrontendEvent) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(sink) = listeners.get(session) {
            if sink.send(event).is_err() {
                listeners.remove(session);
            }
        }
    }

    async fn handle_app_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Success { socket, values, .. } => {
                for value in values {
                    let Ok(envelope) = serde_json::from_value::<Envelope>(value) else {
                        debug!(socket, "control-plane message missing a top-level `event` field");
                        continue;
                    };
                    if envelope.event == "register" {
                        self.handle_register(socket, &envelope).await;
                        continue;
                    }
                    let Some(frontend_event) = self.frontend.handle_inbound(&envelope) else { continue };
                    self.apply_frontend_event(socket, frontend_event).await;
                }
            }
            AppEvent::Closed { socket, .. } => {
                let _ = self.registry.unregister_proxy(socket);
            }
            _ => {}
        }
    }

    async fn apply_frontend_event(&mut self, socket: SocketId, event: FrontendEvent) {
        if event.requires_dropping_proxy() {
            warn!(socket, "dropping proxy after a malformed session_create response");
            self.app.close(socket);
        }

        if let FrontendEvent::SessionCreated { session: Some(session), .. } = &event {
            let _ = self.registry.register_session(socket, session.session.clone());
        }

        // Bare notifications pushed by a proxy (not a reply to one of our
        // own requests) are routed to whichever browser session is
        // listening rather than resolved against `replies`.
        match &event {
            FrontendEvent::Candidate { error_code, .. } if *error_code == error_codes::NOT_A_RESPONSE => {
                if let Some(session) = self.registry.single_session_of(socket).map(str::to_string) {
                    self.forward_to_listener(&session, event);
                }
                return;
            }
            FrontendEvent::EndOfCandidates { .. } => {
                if let Some(session) = self.registry.single_session_of(socket).map(str::to_string) {
                    self.forward_to_listener(&session, event);
                }
                return;
            }
            _ => {}
        }

        self.resolve(event);
    }

    /// Drive the control-plane socket and the client-request channel
    /// forever (until the process is asked to stop).
    pub async fn run(mut self) {
        let mut timeout_tick = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                event = self.app.next_event() => {
                    match event {
                        Some(event) => self.handle_app_event(event).await,
                        None => return,
                    }
                }
                request = self.client_rx.recv() => {
                    match request {
                        Some(request) => self.handle_client_request(request).await,
                        None => return,
                    }
                }
                _ = timeout_tick.tick() => {
                    self.vm.scan_timeouts(now_usecs());
                }
            }
        }
    }
}

fn event_id(event: &FrontendEvent) -> &str {
    match event {
        FrontendEvent::SessionCreated { id, .. }
        | FrontendEvent::SessionUpdated { id, .. }
        | FrontendEvent::SessionDropped { id, .. }
        | FrontendEvent::Candidate { id, .. }
        | FrontendEvent::EndOfCandidates { id, .. }
        | FrontendEvent::Talk { id, .. } => id,
    }
}

fn now_usecs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as i64
}
