//! Domain-facing HTTP/WebSocket listener.
//!
//! `ov_app::App` is TCP-only, so each TLS connection here is driven by a
//! bespoke per-connection task feeding the same `ov_core::ParserState`
//! state machine the App runtime uses internally — `ov_core`'s parsers
//! are plain data structures fed by bytes, usable from any driver, not
//! just `App`'s. A connection starts as `ParserState::http()`, serves
//! static files straight off `DomainConfig::path`, and on a valid
//! `Upgrade: websocket` request switches to `ParserState::web_socket_json`
//! and starts exchanging signaling `Envelope`s with the orchestrator.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ov_core::{http, DecodeOutcome, ParserState};
use ov_proto::{error_codes, CandidateParams, Envelope, SessionCreateParams, SessionRefParams, TalkParams};
use ov_vocs::FrontendEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::DomainConfig;
use crate::orchestration::OrchestratorHandle;

/// Accept TLS connections on `stream` forever, dispatching each to its own
/// connection task.
pub async fn serve(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    domains: Arc<Vec<DomainConfig>>,
    orchestrator: OrchestratorHandle,
) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed on domain listener");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let domains = domains.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(tls) => handle_connection(tls, remote, domains, orchestrator).await,
                Err(e) => debug!(%remote, error = %e, "TLS handshake failed"),
            }
        });
    }
}

async fn handle_connection(
    mut stream: TlsStream<TcpStream>,
    remote: SocketAddr,
    domains: Arc<Vec<DomainConfig>>,
    orchestrator: OrchestratorHandle,
) {
    let mut parser = ParserState::http();
    let mut read_buf = [0u8; 8192];

    loop {
        let n = match stream.read(&mut read_buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        for outcome in parser.decode(&read_buf[..n]) {
            match outcome {
                DecodeOutcome::HttpRequest(request) => {
                    if is_websocket_upgrade(&request) {
                        if let Err(e) = send_upgrade_response(&mut stream, &request).await {
                            debug!(%remote, error = %e, "failed to send WS upgrade response");
                            return;
                        }
                        return run_websocket(stream, orchestrator).await;
                    } else {
                        let domain_name = request.headers.get("host").unwrap_or("").to_string();
                        let response = serve_static(&domains, &domain_name, &request);
                        if stream.write_all(&response.encode()).await.is_err() {
                            return;
                        }
                    }
                }
                DecodeOutcome::Progress => {}
                _ => return,
            }
        }
    }
}

/// Drive an upgraded connection: decode inbound `Envelope`s from the
/// browser and forward push notifications the orchestrator routed to a
/// session this connection created, until either side closes.
async fn run_websocket(mut stream: TlsStream<TcpStream>, orchestrator: OrchestratorHandle) {
    let mut parser = ParserState::web_socket_json(true);
    let mut read_buf = [0u8; 8192];
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<FrontendEvent>();

    loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for outcome in parser.decode(&read_buf[..n]) {
                    match outcome {
                        DecodeOutcome::Success(values) => {
                            for value in values {
                                if let Some(reply) = dispatch_client_message(value, &orchestrator, &push_tx).await {
                                    if write_envelope(&mut stream, &reply).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        DecodeOutcome::AnswerKeep(bytes) => {
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        DecodeOutcome::AnswerClose(bytes) => {
                            let _ = stream.write_all(&bytes).await;
                            return;
                        }
                        DecodeOutcome::Progress => {}
                        _ => return,
                    }
                }
            }
            pushed = push_rx.recv() => {
                let Some(event) = pushed else { return };
                let envelope = frontend_event_to_envelope(push_event_name(&event), event);
                if write_envelope(&mut stream, &envelope).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn push_event_name(event: &FrontendEvent) -> &'static str {
    match event {
        FrontendEvent::EndOfCandidates { .. } => "end_of_candidates",
        _ => "candidate",
    }
}

async fn write_envelope(stream: &mut TlsStream<TcpStream>, envelope: &Envelope) -> std::io::Result<()> {
    let frames = ov_core::encode_message(&serde_json::to_vec(envelope).unwrap(), true);
    for frame in frames {
        stream.write_all(&frame).await?;
    }
    Ok(())
}

fn is_websocket_upgrade(request: &http::Request) -> bool {
    request
        .headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn send_upgrade_response(stream: &mut TlsStream<TcpStream>, request: &http::Request) -> std::io::Result<()> {
    let Some(key) = request.headers.get("sec-websocket-key") else {
        let response = http::Response::new(400, "Bad Request").with_body(b"missing Sec-WebSocket-Key".to_vec());
        stream.write_all(&response.encode()).await?;
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Sec-WebSocket-Key"));
    };
    let accept = ov_core::compute_accept_key(key);
    let response = http::Response::new(101, "Switching Protocols")
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", accept);
    stream.write_all(&encode_upgrade(&response)).await
}

/// `http::Response::encode` always appends `Content-Length`, which a `101`
/// response must not carry.
fn encode_upgrade(response: &http::Response) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason).into_bytes();
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn serve_static(domains: &[DomainConfig], host: &str, request: &http::Request) -> http::Response {
    let host = host.split(':').next().unwrap_or(host);
    let Some(domain) = domains.iter().find(|d| d.name == host) else {
        return http::Response::new(404, "Not Found").with_body(b"unknown domain".to_vec());
    };

    let relative = if request.path == "/" { "index.html" } else { request.path.trim_start_matches('/') };
    let Some(file_path) = safe_join(&domain.path, relative) else {
        return http::Response::new(400, "Bad Request").with_body(b"invalid path".to_vec());
    };

    let Ok(body) = std::fs::read(&file_path) else {
        return http::Response::new(404, "Not Found").with_body(b"not found".to_vec());
    };
    let content_type = mime_type_for(&file_path);

    match request.headers.get("range").and_then(|r| http::parse_range(r, body.len())) {
        Some((start, end)) => http::partial_content(&body, start, end, body.len()).with_header("Content-Type", content_type),
        None => http::Response::new(200, "OK").with_accept_ranges().with_header("Content-Type", content_type).with_body(body),
    }
}

/// A small, fixed extension table — the webserver serves a handful of
/// asset kinds, not an exhaustive registry.
fn mime_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Reject any relative path that escapes `root` via `..` segments.
fn safe_join(root: &str, relative: &str) -> Option<PathBuf> {
    let mut result = PathBuf::from(root);
    for segment in Path::new(relative).components() {
        use std::path::Component;
        match segment {
            Component::Normal(part) => result.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(result)
}

async fn dispatch_client_message(
    value: serde_json::Value,
    orchestrator: &OrchestratorHandle,
    push_tx: &mpsc::UnboundedSender<FrontendEvent>,
) -> Option<Envelope> {
    let envelope: Envelope = serde_json::from_value(value).ok()?;
    let event_name = envelope.event.clone();
    let uuid = envelope.uuid.unwrap_or_default();
    let parameter = envelope.parameter;

    let outcome = match event_name.as_str() {
        "ice_session_create" => {
            let params: SessionCreateParams = serde_json::from_value(parameter?).ok()?;
            let outcome = orchestrator.session_create(params.sdp).await;
            if let FrontendEvent::SessionCreated { error_code, session: Some(session), .. } = &outcome {
                if *error_code == error_codes::OK {
                    orchestrator.listen(session.session.clone(), push_tx.clone());
                }
            }
            outcome
        }
        "ice_session_update" => {
            let params: SessionRefParams = serde_json::from_value(parameter?).ok()?;
            orchestrator.session_update(params.session).await
        }
        "ice_session_drop" => {
            let params: SessionRefParams = serde_json::from_value(parameter?).ok()?;
            orchestrator.session_drop(params.session).await
        }
        "candidate" => {
            let params: CandidateParams = serde_json::from_value(parameter?).ok()?;
            orchestrator.candidate(params.session, params.candidate, params.ufrag, params.mid, params.mline_index).await
        }
        "talk" => {
            let params: TalkParams = serde_json::from_value(parameter?).ok()?;
            orchestrator.talk(params.session, params.on).await
        }
        _ => return Some(Envelope::error(event_name, uuid, error_codes::INVALID_INPUT, "unknown event")),
    };

    Some(frontend_event_to_envelope(&event_name, outcome))
}

fn frontend_event_to_envelope(request_event: &str, event: ov_vocs::FrontendEvent) -> Envelope {
    use ov_vocs::FrontendEvent;
    match event {
        FrontendEvent::SessionCreated { id, error_code, session, .. } if error_code == error_codes::OK => {
            Envelope::response(request_event, id, serde_json::to_value(session).unwrap())
        }
        FrontendEvent::SessionCreated { id, error_code, message, .. } => Envelope::error(request_event, id, error_code, message.unwrap_or_default()),
        FrontendEvent::SessionUpdated { id, error_code, message }
        | FrontendEvent::SessionDropped { id, error_code, message }
        | FrontendEvent::Candidate { id, error_code, message }
        | FrontendEvent::EndOfCandidates { id, error_code, message }
        | FrontendEvent::Talk { id, error_code, message } if error_code != error_codes::OK => {
            Envelope::error(request_event, id, error_code, message.unwrap_or_default())
        }
        FrontendEvent::SessionUpdated { id, .. }
        | FrontendEvent::SessionDropped { id, .. }
        | FrontendEvent::Candidate { id, .. }
        | FrontendEvent::EndOfCandidates { id, .. }
        | FrontendEvent::Talk { id, .. } => Envelope::response(request_event, id, serde_json::json!({})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_parent_traversal() {
        assert!(safe_join("/srv/www", "../../etc/passwd").is_none());
    }

    #[test]
    fn safe_join_accepts_nested_path() {
        let joined = safe_join("/srv/www", "assets/app.js").unwrap();
        assert_eq!(joined, PathBuf::from("/srv/www/assets/app.js"));
    }
}
