//! Drives `ice_proxy_stub::run` against a bare `App` server standing in for
//! the webserver's control-plane socket.

use ov_app::{App, AppEvent, OutboundData, ParserKind, SocketConfig};
use ov_proto::{Envelope, RegisterParams, SessionCreateResponse};
use ov_test_support::reserve_addr;

#[tokio::test]
async fn proxy_registers_and_answers_session_create() {
    let addr = reserve_addr().await;
    let mut server = App::new();
    server.open_server(addr, SocketConfig::new(ParserKind::Json { objects_only: true })).await.unwrap();

    tokio::spawn(ice_proxy_stub::run(ice_proxy_stub::ProxyConfig {
        server_addr: addr,
        uuid: "stub-1".to_string(),
        ssrc: 777,
        forward_host: "10.0.0.5".to_string(),
        forward_port: 12345,
        forward_transport: "udp".to_string(),
        sdp_answer: "v=0 answer".to_string(),
    }));

    let accepted = server.next_event().await.unwrap();
    let socket = match accepted {
        AppEvent::Accepted { socket, .. } => socket,
        other => panic!("expected Accepted, got {other:?}"),
    };

    let register: Envelope = loop {
        match server.next_event().await.unwrap() {
            AppEvent::Success { values, .. } => {
                let envelope: Envelope = serde_json::from_value(values[0].clone()).unwrap();
                break envelope;
            }
            _ => continue,
        }
    };
    assert_eq!(register.event, "register");
    let params: RegisterParams = serde_json::from_value(register.parameter.unwrap()).unwrap();
    assert_eq!(params.uuid, "stub-1");

    let request = Envelope::request("ice_session_create", "req-1", serde_json::json!({"sdp": "v=0 offer"}));
    server.send(socket, OutboundData::Json(serde_json::to_value(&request).unwrap())).await.unwrap();

    let reply: Envelope = loop {
        match server.next_event().await.unwrap() {
            AppEvent::Success { values, .. } => {
                let envelope: Envelope = serde_json::from_value(values[0].clone()).unwrap();
                break envelope;
            }
            _ => continue,
        }
    };
    assert_eq!(reply.uuid.as_deref(), Some("req-1"));
    let response: SessionCreateResponse = serde_json::from_value(reply.response.unwrap()).unwrap();
    assert_eq!(response.sdp, "v=0 answer");
    assert_eq!(response.proxy[0].ssrc, 777);
    assert_eq!(response.proxy[0].socket.port, 12345);
}
