//! ICE frontend: a signaling client that composes orchestration messages
//! and correlates replies by request id.
//!
//! This is a pure composer/correlator — it builds [`Envelope`]s to send and
//! turns inbound envelopes into typed [`FrontendEvent`]s, but does not
//! itself own a socket or the frontend registry. The owning service (the
//! webserver binary) is what wires `IceFrontend::handle_inbound`'s output
//! into `FrontendRegistry::unregister_proxy` for the rule that a malformed
//! `session_create` response drops the proxy.

use std::collections::HashMap;

use ov_proto::{
    error_codes, CandidateParams, EndOfCandidatesParams, Envelope, SessionCreateParams,
    SessionCreateResponse, SessionRefParams, TalkParams,
};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    SessionCreate,
    SessionUpdate,
    SessionDrop,
    Candidate,
    Talk,
}

/// A typed, already-classified response or notification.
#[derive(Debug, Clone)]
pub enum FrontendEvent {
    SessionCreated {
        id: String,
        error_code: i64,
        message: Option<String>,
        session: Option<SessionCreateResponse>,
    },
    SessionUpdated { id: String, error_code: i64, message: Option<String> },
    SessionDropped { id: String, error_code: i64, message: Option<String> },
    Candidate { id: String, error_code: i64, message: Option<String> },
    /// Read-only notification (Open Question (b): bare end-of-candidates
    /// never mutates session state).
    EndOfCandidates { id: String, error_code: i64, message: Option<String> },
    Talk { id: String, error_code: i64, message: Option<String> },
}

impl FrontendEvent {
    /// `true` when this event means the originating proxy connection must
    /// be dropped (a malformed `session_create` reply).
    pub fn requires_dropping_proxy(&self) -> bool {
        matches!(
            self,
            FrontendEvent::SessionCreated { error_code, session: None, .. }
                if *error_code == error_codes::PROTOCOL_MISMATCH
        )
    }
}

/// Tracks in-flight requests by correlation uuid and builds outbound
/// envelopes.
#[derive(Default)]
pub struct IceFrontend {
    pending: HashMap<String, RequestKind>,
}

impl IceFrontend {
    pub fn new() -> Self {
        IceFrontend::default()
    }

    pub fn compose_session_create(&mut self, uuid: impl Into<String>, sdp: impl Into<String>) -> Envelope {
        let uuid = uuid.into();
        self.pending.insert(uuid.clone(), RequestKind::SessionCreate);
        Envelope::request(
            "ice_session_create",
            uuid,
            serde_json::to_value(SessionCreateParams { sdp: sdp.into() }).unwrap(),
        )
    }

    pub fn compose_session_update(&mut self, uuid: impl Into<String>, session: impl Into<String>) -> Envelope {
        let uuid = uuid.into();
        self.pending.insert(uuid.clone(), RequestKind::SessionUpdate);
        Envelope::request(
            "ice_session_update",
            uuid,
            serde_json::to_value(SessionRefParams { session: session.into() }).unwrap(),
        )
    }

    pub fn compose_session_drop(&mut self, uuid: impl Into<String>, session: impl Into<String>) -> Envelope {
        let uuid = uuid.into();
        self.pending.insert(uuid.clone(), RequestKind::SessionDrop);
        Envelope::request(
            "ice_session_drop",
            uuid,
            serde_json::to_value(SessionRefParams { session: session.into() }).unwrap(),
        )
    }

    pub fn compose_candidate(
        &mut self,
        uuid: impl Into<String>,
        session: impl Into<String>,
        candidate: impl Into<String>,
        ufrag: impl Into<String>,
        mid: u32,
        mline_index: u32,
    ) -> Envelope {
        let uuid = uuid.into();
        self.pending.insert(uuid.clone(), RequestKind::Candidate);
        Envelope::request(
            "candidate",
            uuid,
            serde_json::to_value(CandidateParams {
                session: session.into(),
                candidate: candidate.into(),
                ufrag: ufrag.into(),
                mid,
                mline_index,
            })
            .unwrap(),
        )
    }

    pub fn compose_end_of_candidates(&mut self, session: impl Into<String>) -> Envelope {
        Envelope::notify(
            "end_of_candidates",
            serde_json::to_value(EndOfCandidatesParams { session: session.into() }).unwrap(),
        )
    }

    pub fn compose_talk(&mut self, uuid: impl Into<String>, session: impl Into<String>, on: bool) -> Envelope {
        let uuid = uuid.into();
        self.pending.insert(uuid.clone(), RequestKind::Talk);
        Envelope::request("talk", uuid, serde_json::to_value(TalkParams { session: session.into(), on }).unwrap())
    }

    /// Classify an inbound envelope as either a reply to one of our
    /// outstanding requests, or a bare notification. Returns `None` for
    /// envelopes this frontend has no interest in.
    pub fn handle_inbound(&mut self, envelope: &Envelope) -> Option<FrontendEvent> {
        if envelope.is_response() {
            return self.handle_response(envelope);
        }
        self.handle_notification(envelope)
    }

    fn handle_response(&mut self, envelope: &Envelope) -> Option<FrontendEvent> {
        let uuid = envelope.uuid.clone()?;
        let kind = self.pending.remove(&uuid)?;
        let code = envelope.code.unwrap_or(error_codes::OK);
        let message = envelope.message.clone();

        if kind == RequestKind::SessionCreate {
            if code != error_codes::OK {
                return Some(FrontendEvent::SessionCreated { id: uuid, error_code: code, message, session: None });
            }
            return Some(match decode_response::<SessionCreateResponse>(envelope.response.as_ref()) {
                Some(session) => FrontendEvent::SessionCreated { id: uuid, error_code: error_codes::OK, message: None, session: Some(session) },
                None => FrontendEvent::SessionCreated {
                    id: uuid,
                    error_code: error_codes::PROTOCOL_MISMATCH,
                    message: Some("malformed session_create response".to_string()),
                    session: None,
                },
            });
        }

        Some(match kind {
            RequestKind::SessionUpdate => FrontendEvent::SessionUpdated { id: uuid, error_code: code, message },
            RequestKind::SessionDrop => FrontendEvent::SessionDropped { id: uuid, error_code: code, message },
            RequestKind::Candidate => FrontendEvent::Candidate { id: uuid, error_code: code, message },
            RequestKind::Talk => FrontendEvent::Talk { id: uuid, error_code: code, message },
            RequestKind::SessionCreate => unreachable!("handled above"),
        })
    }

    fn handle_notification(&mut self, envelope: &Envelope) -> Option<FrontendEvent> {
        let id = envelope.uuid.clone().unwrap_or_default();
        match envelope.event.as_str() {
            "candidate" => Some(FrontendEvent::Candidate { id, error_code: error_codes::NOT_A_RESPONSE, message: None }),
            "end_of_candidates" => {
                Some(FrontendEvent::EndOfCandidates { id, error_code: error_codes::NOT_A_RESPONSE, message: None })
            }
            _ => None,
        }
    }
}

fn decode_response<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Option<T> {
    serde_json::from_value(value?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_create_success_decodes_forwarding_targets() {
        let mut frontend = IceFrontend::new();
        let request = frontend.compose_session_create("u-1", "sdp");
        assert_eq!(request.uuid.as_deref(), Some("u-1"));

        let response = Envelope::response(
            "ice_session_create",
            "u-1",
            serde_json::json!({
                "session": "s-1",
                "type": "offer",
                "sdp": "sdp",
                "proxy": [{"ssrc": 12345, "socket": {"host": "127.0.0.1", "port": 12345, "type": "udp"}}]
            }),
        );

        match frontend.handle_inbound(&response).unwrap() {
            FrontendEvent::SessionCreated { id, error_code, session, .. } => {
                assert_eq!(id, "u-1");
                assert_eq!(error_code, error_codes::OK);
                let session = session.unwrap();
                assert_eq!(session.session, "s-1");
                assert_eq!(session.proxy[0].ssrc, 12345);
                assert_eq!(session.proxy[0].socket.port, 12345);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn session_create_missing_proxy_field_is_protocol_mismatch() {
        let mut frontend = IceFrontend::new();
        frontend.compose_session_create("u-1", "sdp");
        let response = Envelope::response(
            "ice_session_create",
            "u-1",
            serde_json::json!({"session": "s-1", "type": "offer", "sdp": "sdp"}),
        );
        let event = frontend.handle_inbound(&response).unwrap();
        assert!(event.requires_dropping_proxy());
    }

    #[test]
    fn bare_candidate_notification_is_reported_as_not_a_response() {
        let mut frontend = IceFrontend::new();
        let bare = Envelope::notify(
            "candidate",
            serde_json::json!({"session": "s-1", "candidate": "c", "ufrag": "u", "mid": 0, "mline_index": 0}),
        );
        match frontend.handle_inbound(&bare).unwrap() {
            FrontendEvent::Candidate { error_code, .. } => assert_eq!(error_code, error_codes::NOT_A_RESPONSE),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn well_formed_error_response_is_propagated_without_being_flagged_malformed() {
        let mut frontend = IceFrontend::new();
        frontend.compose_candidate("c-1", "s-1", "candidate", "ufrag", 0, 0);
        let response = Envelope::error("candidate", "c-1", error_codes::INVALID_INPUT, "bad mid");
        match frontend.handle_inbound(&response).unwrap() {
            FrontendEvent::Candidate { id, error_code, message } => {
                assert_eq!(id, "c-1");
                assert_eq!(error_code, error_codes::INVALID_INPUT);
                assert_eq!(message.as_deref(), Some("bad mid"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
