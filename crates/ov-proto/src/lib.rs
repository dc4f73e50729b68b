//! Wire types shared by the signaling layer, the webserver, and the VM's
//! ICE frontend.
//!
//! The signaling wire format is a JSON object carrying a
//! top-level `event` string. Requests add `uuid` (correlation id) and
//! `parameter`; responses add `uuid` and `response`; errors add `code` and
//! `message`. `Envelope` models all four shapes with a single struct so a
//! handler can freely move a message between "parsed" and "about to be
//! sent" without re-deriving the field set each time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single signaling message, in either direction.
///
/// `parameter` is used for requests, `response` for replies; both are
/// `None` for a bare notification. `code`/`message` are set on error
/// responses (`code != 0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    pub fn request(event: impl Into<String>, uuid: impl Into<String>, parameter: Value) -> Self {
        Envelope {
            event: event.into(),
            uuid: Some(uuid.into()),
            parameter: Some(parameter),
            response: None,
            code: None,
            message: None,
        }
    }

    pub fn notify(event: impl Into<String>, parameter: Value) -> Self {
        Envelope {
            event: event.into(),
            uuid: None,
            parameter: Some(parameter),
            response: None,
            code: None,
            message: None,
        }
    }

    pub fn response(event: impl Into<String>, uuid: impl Into<String>, response: Value) -> Self {
        Envelope {
            event: event.into(),
            uuid: Some(uuid.into()),
            parameter: None,
            response: Some(response),
            code: Some(0),
            message: None,
        }
    }

    pub fn error(
        event: impl Into<String>,
        uuid: impl Into<String>,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Envelope {
            event: event.into(),
            uuid: Some(uuid.into()),
            parameter: None,
            response: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }

    /// `true` for a response/error (carries `response` or a non-zero `code`).
    pub fn is_response(&self) -> bool {
        self.response.is_some() || self.code.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.code.is_some_and(|c| c != 0)
    }
}

/// Frozen error codes used in `response.code` / `Envelope::code`.
pub mod error_codes {
    pub const OK: i64 = 0;
    pub const INVALID_INPUT: i64 = 1;
    pub const NOT_FOUND: i64 = 2;
    pub const ALREADY_EXISTS: i64 = 3;
    pub const CAPACITY_EXHAUSTED: i64 = 4;
    pub const PROTOCOL_MISMATCH: i64 = 5;
    pub const COMMS_ERROR: i64 = 6;
    pub const PROCESSING_ERROR: i64 = 7;
    pub const NOT_A_RESPONSE: i64 = 8;
    pub const TIMEOUT: i64 = 9;
    pub const INTERNAL: i64 = 10;
}

// ---------------------------------------------------------------------------
// Orchestration events used by the VM-driven frontend
// ---------------------------------------------------------------------------

/// `register` parameter: an ICE proxy announcing itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterParams {
    pub uuid: String,
}

/// `ice_session_create` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCreateParams {
    pub sdp: String,
}

/// One forwarding target in a `session.created` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardTarget {
    pub ssrc: u32,
    pub socket: SocketEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub transport: String,
}

/// `ice_session_create` response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCreateResponse {
    pub session: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
    pub proxy: Vec<ForwardTarget>,
}

/// `ice_session_update` / `ice_session_drop` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRefParams {
    pub session: String,
}

/// `ice_session_state` response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStateResponse {
    pub session: String,
    pub state: String,
}

/// `candidate` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateParams {
    pub session: String,
    pub candidate: String,
    pub ufrag: String,
    pub mid: u32,
    pub mline_index: u32,
}

/// `end_of_candidates` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndOfCandidatesParams {
    pub session: String,
}

/// `talk` parameter (talk on/off for a session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TalkParams {
    pub session: String,
    pub on: bool,
}

// ---------------------------------------------------------------------------
// VM instruction record
// ---------------------------------------------------------------------------

/// Reserved opcodes. Any instruction stream must end with `END`.
pub const OPCODE_END: u8 = 0x00;
pub const OPCODE_NOP: u8 = 0xFD;
pub const OPCODE_INVALID: u8 = 0xFE;

/// A fixed-width VM instruction: one opcode byte plus three argument bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: u8,
    pub args: [u8; 3],
}

impl Instruction {
    pub const fn new(opcode: u8, args: [u8; 3]) -> Self {
        Instruction { opcode, args }
    }

    /// The mandatory end-of-stream sentinel.
    pub const fn end() -> Self {
        Instruction::new(OPCODE_END, [0, 0, 0])
    }

    pub const fn nop() -> Self {
        Instruction::new(OPCODE_NOP, [0, 0, 0])
    }

    pub fn is_end(&self) -> bool {
        self.opcode == OPCODE_END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::request("talk", "u-1", serde_json::json!({"session": "s-1"}));
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env, back);
        assert!(!back.is_response());
    }

    #[test]
    fn error_envelope_is_reported_as_error() {
        let env = Envelope::error("candidate", "c-1", error_codes::NOT_A_RESPONSE, "oops");
        assert!(env.is_response());
        assert!(env.is_error());
    }

    #[test]
    fn instruction_end_is_recognized() {
        assert!(Instruction::end().is_end());
        assert!(!Instruction::nop().is_end());
    }
}
