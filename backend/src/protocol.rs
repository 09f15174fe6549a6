//! Protocol message types for the signaling service.
//!
//! Every frame is a JSON object `{"type": ..., "payload": {...}}` carried in a
//! WebSocket text message. Field names follow the browser client's camelCase
//! convention (`sessionId`, `offerSDP`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Publish an offer and claim a session id.
    Offer,
    /// Fetch the offer stored for a session id.
    GetOffer,
    /// Publish an answer for a claimed session; issues a PIN.
    Answer,
    /// Fetch the answer, gated by the PIN.
    GetAnswer,
}

impl MessageKind {
    /// Parse the `type` field of an inbound envelope.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(Self::Offer),
            "get_offer" => Some(Self::GetOffer),
            "answer" => Some(Self::Answer),
            "get_answer" => Some(Self::GetAnswer),
            _ => None,
        }
    }
}

/// Envelope of every message sent from the client to the server.
///
/// The type is kept as a raw string so unrecognized types can be reported
/// back to the sender instead of failing the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// An offer as submitted by the initiating peer and stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "offerSDP")]
    pub offer_sdp: String,
    #[serde(rename = "publicKey", alias = "pubKey")]
    pub public_key: String,
    #[serde(default)]
    pub timestamp: String,
}

/// An answer as submitted by the joining peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "answerSDP")]
    pub answer_sdp: String,
    #[serde(rename = "publicKey", alias = "pubKey")]
    pub public_key: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Payload of `get_offer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Payload of `get_answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAnswerRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub pin: String,
}

/// Acknowledgment returned for `offer` and `answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
    /// Only set when acknowledging an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            message: "Ok".to_string(),
            pin: None,
        }
    }

    pub fn with_pin(pin: String) -> Self {
        Self {
            message: "Ok".to_string(),
            pin: Some(pin),
        }
    }
}

/// Response to `get_offer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDetails {
    #[serde(rename = "offerSDP")]
    pub offer_sdp: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl From<OfferRecord> for OfferDetails {
    fn from(record: OfferRecord) -> Self {
        Self {
            offer_sdp: record.offer_sdp,
            public_key: record.public_key,
        }
    }
}

/// What the store slot of a session currently holds.
///
/// Offer and answer share one slot; the `phase` tag tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionRecord {
    Offered(OfferRecord),
    Answered(AnswerRecord),
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful response to a client request.
    Ok(Value),
    /// Failed request; the connection stays open.
    Error(ErrorPayload),
    /// Pushed to the initiator once the joining peer has answered.
    ConfirmConnection(EmptyPayload),
}

impl ServerMessage {
    pub fn error(err: &SignalError) -> Self {
        Self::Error(ErrorPayload {
            message: err.to_string(),
        })
    }

    pub fn confirm_connection() -> Self {
        Self::ConfirmConnection(EmptyPayload::default())
    }
}

/// Protocol-level failures reported back to the sender.
///
/// The `Display` text is exactly what the client sees; causes from the store
/// or the PIN manager are logged, never forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("already has an active session")]
    AlreadyActive,
    #[error("cannot save the offer")]
    SaveOffer,
    #[error("session not found")]
    SessionNotFound,
    #[error("peer connection not found")]
    PeerNotFound,
    #[error("cannot generate PIN")]
    PinGeneration,
    #[error("cannot save the PIN")]
    SavePin,
    #[error("cannot save the answer")]
    SaveAnswer,
    #[error("invalid PIN")]
    InvalidPin,
    #[error("answer not found")]
    AnswerNotFound,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("a server error occurred")]
    Internal,
}
