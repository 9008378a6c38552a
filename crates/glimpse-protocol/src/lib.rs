// glimpse-protocol: signaling envelope and payload types.
//
// Every WebSocket frame is one `Envelope` -- a `type` tag, a JSON payload,
// and a server-side timestamp.  The payload stays raw on the envelope so
// that message kinds the hub does not understand can be re-broadcast
// byte-identically; `Envelope::decode` resolves the known kinds into the
// `SignalMessage` variant the hub dispatches on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Authoritative in-memory presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Busy,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::Busy => "busy",
        }
    }
}

/// One user's presence record as carried by `user_online`, `user_offline`,
/// `user_busy`, and `users_list` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatusSnapshot {
    pub user_id: i64,
    pub username: String,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }
}

/// Wire form of a call.
///
/// `offer` and `answer` are transient SDP JSON carried only during
/// signaling; the persisted call row never stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: i64,
    pub caller_id: i64,
    pub callee_ids: Vec<i64>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
}

// ---------------------------------------------------------------------------
// Per-kind payloads
// ---------------------------------------------------------------------------

/// Payload of `call_rejected`, `user_leave`, `add_callee`, and the inbound
/// form of `incoming_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: i64,
    pub user_id: i64,
}

/// Payload of `call_offer` and `call_accepted`.  The offer is opaque SDP
/// JSON; a quoted base64 string is also accepted further down the stack for
/// one legacy client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub call_id: i64,
    pub user_id: i64,
    pub offer: Value,
}

/// Payload of `ice-candidate` in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub call_id: i64,
    pub user_id: i64,
    pub candidate: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Payload of `track_update` (mute state changes, fanned out verbatim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackUpdatePayload {
    pub call_id: i64,
    pub user_id: i64,
    pub track_type: TrackKind,
    pub muted: bool,
}

/// Payload of `reconnect`.  `pc_alive` tells the server whether the
/// client's peer connection survived the socket loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPayload {
    pub call_id: i64,
    pub user_id: i64,
    pub pc_alive: bool,
}

/// Server-to-client map from negotiated MID to the publishing user id.
pub type MidMap = BTreeMap<String, i64>;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Message type tags.  Inputs the hub recognizes plus the output-only tags
/// it produces; anything else passes through as broadcast.
pub mod kinds {
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
    pub const USER_BUSY: &str = "user_busy";
    pub const USERS_LIST: &str = "users_list";
    pub const INCOMING_CALL: &str = "incoming_call";
    pub const CALL_OFFER: &str = "call_offer";
    pub const CALL_ACCEPTED: &str = "call_accepted";
    pub const CALL_REJECTED: &str = "call_rejected";
    pub const USER_LEAVE: &str = "user_leave";
    pub const ADD_CALLEE: &str = "add_callee";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const TRACK_UPDATE: &str = "track_update";
    pub const RECONNECT: &str = "reconnect";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const MID_MAP: &str = "mid-map";
}

/// The wire envelope: `{ "type": ..., "payload": ..., "time": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub time: DateTime<Utc>,
}

/// A decoded inbound envelope.  One variant per kind the hub understands;
/// payload decoding is total per arm.  `Other` covers client-defined kinds
/// the hub re-broadcasts without interpreting.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    UserOnline,
    IncomingCall(CallRef),
    CallOffer(OfferPayload),
    CallAccepted(OfferPayload),
    CallRejected(CallRef),
    UserLeave(CallRef),
    AddCallee(CallRef),
    IceCandidate(IceCandidatePayload),
    TrackUpdate(TrackUpdatePayload),
    Reconnect(ReconnectPayload),
    Other,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Envelope {
            kind: kind.into(),
            payload,
            time: Utc::now(),
        }
    }

    /// Resolve the payload for the envelope's kind.
    ///
    /// An error means the tag is known but the payload shape is not -- the
    /// hub logs and drops such envelopes without disturbing other state.
    pub fn decode(&self) -> Result<SignalMessage, serde_json::Error> {
        let msg = match self.kind.as_str() {
            kinds::USER_ONLINE => SignalMessage::UserOnline,
            kinds::INCOMING_CALL => {
                SignalMessage::IncomingCall(serde_json::from_value(self.payload.clone())?)
            }
            kinds::CALL_OFFER => {
                SignalMessage::CallOffer(serde_json::from_value(self.payload.clone())?)
            }
            kinds::CALL_ACCEPTED => {
                SignalMessage::CallAccepted(serde_json::from_value(self.payload.clone())?)
            }
            kinds::CALL_REJECTED => {
                SignalMessage::CallRejected(serde_json::from_value(self.payload.clone())?)
            }
            kinds::USER_LEAVE => {
                SignalMessage::UserLeave(serde_json::from_value(self.payload.clone())?)
            }
            kinds::ADD_CALLEE => {
                SignalMessage::AddCallee(serde_json::from_value(self.payload.clone())?)
            }
            kinds::ICE_CANDIDATE => {
                SignalMessage::IceCandidate(serde_json::from_value(self.payload.clone())?)
            }
            kinds::TRACK_UPDATE => {
                SignalMessage::TrackUpdate(serde_json::from_value(self.payload.clone())?)
            }
            kinds::RECONNECT => {
                SignalMessage::Reconnect(serde_json::from_value(self.payload.clone())?)
            }
            _ => SignalMessage::Other,
        };
        Ok(msg)
    }

    /// Presence envelope for one user; the tag follows the status.
    pub fn user_status(snapshot: &UserStatusSnapshot) -> Self {
        let kind = match snapshot.status {
            UserStatus::Online => kinds::USER_ONLINE,
            UserStatus::Offline => kinds::USER_OFFLINE,
            UserStatus::Busy => kinds::USER_BUSY,
        };
        Envelope::new(kind, to_value(snapshot))
    }

    pub fn users_list(users: &[UserStatusSnapshot]) -> Self {
        Envelope::new(kinds::USERS_LIST, to_value(users))
    }

    pub fn incoming_call(call: &CallRecord) -> Self {
        Envelope::new(kinds::INCOMING_CALL, to_value(call))
    }

    /// Renegotiation offer pushed by the server to one participant.
    pub fn offer(description: &Value) -> Self {
        Envelope::new(kinds::OFFER, description.clone())
    }

    /// Negotiated answer pushed by the server to one participant.
    pub fn answer(description: &Value) -> Self {
        Envelope::new(kinds::ANSWER, description.clone())
    }

    pub fn ice_candidate(payload: &IceCandidatePayload) -> Self {
        Envelope::new(kinds::ICE_CANDIDATE, to_value(payload))
    }

    pub fn mid_map(map: &MidMap) -> Self {
        Envelope::new(kinds::MID_MAP, to_value(map))
    }

    /// Synthetic leave emitted when a disconnected user's grace period
    /// expires.
    pub fn user_leave(call_id: i64, user_id: i64) -> Self {
        Envelope::new(kinds::USER_LEAVE, to_value(&CallRef { call_id, user_id }))
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Value {
    // Serialization of plain data types cannot realistically fail; fall back
    // to null rather than propagate.
    serde_json::to_value(value).unwrap_or(Value::Null)
}
