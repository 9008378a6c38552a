//! Narrow interface to the media stack.
//!
//! The hub and call sessions never touch WebRTC types directly: they hold
//! `Arc<dyn MediaPeer>` handles and `ForwardTrack` values, and SDP / ICE
//! payloads cross this boundary as opaque JSON.  Two backends exist -- the
//! production one over the `webrtc` crate, and a deterministic in-process
//! one the test suites drive.

pub mod rtc;
pub mod sim;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::call_session::CallSession;
use glimpse_protocol::Envelope;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("malformed session description: {0}")]
    BadDescription(String),
    #[error("malformed ice candidate: {0}")]
    BadCandidate(String),
    #[error("{0}")]
    Backend(String),
}

/// One sender's forwarded-track id paired with its negotiated MID.
///
/// Joining these against the session's published-track owners yields the
/// `mid-map` a subscriber needs to tell multiplexed streams apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidBinding {
    pub track_id: String,
    pub mid: String,
}

/// Everything a backend needs to wire a new peer connection: where ICE
/// candidates go, and which call session republished tracks land in.
pub struct PeerBinding {
    pub user_id: i64,
    pub call_id: i64,
    pub outbound: mpsc::Sender<Envelope>,
    pub session: Arc<CallSession>,
}

/// A server-side republished media track.
///
/// Identity is the server-unique opaque id -- the session's track maps and
/// the MID join both key on it, never on pointer identity.
#[derive(Clone)]
pub struct ForwardTrack {
    id: String,
    writer: TrackWriter,
}

#[derive(Clone)]
enum TrackWriter {
    Rtc(Arc<webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP>),
    Sim(Arc<sim::SimTrack>),
}

impl ForwardTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn from_rtc(
        track: Arc<webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP>,
    ) -> Self {
        use webrtc::track::track_local::TrackLocal;
        ForwardTrack {
            id: track.id().to_owned(),
            writer: TrackWriter::Rtc(track),
        }
    }

    /// A track backed by the sim stack; used by tests.
    pub fn sim(id: impl Into<String>) -> Self {
        let id = id.into();
        ForwardTrack {
            writer: TrackWriter::Sim(Arc::new(sim::SimTrack::new(id.clone()))),
            id,
        }
    }

    pub(crate) fn rtc_track(
        &self,
    ) -> Option<&Arc<webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP>> {
        match &self.writer {
            TrackWriter::Rtc(track) => Some(track),
            TrackWriter::Sim(_) => None,
        }
    }
}

impl std::fmt::Debug for ForwardTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardTrack").field("id", &self.id).finish()
    }
}

/// The per-connection surface the core drives.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Apply a remote SDP offer (direct JSON or quoted-base64 legacy form).
    async fn set_remote_offer(&self, offer: &Value) -> Result<(), MediaError>;

    /// Create an answer, set it locally, wait for ICE gathering, and return
    /// the final local description.
    async fn answer(&self) -> Result<Value, MediaError>;

    /// Create a renegotiation offer, set it locally, and return the local
    /// description once gathering completes or the 5-second cap elapses.
    async fn negotiate_offer(&self) -> Result<Value, MediaError>;

    /// Attach another publisher's forwarded track to this subscriber.
    async fn add_forward_track(&self, track: &ForwardTrack) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), MediaError>;

    /// For every sender with a negotiated MID: the forwarded-track id it
    /// carries.  Empty until the first negotiation settles.
    async fn sender_mids(&self) -> Vec<MidBinding>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaStack: Send + Sync {
    /// Build a peer connection wired to the given client and session: ICE
    /// candidates flow to the client's outbound queue, remote tracks are
    /// republished into the session and their RTP pumped until EOF.
    async fn create_peer(&self, binding: PeerBinding) -> Result<Arc<dyn MediaPeer>, MediaError>;
}
