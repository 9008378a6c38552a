//! Deterministic in-process media backend.
//!
//! Stands in for the WebRTC stack in the test suites: tracks are recorded
//! instead of transmitted, negotiation fabricates SDP-shaped JSON, and MIDs
//! are assigned in track-add order at the first negotiation after the add,
//! mirroring how real MIDs appear once SDP settles.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{ForwardTrack, MediaError, MediaPeer, MediaStack, MidBinding, PeerBinding};

#[derive(Debug)]
pub struct SimTrack {
    id: String,
}

impl SimTrack {
    pub(crate) fn new(id: String) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
pub struct SimMediaStack {
    peers: Mutex<Vec<Arc<SimPeer>>>,
}

impl SimMediaStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most recently created peer for a user, if any.
    pub fn peer_for(&self, user_id: i64) -> Option<Arc<SimPeer>> {
        self.peers
            .lock()
            .expect("sim stack lock")
            .iter()
            .rev()
            .find(|p| p.user_id == user_id)
            .cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("sim stack lock").len()
    }
}

#[async_trait]
impl MediaStack for SimMediaStack {
    async fn create_peer(&self, binding: PeerBinding) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let peer = Arc::new(SimPeer {
            user_id: binding.user_id,
            call_id: binding.call_id,
            closed: AtomicBool::new(false),
            offers: AtomicU64::new(0),
            answers: AtomicU64::new(0),
            state: Mutex::new(SimPeerState::default()),
        });
        self.peers.lock().expect("sim stack lock").push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct SimPeerState {
    /// (track id, assigned MID once negotiated)
    tracks: Vec<(String, Option<String>)>,
    candidates: Vec<Value>,
    remote_offers: Vec<Value>,
}

pub struct SimPeer {
    pub user_id: i64,
    pub call_id: i64,
    closed: AtomicBool,
    offers: AtomicU64,
    answers: AtomicU64,
    state: Mutex<SimPeerState>,
}

impl SimPeer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn offer_count(&self) -> u64 {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answer_count(&self) -> u64 {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn added_track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sim peer lock")
            .tracks
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().expect("sim peer lock").candidates.len()
    }

    fn assign_mids(&self) {
        let mut state = self.state.lock().expect("sim peer lock");
        for (index, (_, mid)) in state.tracks.iter_mut().enumerate() {
            if mid.is_none() {
                *mid = Some(index.to_string());
            }
        }
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Backend("peer connection is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaPeer for SimPeer {
    async fn set_remote_offer(&self, offer: &Value) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.state
            .lock()
            .expect("sim peer lock")
            .remote_offers
            .push(offer.clone());
        Ok(())
    }

    async fn answer(&self) -> Result<Value, MediaError> {
        self.ensure_open()?;
        self.assign_mids();
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "type": "answer",
            "sdp": format!("sim-answer-{}-{}", self.user_id, n),
        }))
    }

    async fn negotiate_offer(&self) -> Result<Value, MediaError> {
        self.ensure_open()?;
        self.assign_mids();
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "type": "offer",
            "sdp": format!("sim-offer-{}-{}", self.user_id, n),
        }))
    }

    async fn add_forward_track(&self, track: &ForwardTrack) -> Result<(), MediaError> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("sim peer lock");
        state.tracks.push((track.id().to_owned(), None));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.state
            .lock()
            .expect("sim peer lock")
            .candidates
            .push(candidate.clone());
        Ok(())
    }

    async fn sender_mids(&self) -> Vec<MidBinding> {
        self.state
            .lock()
            .expect("sim peer lock")
            .tracks
            .iter()
            .filter_map(|(track_id, mid)| {
                mid.as_ref().map(|mid| MidBinding {
                    track_id: track_id.clone(),
                    mid: mid.clone(),
                })
            })
            .collect()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
