//! Per-call participant set, published tracks, and MID bookkeeping.
//!
//! A session exists only while its call is ringing or ongoing.  The hub
//! serializes the interesting write paths, but media callbacks land on
//! arbitrary tasks, so every map lives behind the session's own lock.
//! Participant snapshots are taken under the lock and released before any
//! media-stack call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::Client;
use crate::media::{ForwardTrack, MediaError, MediaPeer};
use glimpse_protocol::{CallRecord, Envelope, MidMap};

/// How long to let SDP settle after a renegotiation offer before reading
/// sender MIDs.
const MID_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// MIDs can be assigned slightly after the local description is set; retry
/// once after this pause when the first pass finds nothing.
const MID_RETRY_DELAY: Duration = Duration::from_millis(80);

pub struct CallSession {
    pub id: i64,
    call: RwLock<CallRecord>,
    state: RwLock<SessionState>,
}

#[derive(Default)]
struct SessionState {
    participants: HashMap<i64, Arc<Client>>,
    published_tracks: HashMap<String, ForwardTrack>,
    published_owners: HashMap<String, i64>,
    /// mid -> publisher user id, merged in as subscribers negotiate.
    track_publishers: HashMap<String, i64>,
}

impl CallSession {
    pub fn new(call: CallRecord) -> Arc<Self> {
        Arc::new(Self {
            id: call.id,
            call: RwLock::new(call),
            state: RwLock::new(SessionState::default()),
        })
    }

    pub async fn call(&self) -> CallRecord {
        self.call.read().await.clone()
    }

    pub async fn update_call(&self, update: impl FnOnce(&mut CallRecord)) -> CallRecord {
        let mut call = self.call.write().await;
        update(&mut call);
        call.clone()
    }

    /// Idempotent: a second insert for the same user id replaces the handle.
    pub async fn add_participant(&self, client: Arc<Client>) {
        self.state
            .write()
            .await
            .participants
            .insert(client.user_id, client);
    }

    pub async fn participant(&self, user_id: i64) -> Option<Arc<Client>> {
        self.state.read().await.participants.get(&user_id).cloned()
    }

    pub async fn participants(&self) -> Vec<Arc<Client>> {
        self.state.read().await.participants.values().cloned().collect()
    }

    pub async fn participant_count(&self) -> usize {
        self.state.read().await.participants.len()
    }

    /// Remove one participant: their peer connection is closed, their
    /// published tracks are dropped, and `notice` (if any) is enqueued to
    /// everyone still in the call.
    pub async fn remove_participant(&self, user_id: i64, notice: Option<&Envelope>) {
        let (removed, remaining) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let removed = state.participants.remove(&user_id);
            if removed.is_some() {
                let tracks = &mut state.published_tracks;
                state.published_owners.retain(|track_id, owner| {
                    if *owner == user_id {
                        tracks.remove(track_id);
                        false
                    } else {
                        true
                    }
                });
                state.track_publishers.retain(|_, owner| *owner != user_id);
            }
            let remaining: Vec<Arc<Client>> = state.participants.values().cloned().collect();
            (removed, remaining)
        };

        let Some(removed) = removed else { return };
        if let Some(peer) = removed.peer().await {
            peer.close().await;
        }
        if let Some(notice) = notice {
            for participant in &remaining {
                if !participant.try_send(notice.clone()) {
                    debug!(user_id = participant.user_id, "dropped leave notice, queue full");
                }
            }
        }
    }

    /// Close every participant's peer connection and empty the session.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.state.write().await;
            state.published_tracks.clear();
            state.published_owners.clear();
            state.track_publishers.clear();
            state.participants.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        for participant in drained {
            if let Some(peer) = participant.peer().await {
                peer.close().await;
            }
        }
    }

    /// Record a publisher's forwarded track and attach it to every other
    /// live participant.  With `renegotiate`, each participant that received
    /// the track gets an async offer followed by a MID re-map.
    pub async fn publish_track(
        self: &Arc<Self>,
        publisher_id: i64,
        track: ForwardTrack,
        renegotiate: bool,
    ) {
        let snapshot = {
            let mut state = self.state.write().await;
            state
                .published_tracks
                .insert(track.id().to_owned(), track.clone());
            state
                .published_owners
                .insert(track.id().to_owned(), publisher_id);
            state.participants.values().cloned().collect::<Vec<_>>()
        };

        let mut received = Vec::new();
        for participant in snapshot {
            if participant.user_id == publisher_id {
                continue;
            }
            let Some(peer) = participant.peer().await else {
                continue;
            };
            match peer.add_forward_track(&track).await {
                Ok(()) => received.push(participant),
                Err(e) => {
                    // One subscriber failing must not disturb the rest.
                    warn!(
                        call_id = self.id,
                        subscriber = participant.user_id,
                        error = %e,
                        "add track failed, skipping participant"
                    );
                }
            }
        }

        if !renegotiate {
            return;
        }
        for participant in received {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = session.renegotiate_participant(&participant).await {
                    warn!(
                        call_id = session.id,
                        user_id = participant.user_id,
                        error = %e,
                        "renegotiation failed"
                    );
                    return;
                }
                tokio::time::sleep(MID_SETTLE_DELAY).await;
                session.map_mids_for_participant(&participant).await;
            });
        }
    }

    /// Attach every published track not owned by `exclude_owner` to the
    /// given peer.  Used when a subscriber joins an ongoing call or finishes
    /// its first negotiation.
    pub async fn add_published_tracks_to_peer(
        &self,
        peer: &Arc<dyn MediaPeer>,
        exclude_owner: i64,
    ) -> Result<(), MediaError> {
        let tracks: Vec<ForwardTrack> = {
            let state = self.state.read().await;
            state
                .published_tracks
                .iter()
                .filter(|(track_id, _)| {
                    state.published_owners.get(*track_id) != Some(&exclude_owner)
                })
                .map(|(_, track)| track.clone())
                .collect()
        };
        for track in tracks {
            peer.add_forward_track(&track).await?;
        }
        Ok(())
    }

    /// Push a fresh offer (ICE-gathered, capped) to one participant's queue.
    pub async fn renegotiate_participant(&self, participant: &Arc<Client>) -> Result<(), MediaError> {
        let Some(peer) = participant.peer().await else {
            return Ok(());
        };
        let description = peer.negotiate_offer().await?;
        if !participant.try_send(Envelope::offer(&description)) {
            warn!(
                call_id = self.id,
                user_id = participant.user_id,
                "outbound queue full, dropping renegotiation offer"
            );
        }
        Ok(())
    }

    /// Join the participant's sender MIDs against published-track ownership
    /// and push the consolidated `mid-map`.  Retries once because MIDs may
    /// be assigned slightly after the local description is set.
    pub async fn map_mids_for_participant(&self, participant: &Arc<Client>) {
        let Some(peer) = participant.peer().await else {
            return;
        };

        let mut map = self.collect_mid_map(&peer).await;
        if map.is_empty() {
            tokio::time::sleep(MID_RETRY_DELAY).await;
            map = self.collect_mid_map(&peer).await;
        }
        if map.is_empty() {
            return;
        }

        {
            let mut state = self.state.write().await;
            for (mid, owner) in &map {
                state.track_publishers.insert(mid.clone(), *owner);
            }
        }

        if !participant.try_send(Envelope::mid_map(&map)) {
            warn!(
                call_id = self.id,
                user_id = participant.user_id,
                "outbound queue full, dropping mid-map"
            );
        }
    }

    async fn collect_mid_map(&self, peer: &Arc<dyn MediaPeer>) -> MidMap {
        let owners = self.state.read().await.published_owners.clone();
        peer.sender_mids()
            .await
            .into_iter()
            .filter_map(|binding| {
                owners
                    .get(&binding.track_id)
                    .map(|owner| (binding.mid, *owner))
            })
            .collect()
    }

    pub async fn published_track_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state.published_tracks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn track_owner(&self, track_id: &str) -> Option<i64> {
        self.state.read().await.published_owners.get(track_id).copied()
    }

    pub async fn mid_publishers(&self) -> MidMap {
        self.state
            .read()
            .await
            .track_publishers
            .iter()
            .map(|(mid, owner)| (mid.clone(), *owner))
            .collect()
    }

    /// Track-map integrity: the two published maps always share a key set.
    pub async fn track_maps_consistent(&self) -> bool {
        let state = self.state.read().await;
        state.published_tracks.len() == state.published_owners.len()
            && state
                .published_tracks
                .keys()
                .all(|k| state.published_owners.contains_key(k))
    }
}
