mod common;

use common::{recv_kind, ringing_call, test_hub};
use glimpse_protocol::{kinds, Envelope};
use serde_json::json;
use server::call_session::CallSession;
use server::client::Client;
use server::media::sim::{SimMediaStack, SimPeer};
use server::media::{ForwardTrack, MediaPeer, MediaStack, PeerBinding};
use std::sync::Arc;
use tokio::sync::mpsc;

async fn sim_peer(
    media: &Arc<SimMediaStack>,
    session: &Arc<CallSession>,
    client: &Arc<Client>,
) -> Arc<SimPeer> {
    let binding = PeerBinding {
        user_id: client.user_id,
        call_id: session.id,
        outbound: client.outbound_sender(),
        session: session.clone(),
    };
    let peer = media.create_peer(binding).await.expect("sim peer");
    client.set_peer(peer).await;
    media.peer_for(client.user_id).expect("recorded sim peer")
}

fn participant(user_id: i64, name: &str) -> (Arc<Client>, mpsc::Receiver<Envelope>) {
    Client::new(user_id, name, format!("sess-{user_id}"))
}

#[tokio::test]
async fn add_participant_is_idempotent() {
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u2, _rx) = participant(2, "grace");
    session.add_participant(u2.clone()).await;
    session.add_participant(u2).await;
    assert_eq!(session.participant_count().await, 1);
}

#[tokio::test]
async fn remove_participant_closes_peer_and_notifies_the_rest() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u1, mut rx1) = participant(1, "ada");
    let (u2, _rx2) = participant(2, "grace");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;
    let peer2 = sim_peer(&media, &session, &u2).await;

    let notice = Envelope::user_leave(1, 2);
    session.remove_participant(2, Some(&notice)).await;

    assert!(session.participant(2).await.is_none());
    assert!(peer2.is_closed());
    let got = recv_kind(&mut rx1, kinds::USER_LEAVE).await.expect("notice");
    assert_eq!(got.payload["userId"], json!(2));
}

#[tokio::test]
async fn removing_a_publisher_drops_their_tracks() {
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u2, _rx) = participant(2, "grace");
    session.add_participant(u2).await;

    session
        .publish_track(2, ForwardTrack::sim("2-cam"), false)
        .await;
    session
        .publish_track(2, ForwardTrack::sim("2-mic"), false)
        .await;
    assert_eq!(session.published_track_ids().await, vec!["2-cam", "2-mic"]);
    assert!(session.track_maps_consistent().await);

    session.remove_participant(2, None).await;
    assert!(session.published_track_ids().await.is_empty());
    assert!(session.track_maps_consistent().await);
}

#[tokio::test]
async fn close_empties_the_session_and_closes_every_peer() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u1, _rx1) = participant(1, "ada");
    let (u2, _rx2) = participant(2, "grace");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;
    let peer1 = sim_peer(&media, &session, &u1).await;
    let peer2 = sim_peer(&media, &session, &u2).await;

    session.close().await;

    assert_eq!(session.participant_count().await, 0);
    assert!(peer1.is_closed());
    assert!(peer2.is_closed());
}

#[tokio::test]
async fn publish_track_reaches_every_other_live_peer() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2, 3]));
    let (u1, _rx1) = participant(1, "ada");
    let (u2, _rx2) = participant(2, "grace");
    let (u3, _rx3) = participant(3, "edsger");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;
    session.add_participant(u3).await;
    let peer1 = sim_peer(&media, &session, &u1).await;
    let peer2 = sim_peer(&media, &session, &u2).await;
    // u3 has no peer connection yet and must simply be skipped.

    session
        .publish_track(1, ForwardTrack::sim("1-cam"), false)
        .await;

    assert!(peer1.added_track_ids().is_empty(), "publisher not subscribed");
    assert_eq!(peer2.added_track_ids(), vec!["1-cam"]);
    assert_eq!(session.track_owner("1-cam").await, Some(1));
}

#[tokio::test]
async fn renegotiation_pushes_offer_then_mid_map() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u1, _rx1) = participant(1, "ada");
    let (u2, mut rx2) = participant(2, "grace");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;
    let _peer1 = sim_peer(&media, &session, &u1).await;
    let _peer2 = sim_peer(&media, &session, &u2).await;

    session
        .publish_track(1, ForwardTrack::sim("1-cam"), true)
        .await;

    let offer = recv_kind(&mut rx2, kinds::OFFER).await.expect("offer to u2");
    assert_eq!(offer.payload["type"], json!("offer"));

    let mid_map = recv_kind(&mut rx2, kinds::MID_MAP).await.expect("mid map");
    assert_eq!(mid_map.payload, json!({ "0": 1 }));
    assert_eq!(session.mid_publishers().await.get("0"), Some(&1));
}

#[tokio::test]
async fn preload_excludes_the_subscribers_own_tracks() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u1, _rx1) = participant(1, "ada");
    let (u2, _rx2) = participant(2, "grace");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;

    session
        .publish_track(1, ForwardTrack::sim("1-cam"), false)
        .await;
    session
        .publish_track(2, ForwardTrack::sim("2-cam"), false)
        .await;

    let peer2 = sim_peer(&media, &session, &u2).await;
    let handle = u2.peer().await.expect("peer handle");
    session
        .add_published_tracks_to_peer(&handle, 2)
        .await
        .expect("preload");

    assert_eq!(peer2.added_track_ids(), vec!["1-cam"]);
}

#[tokio::test]
async fn mid_map_joins_sender_mids_against_owners() {
    let (_hub, media) = test_hub();
    let session = CallSession::new(ringing_call(1, 1, &[2]));
    let (u1, mut rx1) = participant(1, "ada");
    let (u2, _rx2) = participant(2, "grace");
    session.add_participant(u1.clone()).await;
    session.add_participant(u2.clone()).await;
    let peer1 = sim_peer(&media, &session, &u1).await;

    session
        .publish_track(2, ForwardTrack::sim("2-cam"), false)
        .await;
    assert_eq!(peer1.added_track_ids(), vec!["2-cam"]);
    peer1.negotiate_offer().await.expect("negotiate");

    session.map_mids_for_participant(&u1).await;
    let mid_map = recv_kind(&mut rx1, kinds::MID_MAP).await.expect("mid map");
    assert_eq!(mid_map.payload, json!({ "0": 2 }));
}
