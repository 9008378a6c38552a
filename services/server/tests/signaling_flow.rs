//! End-to-end signaling scenarios over hub dispatch with the sim media
//! stack: ring/accept, fan-out, reject, leave, disconnect grace, and late
//! joiners.

#[macro_use]
mod common;

use common::{connect, drain, recv_kind, ringing_call, test_hub, TEST_GRACE};
use glimpse_protocol::{kinds, CallStatus, Envelope, UserStatus};
use serde_json::json;
use server::media::ForwardTrack;

fn offer_from(user_id: i64) -> serde_json::Value {
    json!({ "type": "offer", "sdp": format!("client-sdp-{user_id}") })
}

fn accept(call_id: i64, user_id: i64) -> Envelope {
    Envelope::new(
        kinds::CALL_ACCEPTED,
        json!({ "callId": call_id, "userId": user_id, "offer": offer_from(user_id) }),
    )
}

fn last_mid_map(envelopes: &[Envelope]) -> Option<serde_json::Value> {
    envelopes
        .iter()
        .rev()
        .find(|e| e.kind == kinds::MID_MAP)
        .map(|e| e.payload.clone())
}

#[tokio::test]
async fn two_party_ring_and_accept() {
    let (hub, media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, mut rx2) = connect(&hub, 2, "grace", "s2").await;
    drain(&mut rx1);
    drain(&mut rx2);

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;

    // The callee rings with the full call record, then sees the caller go
    // busy.
    let ring = recv_kind(&mut rx2, kinds::INCOMING_CALL).await.expect("ring");
    assert_eq!(ring.payload["callerId"], json!(1));
    let busy = recv_kind(&mut rx2, kinds::USER_BUSY).await.expect("busy fan-out");
    assert_eq!(busy.payload["user_id"], json!(1));
    assert_eq!(
        hub.check_user_status(1).await.expect("status").status,
        UserStatus::Busy
    );

    // The caller's negotiation produces its answer.
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u1.peer().await.is_some()));

    // The caller's remote track arrives and is republished.
    session
        .publish_track(1, ForwardTrack::sim("1-cam"), true)
        .await;

    hub.dispatch(accept(1, 2)).await;

    // The acceptor's answer arrives with the caller's track pre-loaded, and
    // the mid-map follows.
    assert!(recv_kind(&mut rx2, kinds::ANSWER).await.is_some());
    let peer2 = media.peer_for(2).expect("acceptor peer");
    assert_eq!(peer2.added_track_ids(), vec!["1-cam"]);
    let map2 = recv_kind(&mut rx2, kinds::MID_MAP).await.expect("mid map");
    assert_eq!(map2.payload, json!({ "0": 1 }));

    assert_eq!(session.call().await.status, CallStatus::Ongoing);
    assert_eq!(
        hub.check_user_status(2).await.expect("status").status,
        UserStatus::Busy
    );
    assert!(wait_until!(u2.peer().await.is_some()));

    // The acceptor publishes; the caller renegotiates and learns the
    // mapping.
    session
        .publish_track(2, ForwardTrack::sim("2-cam"), true)
        .await;
    assert!(recv_kind(&mut rx1, kinds::OFFER).await.is_some());
    let map1 = recv_kind(&mut rx1, kinds::MID_MAP).await.expect("mid map");
    assert_eq!(map1.payload, json!({ "0": 2 }));

    let peer1 = media.peer_for(1).expect("caller peer");
    assert_eq!(peer1.added_track_ids(), vec!["2-cam"]);
}

#[tokio::test]
async fn three_party_fan_out() {
    let (hub, media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, mut rx2) = connect(&hub, 2, "grace", "s2").await;
    let (u3, mut rx3) = connect(&hub, 3, "edsger", "s3").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2, 3])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u1.peer().await.is_some()));
    session
        .publish_track(1, ForwardTrack::sim("1-cam"), true)
        .await;

    hub.dispatch(accept(1, 2)).await;
    assert!(recv_kind(&mut rx2, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u2.peer().await.is_some()));
    session
        .publish_track(2, ForwardTrack::sim("2-cam"), true)
        .await;

    hub.dispatch(accept(1, 3)).await;
    assert!(recv_kind(&mut rx3, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u3.peer().await.is_some()));
    session
        .publish_track(3, ForwardTrack::sim("3-cam"), true)
        .await;

    let peer1 = media.peer_for(1).expect("peer 1");
    let peer2 = media.peer_for(2).expect("peer 2");
    let peer3 = media.peer_for(3).expect("peer 3");

    // Every participant ends up subscribed to exactly the other two.
    assert!(wait_until!({
        let mut ids = peer1.added_track_ids();
        ids.sort();
        ids == ["2-cam", "3-cam"]
    }));
    assert!(wait_until!({
        let mut ids = peer2.added_track_ids();
        ids.sort();
        ids == ["1-cam", "3-cam"]
    }));
    assert!(wait_until!({
        let mut ids = peer3.added_track_ids();
        ids.sort();
        ids == ["1-cam", "2-cam"]
    }));

    // Let the renegotiation/mid-map tasks settle, then check that the most
    // recent map each participant received partitions the other two.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let map1 = last_mid_map(&drain(&mut rx1)).expect("mid map for 1");
    let map2 = last_mid_map(&drain(&mut rx2)).expect("mid map for 2");
    let map3 = last_mid_map(&drain(&mut rx3)).expect("mid map for 3");

    let owners = |map: &serde_json::Value| {
        let mut owners: Vec<i64> = map
            .as_object()
            .expect("map object")
            .values()
            .map(|v| v.as_i64().expect("owner id"))
            .collect();
        owners.sort_unstable();
        owners
    };
    assert_eq!(owners(&map1), vec![2, 3]);
    assert_eq!(owners(&map2), vec![1, 3]);
    assert_eq!(owners(&map3), vec![1, 2]);
}

#[tokio::test]
async fn callee_rejection_leaves_the_rest_of_the_call_intact() {
    let (hub, _media) = test_hub();
    let (_u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (_u2, _rx2) = connect(&hub, 2, "grace", "s2").await;
    let (_u3, _rx3) = connect(&hub, 3, "edsger", "s3").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2, 3])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    hub.dispatch(accept(1, 2)).await;
    assert!(session.participant(2).await.is_some());
    drain(&mut rx1);

    hub.dispatch(Envelope::new(
        kinds::CALL_REJECTED,
        json!({ "callId": 1, "userId": 3 }),
    ))
    .await;

    assert!(session.participant(3).await.is_none());
    assert!(session.participant(2).await.is_some(), "u2 stays in the call");
    assert!(hub.call_session(1).await.is_some(), "call still live");

    let rejected = recv_kind(&mut rx1, kinds::CALL_REJECTED)
        .await
        .expect("rejection forwarded to caller");
    assert_eq!(rejected.payload["userId"], json!(3));
}

#[tokio::test]
async fn rejection_by_the_only_callee_collapses_to_missed() {
    let (hub, _media) = test_hub();
    let (_u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (_u2, _rx2) = connect(&hub, 2, "grace", "s2").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());

    hub.dispatch(Envelope::new(
        kinds::CALL_REJECTED,
        json!({ "callId": 1, "userId": 2 }),
    ))
    .await;

    assert!(hub.call_session(1).await.is_none(), "session dropped");
    assert_eq!(session.call().await.status, CallStatus::Missed);
    assert!(session.call().await.end_time.is_some());
    assert_eq!(
        hub.check_user_status(1).await.expect("status").status,
        UserStatus::Online,
        "caller returns to online after the miss"
    );
    assert!(recv_kind(&mut rx1, kinds::CALL_REJECTED).await.is_some());
}

#[tokio::test]
async fn graceful_leave_collapses_the_call() {
    let (hub, media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, _rx2) = connect(&hub, 2, "grace", "s2").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    hub.dispatch(accept(1, 2)).await;
    assert!(wait_until!(u1.peer().await.is_some()));
    assert!(wait_until!(u2.peer().await.is_some()));
    drain(&mut rx1);

    hub.dispatch(Envelope::new(
        kinds::USER_LEAVE,
        json!({ "callId": 1, "userId": 2 }),
    ))
    .await;

    // The remaining participant is notified, the session is gone, the call
    // row is finished, and presence returns to online on both sides.
    assert!(recv_kind(&mut rx1, kinds::USER_LEAVE).await.is_some());
    assert!(hub.call_session(1).await.is_none());
    let call = session.call().await;
    assert_eq!(call.status, CallStatus::Ended);
    assert!(call.end_time.is_some());
    assert_eq!(session.participant_count().await, 0);
    assert!(media.peer_for(1).expect("caller peer").is_closed());
    assert!(media.peer_for(2).expect("callee peer").is_closed());
    assert_eq!(
        hub.check_user_status(1).await.expect("status").status,
        UserStatus::Online
    );
    assert_eq!(
        hub.check_user_status(2).await.expect("status").status,
        UserStatus::Online
    );
}

#[tokio::test]
async fn transient_disconnect_reconnects_within_grace() {
    let (hub, _media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, _rx2) = connect(&hub, 2, "grace", "s2").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    hub.dispatch(accept(1, 2)).await;
    assert!(wait_until!(u1.peer().await.is_some()));
    assert!(wait_until!(u2.peer().await.is_some()));

    // Socket drops...
    hub.unregister(u2).await;
    assert!(!hub.is_user_online(2).await);
    assert!(
        session.participant(2).await.is_some(),
        "grace keeps their place in the call"
    );

    // ...and comes back with the peer connection still alive.
    let (u2b, mut rx2b) = connect(&hub, 2, "grace", "s2b").await;
    hub.dispatch(Envelope::new(
        kinds::RECONNECT,
        json!({ "callId": 1, "userId": 2, "pcAlive": true }),
    ))
    .await;

    let attached = session.participant(2).await.expect("still in session");
    assert_eq!(attached.session_id, u2b.session_id);
    assert!(u2b.peer().await.is_some(), "peer handle carried over");
    assert!(
        recv_kind(&mut rx2b, kinds::OFFER).await.is_some(),
        "renegotiation offer enqueued asynchronously"
    );

    // Grace expiry later must be a no-op.
    tokio::time::sleep(TEST_GRACE * 2).await;
    assert!(session.participant(2).await.is_some());
    assert!(hub.call_session(1).await.is_some());
}

#[tokio::test]
async fn grace_expiry_evicts_the_disconnected_user() {
    let (hub, _media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, _rx2) = connect(&hub, 2, "grace", "s2").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    hub.dispatch(accept(1, 2)).await;
    assert!(wait_until!(u1.peer().await.is_some()));
    assert!(wait_until!(u2.peer().await.is_some()));
    drain(&mut rx1);

    hub.unregister(u2.clone()).await;
    assert!(wait_until!(hub.call_session(1).await.is_none()));

    // The synthetic leave reached the caller and the session collapsed.
    assert!(recv_kind(&mut rx1, kinds::USER_LEAVE).await.is_some());
    assert_eq!(session.participant_count().await, 0);
    assert!(u2.is_queue_closed());
    assert_eq!(
        hub.check_user_status(2).await.expect("status").status,
        UserStatus::Offline,
        "an expired user does not come back online"
    );
}

#[tokio::test]
async fn late_publisher_via_add_callee() {
    let (hub, media) = test_hub();
    let (u1, mut rx1) = connect(&hub, 1, "ada", "s1").await;
    let (u2, mut rx2) = connect(&hub, 2, "grace", "s2").await;

    let session = hub.create_call_session(ringing_call(1, 1, &[2])).await;
    hub.dispatch(Envelope::new(
        kinds::INCOMING_CALL,
        json!({ "callId": 1, "userId": 1 }),
    ))
    .await;
    assert!(recv_kind(&mut rx1, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u1.peer().await.is_some()));
    session
        .publish_track(1, ForwardTrack::sim("1-cam"), true)
        .await;
    hub.dispatch(accept(1, 2)).await;
    assert!(recv_kind(&mut rx2, kinds::ANSWER).await.is_some());
    assert!(wait_until!(u2.peer().await.is_some()));
    session
        .publish_track(2, ForwardTrack::sim("2-cam"), true)
        .await;

    // Mid-call, a third user is pulled in.
    let (_u3, mut rx3) = connect(&hub, 3, "edsger", "s3").await;
    hub.dispatch(Envelope::new(
        kinds::ADD_CALLEE,
        json!({ "callId": 1, "userId": 3 }),
    ))
    .await;

    let ring = recv_kind(&mut rx3, kinds::INCOMING_CALL).await.expect("ring");
    assert!(ring.payload["calleeIds"]
        .as_array()
        .expect("callee ids")
        .contains(&json!(3)));
    assert_eq!(session.call().await.callee_ids, vec![2, 3]);

    // Re-sending add_callee attaches them exactly once.
    hub.dispatch(Envelope::new(
        kinds::ADD_CALLEE,
        json!({ "callId": 1, "userId": 3 }),
    ))
    .await;
    assert_eq!(session.call().await.callee_ids, vec![2, 3]);
    assert_eq!(session.participant_count().await, 3);

    hub.dispatch(accept(1, 3)).await;
    assert!(recv_kind(&mut rx3, kinds::ANSWER).await.is_some());

    // The late joiner renders both existing publishers from its very first
    // answer...
    let peer3 = media.peer_for(3).expect("late peer");
    let mut preloaded = peer3.added_track_ids();
    preloaded.sort();
    assert_eq!(preloaded, vec!["1-cam", "2-cam"]);
    let map3 = recv_kind(&mut rx3, kinds::MID_MAP).await.expect("mid map");
    assert_eq!(map3.payload.as_object().expect("map").len(), 2);

    // ...and once it publishes, the veterans renegotiate and re-map.
    drain(&mut rx1);
    drain(&mut rx2);
    session
        .publish_track(3, ForwardTrack::sim("3-cam"), true)
        .await;
    assert!(recv_kind(&mut rx1, kinds::OFFER).await.is_some());
    assert!(recv_kind(&mut rx2, kinds::OFFER).await.is_some());
    assert!(recv_kind(&mut rx1, kinds::MID_MAP).await.is_some());
    assert!(recv_kind(&mut rx2, kinds::MID_MAP).await.is_some());
}
