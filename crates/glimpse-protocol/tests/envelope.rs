/// Contract tests for the signaling envelope: field names are part of the
/// frozen wire format, so each known kind is checked against literal JSON.
use glimpse_protocol::{
    kinds, CallRef, CallStatus, Envelope, SignalMessage, TrackKind, UserStatus,
};
use serde_json::json;

fn envelope(kind: &str, payload: serde_json::Value) -> Envelope {
    serde_json::from_value(json!({
        "type": kind,
        "payload": payload,
        "time": "2026-03-01T12:00:00Z",
    }))
    .expect("envelope should deserialize")
}

#[test]
fn call_ref_kinds_decode_camel_case_fields() {
    for kind in [kinds::CALL_REJECTED, kinds::USER_LEAVE, kinds::ADD_CALLEE] {
        let env = envelope(kind, json!({ "callId": 7, "userId": 3 }));
        let expected = CallRef {
            call_id: 7,
            user_id: 3,
        };
        match env.decode().expect("payload should decode") {
            SignalMessage::CallRejected(p) | SignalMessage::UserLeave(p)
            | SignalMessage::AddCallee(p) => assert_eq!(p, expected),
            other => panic!("unexpected decode for {kind}: {other:?}"),
        }
    }
}

#[test]
fn offer_kinds_keep_sdp_payload_opaque() {
    let sdp = json!({ "type": "offer", "sdp": "v=0..." });
    let env = envelope(
        kinds::CALL_ACCEPTED,
        json!({ "callId": 1, "userId": 2, "offer": sdp }),
    );
    match env.decode().unwrap() {
        SignalMessage::CallAccepted(p) => {
            assert_eq!(p.call_id, 1);
            assert_eq!(p.user_id, 2);
            assert_eq!(p.offer, sdp);
        }
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn track_update_and_reconnect_decode() {
    let env = envelope(
        kinds::TRACK_UPDATE,
        json!({ "callId": 4, "userId": 9, "trackType": "video", "muted": true }),
    );
    match env.decode().unwrap() {
        SignalMessage::TrackUpdate(p) => {
            assert_eq!(p.track_type, TrackKind::Video);
            assert!(p.muted);
        }
        other => panic!("unexpected decode: {other:?}"),
    }

    let env = envelope(
        kinds::RECONNECT,
        json!({ "callId": 4, "userId": 9, "pcAlive": true }),
    );
    match env.decode().unwrap() {
        SignalMessage::Reconnect(p) => assert!(p.pc_alive),
        other => panic!("unexpected decode: {other:?}"),
    }
}

#[test]
fn unknown_kind_round_trips_byte_identically() {
    let raw = json!({
        "type": "screen_share_request",
        "payload": { "anything": [1, 2, 3] },
        "time": "2026-03-01T12:00:00Z",
    });
    let env: Envelope = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(env.decode().unwrap(), SignalMessage::Other);
    assert_eq!(serde_json::to_value(&env).unwrap(), raw);
}

#[test]
fn malformed_payload_for_known_kind_is_an_error() {
    let env = envelope(kinds::USER_LEAVE, json!({ "callId": "not-a-number" }));
    assert!(env.decode().is_err());
}

#[test]
fn statuses_serialize_lowercase() {
    assert_eq!(
        serde_json::to_value(UserStatus::Busy).unwrap(),
        json!("busy")
    );
    assert_eq!(
        serde_json::to_value(CallStatus::Ringing).unwrap(),
        json!("ringing")
    );
}

#[test]
fn mid_map_envelope_is_a_flat_object() {
    let mut map = glimpse_protocol::MidMap::new();
    map.insert("0".to_owned(), 11);
    map.insert("1".to_owned(), 12);
    let env = Envelope::mid_map(&map);
    assert_eq!(env.kind, kinds::MID_MAP);
    assert_eq!(env.payload, json!({ "0": 11, "1": 12 }));
}
