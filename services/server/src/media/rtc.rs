//! Production media backend over the `webrtc` crate.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::{ForwardTrack, MediaError, MediaPeer, MediaStack, MidBinding, PeerBinding};
use glimpse_protocol::{Envelope, IceCandidatePayload};

/// Cap on waiting for ICE gathering during renegotiation.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence for asking publishers for a fresh keyframe, so subscribers that
/// join mid-stream can render without waiting for a natural keyframe.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

pub struct RtcMediaStack {
    api: Arc<API>,
    stun_url: String,
}

impl RtcMediaStack {
    pub fn new(stun_url: impl Into<String>) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            stun_url: stun_url.into(),
        })
    }

    fn config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_url.clone()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaStack for RtcMediaStack {
    async fn create_peer(&self, binding: PeerBinding) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config()).await?);
        let PeerBinding {
            user_id,
            call_id,
            outbound,
            session,
        } = binding;

        // Gathered candidates go straight onto the owning client's queue;
        // a full queue drops the candidate rather than stall the ICE agent.
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(user_id, error = %e, "failed to serialize ICE candidate");
                        return;
                    }
                };
                let payload = IceCandidatePayload {
                    call_id,
                    user_id,
                    candidate: serde_json::to_value(init).unwrap_or(Value::Null),
                };
                if outbound
                    .try_send(Envelope::ice_candidate(&payload))
                    .is_err()
                {
                    warn!(user_id, "outbound queue full, dropping ICE candidate");
                }
            })
        }));

        // Subscribers need an m-line to receive on even before they publish.
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let pc_for_tracks = Arc::downgrade(&pc);
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let session = session.clone();
            let pc_weak = pc_for_tracks.clone();
            Box::pin(async move {
                let codec = remote.codec();
                let track_id = format!("{user_id}-{}", remote.id());
                debug!(
                    user_id,
                    call_id,
                    track_id = %track_id,
                    mime = %codec.capability.mime_type,
                    "remote track arrived"
                );

                let local = Arc::new(TrackLocalStaticRTP::new(
                    codec.capability.clone(),
                    track_id,
                    format!("glimpse-{user_id}"),
                ));

                // Interval PLI toward the publisher, for the lifetime of the
                // peer connection.
                let media_ssrc = remote.ssrc();
                let pli_pc = pc_weak.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(PLI_INTERVAL);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(pc) = pli_pc.upgrade() else { break };
                        let pli = PictureLossIndication {
                            sender_ssrc: 0,
                            media_ssrc,
                        };
                        if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
                            break;
                        }
                    }
                });

                session
                    .publish_track(user_id, ForwardTrack::from_rtc(local.clone()), true)
                    .await;

                // Copy RTP packet-for-packet into the forwarded track until
                // the remote side stops.  A closed pipe just means no
                // subscriber is bound yet.
                loop {
                    match remote.read_rtp().await {
                        Ok((packet, _)) => {
                            if let Err(e) = local.write_rtp(&packet).await {
                                if matches!(e, webrtc::Error::ErrClosedPipe) {
                                    continue;
                                }
                                warn!(user_id, error = %e, "forward track write error");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(user_id, error = %e, "remote track ended");
                            break;
                        }
                    }
                }
            })
        }));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn set_remote_offer(&self, offer: &Value) -> Result<(), MediaError> {
        let description = decode_description(offer)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn answer(&self) -> Result<Value, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;
        let _ = gathered.recv().await;
        local_description(&self.pc).await
    }

    async fn negotiate_offer(&self) -> Result<Value, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        // Proceed with whatever candidates exist once the cap elapses.
        let _ = tokio::time::timeout(ICE_GATHER_TIMEOUT, gathered.recv()).await;
        local_description(&self.pc).await
    }

    async fn add_forward_track(&self, track: &ForwardTrack) -> Result<(), MediaError> {
        let Some(local) = track.rtc_track() else {
            return Err(MediaError::Backend(
                "sim track offered to rtc peer".to_owned(),
            ));
        };
        let sender = self
            .pc
            .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // Drain RTCP so the interceptor chain (NACK et al) keeps running.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Value) -> Result<(), MediaError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())
            .map_err(|e| MediaError::BadCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn sender_mids(&self) -> Vec<MidBinding> {
        let mut bindings = Vec::new();
        for transceiver in self.pc.get_transceivers().await {
            let Some(mid) = transceiver.mid() else {
                continue;
            };
            let sender = transceiver.sender().await;
            let Some(track) = sender.track().await else {
                continue;
            };
            bindings.push(MidBinding {
                track_id: track.id().to_owned(),
                mid: mid.to_string(),
            });
        }
        bindings
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}

async fn local_description(pc: &RTCPeerConnection) -> Result<Value, MediaError> {
    let description = pc
        .local_description()
        .await
        .ok_or_else(|| MediaError::Backend("no local description after negotiation".to_owned()))?;
    serde_json::to_value(description).map_err(|e| MediaError::BadDescription(e.to_string()))
}

/// Accept a directly-encoded JSON description, or a quoted base64-encoded
/// one for a legacy client that wraps the JSON before sending.
fn decode_description(value: &Value) -> Result<RTCSessionDescription, MediaError> {
    if let Ok(description) = serde_json::from_value::<RTCSessionDescription>(value.clone()) {
        return Ok(description);
    }
    let Value::String(encoded) = value else {
        return Err(MediaError::BadDescription(
            "neither SDP JSON nor base64 string".to_owned(),
        ));
    };
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| MediaError::BadDescription(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| MediaError::BadDescription(e.to_string()))
}
