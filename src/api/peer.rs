//! Per-client WebRTC peer sessions.
//!
//! Each client that opens the peer socket gets its own peer connection with
//! one H.264 video track and one Opus audio track, fed from the tuner's
//! media stream. Signalling (SDP offer/answer, trickle ICE) rides the same
//! WebSocket as JSON messages.

use crate::hub::Subscription;
use crate::tuner::{MediaKind, MediaSample, Tuner};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// WebRTC session errors.
#[derive(Debug)]
pub enum PeerError {
    ConnectionFailed(String),
    SdpError(String),
    IceError(String),
    MediaError(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            PeerError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            PeerError::IceError(msg) => write!(f, "ICE error: {}", msg),
            PeerError::MediaError(msg) => write!(f, "media error: {}", msg),
        }
    }
}

impl Error for PeerError {}

/// Signalling messages exchanged over the peer WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer from the client.
    Offer { sdp: String },
    /// SDP answer from the server.
    Answer { sdp: String },
    /// Trickle ICE candidate, either direction.
    #[serde(rename = "ice")]
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

/// One client's peer connection and its outgoing media tracks.
pub struct PeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
}

impl PeerSession {
    /// Create a peer connection with send-only video and audio tracks whose
    /// codec parameters match the tuner pipeline's output framing.
    pub async fn new() -> Result<Self, PeerError> {
        let peer_connection = create_peer_connection().await?;

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
            "video".to_string(),
            "hypcast".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "hypcast".to_string(),
        ));

        for track in [
            video_track.clone() as Arc<dyn TrackLocal + Send + Sync>,
            audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>,
        ] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            };
            peer_connection
                .add_transceiver_from_track(track, Some(init))
                .await
                .map_err(|e| PeerError::MediaError(format!("failed to add track: {}", e)))?;
        }

        Ok(Self {
            peer_connection,
            video_track,
            audio_track,
        })
    }

    /// Forward tuner media samples to this session's tracks until the
    /// subscription ends. Samples dropped by the hub leave gaps; the next
    /// keyframe resynchronizes the decoder.
    fn spawn_media_forwarder(&self, mut subscription: Subscription<MediaSample>) -> JoinHandle<()> {
        let video = self.video_track.clone();
        let audio = self.audio_track.clone();
        tokio::spawn(async move {
            while let Some(sample) = subscription.next().await {
                let track = match sample.kind {
                    MediaKind::Video => &video,
                    MediaKind::Audio => &audio,
                };
                let result = track
                    .write_sample(&Sample {
                        data: sample.data,
                        duration: sample.duration,
                        ..Default::default()
                    })
                    .await;
                if let Err(e) = result {
                    debug!("Dropping media sample: {}", e);
                }
            }
        })
    }

    /// Apply the client's offer and produce our answer.
    async fn answer_offer(&self, sdp: String) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| PeerError::SdpError(format!("invalid SDP offer: {}", e)))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::SdpError(format!("failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| PeerError::SdpError(format!("failed to create answer: {}", e)))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::SdpError(format!("failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::IceError(format!("failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Serve one WebRTC client until it disconnects.
pub async fn handle_peer_socket(socket: WebSocket, tuner: Arc<Tuner>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // All outgoing signalling funnels through one writer task.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let session = match PeerSession::new().await {
        Ok(session) => session,
        Err(e) => {
            warn!("Failed to create peer session: {}", e);
            send_task.abort();
            return;
        }
    };

    {
        let tx = tx.clone();
        session
            .peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            send_message(
                                &tx,
                                &SignalingMessage::IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            );
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));
    }
    session
        .peer_connection
        .on_peer_connection_state_change(Box::new(|state| {
            debug!("Peer connection state: {:?}", state);
            Box::pin(async {})
        }));

    // The session delivers media as soon as a pipeline produces it; with no
    // pipeline, the connection stands idle.
    let forwarder = session.spawn_media_forwarder(tuner.subscribe_media());
    info!("WebRTC peer session established");

    while let Some(result) = ws_receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let text: &str = text.as_ref();

        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(SignalingMessage::Offer { sdp }) => match session.answer_offer(sdp).await {
                Ok(sdp) => send_message(&tx, &SignalingMessage::Answer { sdp }),
                Err(e) => {
                    warn!("Failed to answer offer: {}", e);
                    break;
                }
            },
            Ok(SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            }) => {
                if let Err(e) = session
                    .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
                    .await
                {
                    warn!("Failed to add ICE candidate: {}", e);
                }
            }
            Ok(SignalingMessage::Answer { .. }) => {
                warn!("Unexpected SDP answer from client");
            }
            Err(e) => warn!("Invalid signalling message: {}", e),
        }
    }

    forwarder.abort();
    session.close().await;
    send_task.abort();
    info!("WebRTC peer session closed");
}

fn send_message(tx: &mpsc::UnboundedSender<String>, message: &SignalingMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!("Failed to encode signalling message: {}", e),
    }
}

async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| PeerError::ConnectionFailed(format!("failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let peer_connection = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .map_err(|e| PeerError::ConnectionFailed(format!("failed to create peer connection: {}", e)))?;

    Ok(Arc::new(peer_connection))
}

fn register_codecs(media_engine: &mut MediaEngine) -> Result<(), PeerError> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| PeerError::MediaError(format!("failed to register H264: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| PeerError::MediaError(format!("failed to register Opus: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer() {
        let json = r#"{"type": "offer", "sdp": "v=0\r\n..."}"#;
        let message: SignalingMessage = serde_json::from_str(json).unwrap();
        match message {
            SignalingMessage::Offer { sdp } => assert!(sdp.starts_with("v=0")),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ice_candidate_field_names() {
        let json = r#"{
            "type": "ice",
            "candidate": "candidate:1 1 UDP 2122252543 192.168.1.10 51234 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }"#;
        let message: SignalingMessage = serde_json::from_str(json).unwrap();
        match message {
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                assert!(candidate.starts_with("candidate:1"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(sdp_mline_index, Some(0));
            }
            other => panic!("expected ice candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_answer_serialization() {
        let message = SignalingMessage::Answer {
            sdp: "v=0...".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0...");
    }

    #[test]
    fn test_ice_candidate_serialization_uses_wire_names() {
        let message = SignalingMessage::IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "ice");
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
    }
}
