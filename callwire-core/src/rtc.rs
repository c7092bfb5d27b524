//! `webrtc` crate backend
//!
//! [`RtcPeerConnectionFactory`] builds `RTCPeerConnection`s with the default
//! codecs and interceptors; [`SampleCaptureDevice`] hands out opus/VP8
//! sample tracks the application feeds with encoded frames through
//! [`MediaTrack::write_sample`].

use crate::media::{CaptureDevice, MediaError, MediaTrack};
use crate::peer::{NegotiationError, PeerConnectionBackend, PeerConnectionFactory, PeerEvent, PeerEventSender};
use crate::types::{IceCandidate, IceServer, MediaConstraints, PeerConnectionState, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Creates `webrtc` peer connections
pub struct RtcPeerConnectionFactory {
    api: API,
}

impl RtcPeerConnectionFactory {
    /// Build the API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Create(format!("codec registration: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Create(format!("interceptor registration: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

fn rtc_configuration(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnectionBackend>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(ice_servers))
                .await
                .map_err(|e| NegotiationError::Create(e.to_string()))?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialise local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let track = MediaTrack::new(remote.id(), track_kind(remote.kind()));
                let _ = tx.send(PeerEvent::RemoteTrack {
                    stream_id: remote.stream_id(),
                    track: track.clone(),
                });

                // Keep the receiver drained; rendering is the host's concern.
                tokio::spawn(async move {
                    while track.is_live() {
                        if remote.read_rtp().await.is_err() {
                            break;
                        }
                    }
                    track.stop();
                });
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(PeerEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

/// `RTCPeerConnection` adapter
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerConnection {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
    }
}

#[async_trait]
impl PeerConnectionBackend for RtcPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let local = track
            .rtc_track()
            .ok_or_else(|| NegotiationError::AddTrack(format!("track {} has no sample sink", track.id())))?;

        let sender = self
            .pc
            .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::AddTrack(e.to_string()))?;

        // RTCP must be read for interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::CreateOffer(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::CreateAnswer(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let desc = Self::to_rtc(desc).map_err(|e| NegotiationError::LocalDescription(e.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::LocalDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = Self::to_rtc(desc).map_err(|e| NegotiationError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::RemoteDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::AddCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::Close(e.to_string()))
    }
}

/// Capture device producing `webrtc` sample tracks
///
/// There is no physical device behind it: the application writes encoded
/// opus/VP8 frames to the returned tracks.
#[derive(Debug, Default)]
pub struct SampleCaptureDevice {
    opened: AtomicU64,
}

impl SampleCaptureDevice {
    /// Create a device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn codec(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

#[async_trait]
impl CaptureDevice for SampleCaptureDevice {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>, MediaError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let stream_id = format!("callwire-{n}");

        Ok(constraints
            .to_track_kinds()
            .into_iter()
            .map(|kind| {
                let track_id = format!("{kind}-{n}");
                tracing::debug!(track_id = %track_id, %kind, "Creating sample track");
                let sample = Arc::new(TrackLocalStaticSample::new(
                    Self::codec(kind),
                    track_id.clone(),
                    stream_id.clone(),
                ));
                MediaTrack::with_rtc_track(track_id, kind, sample)
            })
            .collect())
    }
}
