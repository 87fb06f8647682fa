//! webrtc-rs implementation of the peer-connection seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::logger::{dump_candidate, dump_selected_pair, GatheringLog};
use crate::media::{MediaTrack, TrackKind, TrackRef};
use crate::peer::types::{
    IceCandidateInit, IceServerSet, PeerState, SdpKind, SessionDescription, SignalingState,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink};

fn native(err: webrtc::Error) -> CallError {
    CallError::Native(err.to_string())
}

fn build_api() -> Result<API, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(native)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(native)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn rtc_config(servers: &IceServerSet) -> RTCConfiguration {
    let ice_servers = servers
        .servers()
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(native),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(native),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(native),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn from_native(desc: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

/// Inbound track from the partner.
pub struct RemoteTrack {
    inner: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteTrack {
    fn new(inner: Arc<TrackRemote>) -> Option<Self> {
        let kind = match inner.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return None,
        };
        Some(Self {
            id: inner.id(),
            kind,
            inner,
            live: AtomicBool::new(true),
        })
    }

    pub fn native(&self) -> &Arc<TrackRemote> {
        &self.inner
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Builds a fresh [`RtcPeerConnection`] per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        servers: &IceServerSet,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let pc = open(servers, events.clone()).await?;
        info!(servers = servers.servers().len(), "native peer connection created");
        Ok(Arc::new(RtcPeerConnection {
            pc: RwLock::new(pc),
            servers: servers.clone(),
            events,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

async fn open(
    servers: &IceServerSet,
    events: PeerEventSink,
) -> Result<Arc<RTCPeerConnection>, CallError> {
    let api = build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(rtc_config(servers))
            .await
            .map_err(native)?,
    );
    wire_callbacks(&pc, events);
    Ok(pc)
}

async fn attach(
    pc: &RTCPeerConnection,
    local: Arc<TrackLocalStaticSample>,
) -> Result<(), CallError> {
    let rtp_sender = pc
        .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(native)?;
    // drain RTCP so interceptors keep running
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
    });
    Ok(())
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let sink = events.clone();
    let gathering = GatheringLog::default();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let init = IceCandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    };
                    dump_candidate("LOCAL", &init);
                    gathering.record(&init);
                    sink.emit(PeerEvent::IceCandidate(init));
                }
                Err(err) => warn!(error = %err, "could not serialize local candidate"),
            }
        } else {
            debug!(generation = sink.generation(), "local candidate gathering complete");
            gathering.complete();
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    // weak, so the callback does not keep its own connection alive
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(generation = sink.generation(), ?state, "peer connection state changed");
        if state == RTCPeerConnectionState::Failed {
            if let Some(pc) = weak.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        sink.emit(PeerEvent::StateChanged(peer_state(state)));
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            match RemoteTrack::new(track) {
                Some(remote) => {
                    let remote: TrackRef = Arc::new(remote);
                    sink.emit(PeerEvent::Track(remote));
                }
                None => warn!("remote track of unknown kind ignored"),
            }
            Box::pin(async {})
        },
    ));
}

/// Replaces every handler with a no-op so a retired connection stays quiet.
fn unwire_callbacks(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
    pc.on_negotiation_needed(Box::new(|| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| {
        Box::pin(async {})
    }));
    pc.on_track(Box::new(
        |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            Box::pin(async {})
        },
    ));
}

/// A webrtc-rs connection behind the engine's [`PeerConnection`] seam.
///
/// webrtc-rs cannot apply a local rollback from have-local-offer, so rolling
/// back swaps in a new native connection carrying the same outgoing tracks.
/// Events from the replacement keep the generation of this handle.
pub struct RtcPeerConnection {
    pc: RwLock<Arc<RTCPeerConnection>>,
    servers: IceServerSet,
    events: PeerEventSink,
    senders: Mutex<Vec<(String, Arc<TrackLocalStaticSample>)>>,
}

impl RtcPeerConnection {
    /// The native connection currently in use.
    pub fn native(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.read())
    }

    /// Feeds encoded media into the outgoing track that mirrors `track_id`.
    pub async fn write_sample(
        &self,
        track_id: &str,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), CallError> {
        let sender = self
            .senders
            .lock()
            .iter()
            .find(|(id, _)| id == track_id)
            .map(|(_, local)| Arc::clone(local))
            .ok_or_else(|| CallError::Native(format!("no outgoing track {track_id}")))?;
        sender
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(native)
    }

    async fn roll_back(&self) -> Result<(), CallError> {
        let old = self.native();
        if old.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Err(CallError::Negotiation("no local offer to roll back".into()));
        }

        let fresh = open(&self.servers, self.events.clone()).await?;
        let senders: Vec<_> = self
            .senders
            .lock()
            .iter()
            .map(|(_, local)| Arc::clone(local))
            .collect();
        for local in senders {
            if let Err(err) = attach(&fresh, local).await {
                unwire_callbacks(&fresh);
                let _ = fresh.close().await;
                return Err(err);
            }
        }

        *self.pc.write() = fresh;
        unwire_callbacks(&old);
        if let Err(err) = old.close().await {
            warn!(error = %err, "closing rolled back connection failed");
        }
        debug!(generation = self.events.generation(), "local offer rolled back");
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &TrackRef) -> Result<(), CallError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id().to_string(),
            "peercall".to_string(),
        ));

        attach(&self.native(), Arc::clone(&local)).await?;
        self.senders.lock().push((track.id().to_string(), local));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .native()
            .create_offer(Some(options))
            .await
            .map_err(native)?;
        from_native(offer).ok_or_else(|| CallError::Negotiation("offer without type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.native().create_answer(None).await.map_err(native)?;
        from_native(answer).ok_or_else(|| CallError::Negotiation("answer without type".into()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        if desc.kind == SdpKind::Rollback {
            return self.roll_back().await;
        }
        self.native()
            .set_local_description(to_native(desc)?)
            .await
            .map_err(native)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.native()
            .set_remote_description(to_native(desc)?)
            .await
            .map_err(native)
    }

    async fn rollback_and_apply(&self, offer: SessionDescription) -> Result<(), CallError> {
        self.roll_back().await?;
        self.set_remote_description(offer).await
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.native().local_description().await.and_then(from_native)
    }

    async fn has_remote_description(&self) -> bool {
        self.native().remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        self.native()
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(native)
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.native().signaling_state())
    }

    fn connection_state(&self) -> PeerState {
        peer_state(self.native().connection_state())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.senders.lock().clear();
        self.native().close().await.map_err(native)
    }
}
