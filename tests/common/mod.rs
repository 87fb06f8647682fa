#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use peercall::error::{CallError, MediaError};
use peercall::events::CallEvent;
use peercall::media::{
    CaptureDevices, CapturedTrack, DeviceInfo, DeviceKind, MediaConstraints, MediaSink,
    MediaStream, MediaTrack, TrackKind, TrackRef,
};
use peercall::peer::types::{
    IceCandidateInit, IceServerSet, PeerState, SdpKind, SessionDescription, SignalingState,
};
use peercall::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink};
use peercall::signaling::{LoopbackRelay, RelayEndpoint, SignalMessage, SignalingChannel};

/// How a fake connection behaves once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Connects when an offer/answer exchange completes.
    Negotiate,
    ConnectImmediately,
    FailImmediately,
    /// Never changes connection state on its own.
    Silent,
}

struct PeerInner {
    signaling: SignalingState,
    connection: PeerState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    candidates: Vec<IceCandidateInit>,
    tracks: Vec<TrackRef>,
    counter: u32,
    rollbacks: u32,
    negotiation_needed_sent: bool,
    remote_tracks_sent: bool,
    closed: bool,
}

/// In-memory peer connection that enforces the offer/answer state rules.
pub struct FakePeer {
    label: String,
    script: Script,
    events: PeerEventSink,
    inner: Mutex<PeerInner>,
}

fn rejected(what: &str, state: SignalingState) -> CallError {
    CallError::Native(format!("{what} not allowed in {state:?}"))
}

impl FakePeer {
    pub fn new(label: impl Into<String>, script: Script, events: PeerEventSink) -> Self {
        Self {
            label: label.into(),
            script,
            events,
            inner: Mutex::new(PeerInner {
                signaling: SignalingState::Stable,
                connection: PeerState::New,
                current_local: None,
                pending_local: None,
                current_remote: None,
                pending_remote: None,
                candidates: Vec::new(),
                tracks: Vec::new(),
                counter: 0,
                rollbacks: 0,
                negotiation_needed_sent: false,
                remote_tracks_sent: false,
                closed: false,
            }),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub fn set_state(&self, state: PeerState) {
        self.inner.lock().connection = state;
        self.emit(PeerEvent::StateChanged(state));
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn rollbacks(&self) -> u32 {
        self.inner.lock().rollbacks
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        inner.pending_remote.clone().or(inner.current_remote.clone())
    }

    pub fn local_offer(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        inner
            .pending_local
            .clone()
            .or(inner.current_local.clone())
            .filter(|desc| desc.kind == SdpKind::Offer)
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn connect(&self) {
        self.set_state(PeerState::Connecting);
        self.set_state(PeerState::Connected);
        let send_tracks = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.remote_tracks_sent, true)
        };
        if send_tracks {
            for kind in [TrackKind::Audio, TrackKind::Video] {
                let track: TrackRef = CapturedTrack::new(kind, format!("{}-remote-{kind}", self.label));
                self.emit(PeerEvent::Track(track));
            }
        }
    }

    fn exchange_complete(&self) {
        let already = self.inner.lock().connection == PeerState::Connected;
        if self.script == Script::Negotiate && !already {
            self.connect();
        }
    }

    fn gather(&self) {
        self.emit(PeerEvent::IceCandidate(IceCandidateInit::new(format!(
            "candidate:{} 1 udp 2122 10.0.0.1 9 typ host",
            self.label
        ))));
    }

    fn check_open(&self) -> Result<(), CallError> {
        if self.inner.lock().closed {
            return Err(CallError::Native("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &TrackRef) -> Result<(), CallError> {
        self.check_open()?;
        let first = {
            let mut inner = self.inner.lock();
            inner.tracks.push(track.clone());
            !std::mem::replace(&mut inner.negotiation_needed_sent, true)
        };
        if first {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        inner.counter += 1;
        let restart = if ice_restart { ":restart" } else { "" };
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}{restart}",
            self.label, inner.counter
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(rejected("create_answer", inner.signaling));
        }
        inner.counter += 1;
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.label, inner.counter
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.check_open()?;
        let complete = {
            let mut inner = self.inner.lock();
            match desc.kind {
                SdpKind::Offer => {
                    if !matches!(
                        inner.signaling,
                        SignalingState::Stable | SignalingState::HaveLocalOffer
                    ) {
                        return Err(rejected("local offer", inner.signaling));
                    }
                    inner.pending_local = Some(desc);
                    inner.signaling = SignalingState::HaveLocalOffer;
                    false
                }
                SdpKind::Answer => {
                    if inner.signaling != SignalingState::HaveRemoteOffer {
                        return Err(rejected("local answer", inner.signaling));
                    }
                    inner.current_local = Some(desc);
                    inner.current_remote = inner.pending_remote.take();
                    inner.signaling = SignalingState::Stable;
                    true
                }
                SdpKind::Rollback => {
                    if inner.signaling != SignalingState::HaveLocalOffer {
                        return Err(rejected("local rollback", inner.signaling));
                    }
                    inner.pending_local = None;
                    inner.signaling = SignalingState::Stable;
                    inner.rollbacks += 1;
                    return Ok(());
                }
                SdpKind::Pranswer => return Err(rejected("pranswer", inner.signaling)),
            }
        };
        self.gather();
        if complete {
            self.exchange_complete();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.check_open()?;
        let complete = {
            let mut inner = self.inner.lock();
            match desc.kind {
                SdpKind::Offer => {
                    if inner.signaling != SignalingState::Stable {
                        return Err(rejected("remote offer", inner.signaling));
                    }
                    inner.pending_remote = Some(desc);
                    inner.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                SdpKind::Answer => {
                    if inner.signaling != SignalingState::HaveLocalOffer {
                        return Err(rejected("remote answer", inner.signaling));
                    }
                    inner.current_local = inner.pending_local.take();
                    inner.current_remote = Some(desc);
                    inner.signaling = SignalingState::Stable;
                    true
                }
                SdpKind::Rollback => {
                    if inner.signaling != SignalingState::HaveRemoteOffer {
                        return Err(rejected("remote rollback", inner.signaling));
                    }
                    inner.pending_remote = None;
                    inner.signaling = SignalingState::Stable;
                    false
                }
                SdpKind::Pranswer => return Err(rejected("pranswer", inner.signaling)),
            }
        };
        if complete {
            self.exchange_complete();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        inner.pending_local.clone().or(inner.current_local.clone())
    }

    async fn has_remote_description(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending_remote.is_some() || inner.current_remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.pending_remote.is_none() && inner.current_remote.is_none() {
            return Err(CallError::Native("remote description not set".into()));
        }
        inner.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    fn connection_state(&self) -> PeerState {
        self.inner.lock().connection
    }

    async fn close(&self) -> Result<(), CallError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.signaling = SignalingState::Closed;
        }
        self.set_state(PeerState::Closed);
        Ok(())
    }
}

pub struct FakeFactory {
    label: String,
    default: Script,
    scripts: Mutex<VecDeque<Script>>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
    servers: Mutex<Vec<IceServerSet>>,
}

impl FakeFactory {
    pub fn new(label: impl Into<String>, default: Script) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            default,
            scripts: Mutex::new(VecDeque::new()),
            peers: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
        })
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn servers_seen(&self) -> Vec<IceServerSet> {
        self.servers.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        servers: &IceServerSet,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let script = self.scripts.lock().pop_front().unwrap_or(self.default);
        let index = self.created();
        let peer = Arc::new(FakePeer::new(
            format!("{}{}", self.label, index),
            script,
            events,
        ));
        self.servers.lock().push(servers.clone());
        self.peers.lock().push(peer.clone());

        match script {
            Script::ConnectImmediately => peer.connect(),
            Script::FailImmediately => {
                peer.set_state(PeerState::Connecting);
                peer.set_state(PeerState::Failed);
            }
            Script::Negotiate | Script::Silent => {}
        }
        let pc: Arc<dyn PeerConnection> = peer;
        Ok(pc)
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub deny: bool,
    pub delay: Option<Duration>,
    handed_out: Mutex<Vec<Arc<CapturedTrack>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn handed_out(&self) -> usize {
        self.handed_out.lock().len()
    }

    pub fn live_tracks(&self) -> usize {
        self.handed_out
            .lock()
            .iter()
            .filter(|track| track.is_live())
            .count()
    }
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(vec![
            DeviceInfo {
                device_id: "mic-1".into(),
                kind: DeviceKind::AudioInput,
                label: "Built-in microphone".into(),
            },
            DeviceInfo {
                device_id: "cam-1".into(),
                kind: DeviceKind::VideoInput,
                label: "Built-in camera".into(),
            },
        ])
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks: Vec<TrackRef> = Vec::new();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if constraints.wants(kind) {
                let track = CapturedTrack::new(kind, format!("local-{kind}"));
                self.handed_out.lock().push(track.clone());
                tracks.push(track as TrackRef);
            }
        }
        Ok(MediaStream::new(tracks))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    attached: Mutex<Vec<(Vec<String>, bool)>>,
    detached: Mutex<usize>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach_count(&self) -> usize {
        self.attached.lock().len()
    }

    pub fn last_track_ids(&self) -> Vec<String> {
        self.attached
            .lock()
            .last()
            .map(|(ids, _)| ids.clone())
            .unwrap_or_default()
    }

    pub fn last_muted(&self) -> Option<bool> {
        self.attached.lock().last().map(|(_, muted)| *muted)
    }

    pub fn detach_count(&self) -> usize {
        *self.detached.lock()
    }
}

impl MediaSink for RecordingSink {
    fn attach(&self, stream: &MediaStream, muted: bool) {
        let ids = stream.tracks().iter().map(|t| t.id().to_string()).collect();
        self.attached.lock().push((ids, muted));
    }

    fn detach(&self) {
        *self.detached.lock() += 1;
    }
}

/// Signaling channel driven by hand from the test.
pub struct ManualSignaling {
    tx: broadcast::Sender<SignalMessage>,
    sent: Mutex<Vec<SignalMessage>>,
    failing_sends: Mutex<u32>,
}

impl ManualSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx: broadcast::channel(64).0,
            sent: Mutex::new(Vec::new()),
            failing_sends: Mutex::new(0),
        })
    }

    /// The next `count` sends fail as if the relay were down.
    pub fn fail_next_sends(&self, count: u32) {
        *self.failing_sends.lock() = count;
    }

    pub fn inject(&self, message: SignalMessage) {
        let _ = self.tx.send(message);
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for ManualSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        {
            let mut failing = self.failing_sends.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(CallError::SignalingUnavailable("relay down".into()));
            }
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct OfferGate {
    offerers: Vec<String>,
    held: Vec<(RelayEndpoint, SignalMessage)>,
}

/// Loopback relay that holds offers back until two peers have each sent
/// one, so the offers cross on the wire.
pub struct CrossingOffers {
    relay: LoopbackRelay,
    gate: Arc<Mutex<OfferGate>>,
}

impl CrossingOffers {
    pub fn new() -> Self {
        Self {
            relay: LoopbackRelay::new(),
            gate: Arc::default(),
        }
    }

    pub fn endpoint(&self, peer_id: &str) -> Arc<CrossingEndpoint> {
        Arc::new(CrossingEndpoint {
            inner: self.relay.endpoint(peer_id),
            gate: Arc::clone(&self.gate),
        })
    }
}

pub struct CrossingEndpoint {
    inner: RelayEndpoint,
    gate: Arc<Mutex<OfferGate>>,
}

#[async_trait]
impl SignalingChannel for CrossingEndpoint {
    async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        if matches!(message, SignalMessage::Offer { .. }) {
            let released = {
                let mut gate = self.gate.lock();
                let id = self.inner.peer_id().to_string();
                if !gate.offerers.contains(&id) {
                    gate.offerers.push(id);
                }
                if gate.offerers.len() < 2 {
                    gate.held.push((self.inner.clone(), message));
                    return Ok(());
                }
                std::mem::take(&mut gate.held)
            };
            for (endpoint, held) in released {
                endpoint.send(held).await?;
            }
        }
        self.inner.send(message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inner.subscribe()
    }
}

/// Waits for the first event matching `pred`, failing the test after a
/// generous timeout.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    let found = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for call event")
}

/// Polls `cond` until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
