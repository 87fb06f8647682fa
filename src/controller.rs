//! Connection lifecycle.
//!
//! A call runs as a single task that owns every piece of mutable state: the
//! connection handle, retry bookkeeping, negotiation flags and the pending
//! queues. Slow work (media capture, ICE resolution, timers) runs in spawned
//! tasks that report back through one input queue, and native callbacks
//! arrive tagged with the generation of the handle that produced them. The
//! host only sees a [`CallHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::cleanup::{CallResources, TaskKind};
use crate::config::EngineConfig;
use crate::error::{CallError, MediaError};
use crate::events::{CallEvent, CallOutcome, EventEmitter};
use crate::media::transform::{apply_transform, TrackTransform};
use crate::media::{
    check_stream_status, CaptureDevices, MediaConstraints, MediaManager, MediaSink, MediaStream,
    TrackRef,
};
use crate::peer::ice::{CredentialSource, IceResolver, PendingCandidates};
use crate::peer::types::{IceServerSet, PeerState, SignalingState};
use crate::peer::{
    CallPhase, ConnectionHandle, Negotiator, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, RetryDecision, RetryPolicy, RetryState,
};
use crate::session::{NegotiationRole, Session};
use crate::signaling::{SignalMessage, SignalingAdapter, SignalingChannel, Subscription};

/// Collaborators a call needs from its host.
pub struct CallDeps {
    pub devices: Arc<dyn CaptureDevices>,
    pub constraints: MediaConstraints,
    pub preview: Option<Arc<dyn MediaSink>>,
    pub remote_view: Option<Arc<dyn MediaSink>>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    /// Overrides the HTTP endpoint from the config.
    pub credentials: Option<Arc<dyn CredentialSource>>,
    pub transform: Option<Arc<dyn TrackTransform>>,
}

impl CallDeps {
    pub fn new(
        devices: Arc<dyn CaptureDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            devices,
            constraints: MediaConstraints::default(),
            preview: None,
            remote_view: None,
            factory,
            signaling,
            credentials: None,
            transform: None,
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_preview(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    pub fn with_remote_view(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.remote_view = Some(sink);
        self
    }

    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn TrackTransform>) -> Self {
        self.transform = Some(transform);
        self
    }
}

#[derive(Debug)]
enum Command {
    Leave,
}

type CallResult = Result<CallOutcome, CallError>;

/// Host-side control of a running call. Clones share the call; once every
/// clone is dropped the call is torn down as unmounted.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventEmitter,
    phase: watch::Receiver<CallPhase>,
    result: watch::Receiver<Option<CallResult>>,
}

impl CallHandle {
    pub fn leave(&self) {
        if self.commands.send(Command::Leave).is_err() {
            debug!("leave requested after the call ended");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        *self.phase.borrow()
    }

    /// Resolves once the call has ended and its resources are released.
    pub async fn wait(&self) -> CallResult {
        let mut result = self.result.clone();
        loop {
            if let Some(outcome) = result.borrow_and_update().clone() {
                return outcome;
            }
            if result.changed().await.is_err() {
                return result
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| Err(CallError::Native("call task stopped".into())));
            }
        }
    }
}

/// Starts a call on the current tokio runtime.
pub fn start_call(session: Session, config: EngineConfig, deps: CallDeps) -> CallHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(CallPhase::Idle);
    let (result_tx, result_rx) = watch::channel(None);
    let events = EventEmitter::new();

    let signaling = SignalingAdapter::new(deps.signaling.clone(), &session);
    let engine = CallEngine {
        negotiator: Negotiator::new(session.role(), signaling.clone()),
        resolver: IceResolver::from_config(&config, deps.credentials.clone()),
        policy: RetryPolicy::new(config.retry_base_delay, config.max_retries),
        retry: RetryState::default(),
        phase: CallPhase::Idle,
        phase_tx,
        result_tx,
        events: events.clone(),
        signaling,
        resources: CallResources::default(),
        pending_candidates: PendingCandidates::default(),
        early_descriptions: VecDeque::new(),
        generation: 0,
        joined: false,
        setup_in_flight: false,
        media_established: false,
        finished: false,
        inputs_tx,
        peer_tx,
        session,
        config,
        deps,
    };
    tokio::spawn(engine.run(commands_rx, inputs_rx, peer_rx));

    CallHandle {
        commands: commands_tx,
        events,
        phase: phase_rx,
        result: result_rx,
    }
}

#[derive(Debug)]
enum Input {
    MediaReady(Result<MediaStream, MediaError>),
    IceReady { generation: u64, servers: IceServerSet },
    RetryDue,
    EstablishTimeout { generation: u64 },
    TimeLimit,
}

struct CallEngine {
    session: Session,
    config: EngineConfig,
    deps: CallDeps,
    negotiator: Negotiator,
    resolver: IceResolver,
    policy: RetryPolicy,
    retry: RetryState,
    phase: CallPhase,
    phase_tx: watch::Sender<CallPhase>,
    result_tx: watch::Sender<Option<CallResult>>,
    events: EventEmitter,
    signaling: SignalingAdapter,
    resources: CallResources,
    pending_candidates: PendingCandidates,
    // offers that arrived while no handle existed
    early_descriptions: VecDeque<SignalMessage>,
    generation: u64,
    joined: bool,
    setup_in_flight: bool,
    media_established: bool,
    finished: bool,
    inputs_tx: mpsc::UnboundedSender<Input>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

async fn next_signal(
    subscription: &mut Option<Subscription>,
) -> Result<Option<SignalMessage>, CallError> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

impl CallEngine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut peer_events: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    ) {
        info!(
            room = %self.session.room_id(),
            role = ?self.session.role(),
            peer = %self.session.peer_alias(),
            "call starting"
        );
        self.start().await;

        while !self.finished {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave) => self.finish(CallOutcome::Left).await,
                    None => self.finish(CallOutcome::Unmounted).await,
                },
                Some(input) = inputs.recv() => self.on_input(input).await,
                Some((generation, event)) = peer_events.recv() => {
                    self.on_peer_event(generation, event).await
                }
                message = next_signal(&mut self.resources.subscription) => match message {
                    Ok(Some(message)) => self.on_signal(message).await,
                    Ok(None) => {
                        warn!(room = %self.session.room_id(), "signaling channel closed");
                        self.resources.subscription = None;
                    }
                    Err(err) => self.on_signaling_lost(err).await,
                },
            }
        }

        // a capture that finished after teardown still holds devices
        inputs.close();
        while let Ok(input) = inputs.try_recv() {
            if let Input::MediaReady(Ok(mut stream)) = input {
                let stopped = stream.stop_all();
                debug!(stopped, "released late media capture");
            }
        }
    }

    async fn start(&mut self) {
        self.resources.subscription = Some(self.signaling.subscribe());
        self.resources.transform = self.deps.transform.clone();
        if let Some(preview) = self.deps.preview.clone() {
            self.resources.add_sink(preview);
        }

        if let Some(limit) = self.config.call_time_limit {
            let tx = self.inputs_tx.clone();
            self.resources.tasks.schedule(
                TaskKind::CallTimeLimit,
                tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    let _ = tx.send(Input::TimeLimit);
                }),
            );
        }
        self.join_and_acquire().await;
    }

    /// Joins the room, then starts capturing. A failed join goes through the
    /// same backoff as a failed connection attempt.
    async fn join_and_acquire(&mut self) {
        if let Err(err) = self.signaling.join_room().await {
            warn!(room = %self.session.room_id(), error = %err, "could not join room");
            self.retry.begin_first_attempt();
            self.on_attempt_failed(err).await;
            return;
        }
        self.joined = true;

        self.set_phase(CallPhase::AcquiringMedia);
        let mut media = MediaManager::new(self.deps.devices.clone(), self.config.media_timeout)
            .with_permission_probe(self.config.permission_probe);
        if let Some(preview) = self.deps.preview.clone() {
            media = media.with_preview(preview);
        }
        let constraints = self.deps.constraints.clone();
        let tx = self.inputs_tx.clone();
        self.resources.tasks.schedule(
            TaskKind::MediaAcquisition,
            tokio::spawn(async move {
                let result = media.acquire(&constraints).await;
                let _ = tx.send(Input::MediaReady(result));
            }),
        );
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.phase == phase {
            return;
        }
        debug!(from = ?self.phase, to = ?phase, "call phase");
        self.phase = phase;
        self.phase_tx.send_replace(phase);
        self.events.emit_phase(phase);
    }

    fn current_pc(&self) -> Option<Arc<dyn PeerConnection>> {
        self.resources.handle.as_ref().map(ConnectionHandle::pc)
    }

    async fn on_input(&mut self, input: Input) {
        match input {
            Input::MediaReady(Ok(stream)) => {
                self.resources.tasks.cancel(TaskKind::MediaAcquisition);
                self.resources.local_stream = Some(stream);
                self.retry.begin_first_attempt();
                self.begin_attempt();
            }
            Input::MediaReady(Err(err)) => {
                error!(error = %err, "media acquisition failed");
                self.fail(err.into()).await;
            }
            Input::IceReady {
                generation,
                servers,
            } => self.on_ice_ready(generation, servers).await,
            Input::RetryDue => {
                self.resources.tasks.cancel(TaskKind::Retry);
                self.retry.retry_started();
                info!(attempt = self.retry.attempt_count, "retrying call setup");
                if self.joined {
                    self.begin_attempt();
                } else {
                    self.join_and_acquire().await;
                }
            }
            Input::EstablishTimeout { generation } => {
                let current = self.resources.handle.as_ref().map(|h| h.generation());
                if current == Some(generation) && !self.retry.established {
                    warn!(generation, timeout = ?self.config.connect_timeout, "connection not established in time");
                    self.on_attempt_failed(CallError::Native(
                        "connection establishment timed out".into(),
                    ))
                    .await;
                }
            }
            Input::TimeLimit => {
                info!("call time limit reached");
                self.events.emit_time_limit();
                self.finish(CallOutcome::TimeLimitReached).await;
            }
        }
    }

    /// Starts resolving ICE servers for a new handle, unless a setup is
    /// already running or a live handle exists.
    fn begin_attempt(&mut self) {
        if self.finished {
            return;
        }
        if self.setup_in_flight || self.resources.handle.is_some() {
            debug!(generation = self.generation, "setup already in progress, ignoring");
            return;
        }
        self.setup_in_flight = true;
        self.generation += 1;
        self.set_phase(CallPhase::AwaitingIceConfig);

        let generation = self.generation;
        let resolver = self.resolver.clone();
        let tx = self.inputs_tx.clone();
        self.resources.tasks.schedule(
            TaskKind::IceResolve,
            tokio::spawn(async move {
                let servers = resolver.resolve().await;
                let _ = tx.send(Input::IceReady {
                    generation,
                    servers,
                });
            }),
        );
    }

    async fn on_ice_ready(&mut self, generation: u64, servers: IceServerSet) {
        if generation != self.generation || !self.setup_in_flight || self.resources.handle.is_some()
        {
            debug!(generation, current = self.generation, "stale ice configuration ignored");
            return;
        }
        self.resources.tasks.cancel(TaskKind::IceResolve);
        self.set_phase(CallPhase::Connecting);
        self.negotiator.reset();

        let Some(local) = self.resources.local_stream.as_ref() else {
            self.setup_in_flight = false;
            warn!("no local media for connection setup");
            return;
        };
        let sink = PeerEventSink::new(generation, self.peer_tx.clone());
        let opened = ConnectionHandle::open(
            generation,
            self.deps.factory.as_ref(),
            &servers,
            sink,
            local,
        )
        .await;
        self.setup_in_flight = false;

        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                warn!(generation, error = %err, "could not build peer connection");
                self.on_attempt_failed(err).await;
                return;
            }
        };
        info!(
            generation,
            attempt = self.retry.attempt_count,
            relay = servers.has_relay(),
            "peer connection ready"
        );
        self.resources.handle = Some(handle);

        let tx = self.inputs_tx.clone();
        let timeout = self.config.connect_timeout;
        self.resources.tasks.schedule(
            TaskKind::EstablishTimeout,
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Input::EstablishTimeout { generation });
            }),
        );

        let early: Vec<_> = self.early_descriptions.drain(..).collect();
        for message in early {
            self.on_signal(message).await;
        }
        self.flush_candidates().await;
    }

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        let current = self.resources.handle.as_ref().map(|h| h.generation());
        if current != Some(generation) {
            trace!(generation, ?current, "event from superseded connection");
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(err) = self.negotiator.send_candidate(candidate).await {
                    warn!(error = %err, "could not forward local candidate");
                }
            }
            PeerEvent::NegotiationNeeded => self.make_offer(false).await,
            PeerEvent::StateChanged(state) => self.on_peer_state(state).await,
            PeerEvent::Track(track) => self.on_remote_track(track),
        }
    }

    async fn make_offer(&mut self, ice_restart: bool) {
        let Some(pc) = self.current_pc() else {
            return;
        };
        if self.phase != CallPhase::Connected {
            self.set_phase(CallPhase::Negotiating);
        }
        match self.negotiator.make_offer(pc.as_ref(), ice_restart).await {
            Ok(sent) => debug!(sent, ice_restart, "local negotiation handled"),
            Err(err) => self.on_negotiation_error(err).await,
        }
    }

    async fn on_peer_state(&mut self, state: PeerState) {
        match state {
            PeerState::New | PeerState::Connecting => {
                debug!(?state, "peer connection progressing");
            }
            PeerState::Connected => {
                self.retry.on_connected();
                self.resources.tasks.cancel(TaskKind::Retry);
                self.resources.tasks.cancel(TaskKind::EstablishTimeout);
                self.set_phase(CallPhase::Connected);
                self.events.emit_connected();
                info!(room = %self.session.room_id(), "call connected");
            }
            PeerState::Disconnected => {
                warn!("peer connection disconnected, waiting for ICE to recover");
                self.events.emit_connection_problem();
                // only one side restarts, the partner answers
                if self.config.ice_restart_on_disconnect
                    && self.negotiator.role() == NegotiationRole::Impolite
                {
                    self.make_offer(true).await;
                }
            }
            PeerState::Failed => {
                self.on_attempt_failed(CallError::Native("peer connection failed".into()))
                    .await;
            }
            PeerState::Closed => {
                info!("peer connection closed by the native side");
                self.finish(CallOutcome::Closed).await;
            }
        }
    }

    fn on_remote_track(&mut self, track: TrackRef) {
        let kind = track.kind();
        let track = apply_transform(self.resources.transform.as_deref(), track);
        let Some(handle) = self.resources.handle.as_mut() else {
            return;
        };
        let remote = handle.add_remote_track(track);
        if let Some(view) = self.deps.remote_view.clone() {
            view.attach(remote, false);
            self.resources.add_sink(view);
        }
        self.events.emit_remote_track(kind);

        let remote = self.resources.handle.as_ref().and_then(|h| h.remote_stream());
        if !self.media_established
            && check_stream_status(self.resources.local_stream.as_ref(), remote)
        {
            self.media_established = true;
            self.events.emit_media_established();
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Offer { offer, from, .. } => {
                let Some(pc) = self.current_pc() else {
                    debug!("offer before connection, buffering");
                    self.early_descriptions.push_back(SignalMessage::Offer {
                        offer,
                        to: None,
                        from,
                    });
                    return;
                };
                match self.negotiator.handle_offer(pc.as_ref(), offer, from).await {
                    Ok(()) => {
                        self.mark_stable();
                        self.flush_candidates().await;
                    }
                    Err(CallError::NegotiationCollision) => {
                        debug!("colliding offer resolved by role");
                    }
                    Err(err) => self.on_negotiation_error(err).await,
                }
            }
            SignalMessage::Answer { answer, .. } => {
                // an answer only fits the offer of the connection that sent it
                let Some(pc) = self.current_pc() else {
                    debug!("answer without a connection dropped");
                    return;
                };
                let state = pc.signaling_state();
                if state != SignalingState::HaveLocalOffer {
                    debug!(?state, "answer without a pending local offer dropped");
                    return;
                }
                match self.negotiator.handle_answer(pc.as_ref(), answer).await {
                    Ok(()) => {
                        self.mark_stable();
                        self.flush_candidates().await;
                    }
                    Err(err) => self.on_negotiation_error(err).await,
                }
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                let pc = self.current_pc();
                let ready = match &pc {
                    Some(pc) => pc.has_remote_description().await,
                    None => false,
                };
                let pc = match pc {
                    Some(pc) if ready => pc,
                    _ => {
                        trace!(queued = self.pending_candidates.len() + 1, "queueing remote candidate");
                        self.pending_candidates.push(candidate);
                        return;
                    }
                };
                if let Err(err) = self.negotiator.handle_candidate(pc.as_ref(), candidate).await {
                    warn!(error = %err, "failed to add remote candidate");
                }
            }
            SignalMessage::PartnerLeft => {
                info!(room = %self.session.room_id(), "partner left");
                self.events.emit_partner_left();
                self.finish(CallOutcome::PartnerLeft).await;
            }
            other => trace!(event = other.name(), "signal not handled by the call"),
        }
    }

    fn mark_stable(&mut self) {
        if self.phase != CallPhase::Connected {
            self.set_phase(CallPhase::Stable);
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(pc) = self.current_pc() else {
            return;
        };
        if self.pending_candidates.is_empty() || !pc.has_remote_description().await {
            return;
        }
        let queued = self.pending_candidates.drain();
        debug!(count = queued.len(), "applying queued remote candidates");
        for candidate in queued {
            if let Err(err) = self.negotiator.handle_candidate(pc.as_ref(), candidate).await {
                warn!(error = %err, "failed to apply queued candidate");
            }
        }
    }

    async fn on_negotiation_error(&mut self, err: CallError) {
        warn!(error = %err, "negotiation step failed");
        if err.is_retryable() && !self.retry.established {
            self.on_attempt_failed(err).await;
        }
    }

    /// Inbound signaling was lost. Before the call is established the
    /// exchange cannot be trusted any more, so the attempt starts over.
    async fn on_signaling_lost(&mut self, err: CallError) {
        if self.retry.established {
            warn!(error = %err, "signaling messages lost after the call was established");
            return;
        }
        warn!(error = %err, "signaling messages lost during setup");
        self.on_attempt_failed(err).await;
    }

    async fn on_attempt_failed(&mut self, err: CallError) {
        if self.finished {
            return;
        }
        if err.is_fatal() {
            self.fail(err).await;
            return;
        }
        if self.retry.established {
            warn!(error = %err, "failure after the call was established, not retrying");
            return;
        }

        self.resources.tasks.cancel(TaskKind::EstablishTimeout);
        self.resources.tasks.cancel(TaskKind::IceResolve);
        self.setup_in_flight = false;
        self.resources.close_handle().await;
        self.pending_candidates.clear();
        self.early_descriptions.clear();
        self.negotiator.reset();

        match self.retry.on_failure(&self.policy) {
            RetryDecision::Ignore => debug!("retry already scheduled"),
            RetryDecision::Schedule { attempt, delay } => {
                warn!(attempt, max = self.policy.max_attempts, ?delay, error = %err, "call setup failed, retrying");
                self.events
                    .emit_reconnecting(attempt, self.policy.max_attempts);
                self.schedule_retry(delay);
            }
            RetryDecision::GiveUp { attempts } => {
                error!(attempts, error = %err, "call setup failed, giving up");
                self.fail(CallError::ConnectionFailed { attempts }).await;
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let tx = self.inputs_tx.clone();
        self.resources.tasks.schedule(
            TaskKind::Retry,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Input::RetryDue);
            }),
        );
    }

    async fn teardown(&mut self) {
        if let Err(err) = self.signaling.leave_room().await {
            warn!(error = %err, "could not leave room");
        }
        self.resources.release().await;
        self.pending_candidates.clear();
        self.early_descriptions.clear();
        self.finished = true;
    }

    async fn finish(&mut self, outcome: CallOutcome) {
        if self.finished {
            return;
        }
        info!(?outcome, room = %self.session.room_id(), "call ended");
        self.teardown().await;
        self.set_phase(CallPhase::Closed);
        self.events.emit_ended(outcome);
        self.result_tx.send_replace(Some(Ok(outcome)));
    }

    async fn fail(&mut self, err: CallError) {
        if self.finished {
            return;
        }
        self.events.emit_failed(&err);
        self.teardown().await;
        self.set_phase(CallPhase::Failed);
        self.result_tx.send_replace(Some(Err(err)));
    }
}
