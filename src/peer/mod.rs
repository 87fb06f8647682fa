//! The native peer connection behind a trait, plus everything the engine
//! layers on top of it.
//!
//! Callbacks from the native object never touch engine state directly. They
//! become [`PeerEvent`]s tagged with the generation of the handle that owns
//! the connection, so events from a replaced connection can be recognized and
//! dropped.

pub mod connection;
pub mod handle;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::media::TrackRef;
use types::{IceCandidateInit, IceServerSet, PeerState, SessionDescription, SignalingState};

pub use handle::ConnectionHandle;
pub use negotiation::{NegotiationEvent, NegotiationFlags, Negotiator};
pub use state::{CallPhase, RetryDecision, RetryPolicy, RetryState};

/// Callback output of a native peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A trickled local candidate, ready to forward.
    IceCandidate(IceCandidateInit),
    NegotiationNeeded,
    StateChanged(PeerState),
    Track(TrackRef),
}

/// Where a connection reports its events, stamped with its generation.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &TrackRef) -> Result<(), CallError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    /// Drops the in-flight local offer and applies `offer` as one step.
    async fn rollback_and_apply(&self, offer: SessionDescription) -> Result<(), CallError> {
        self.set_local_description(SessionDescription::rollback())
            .await?;
        self.set_remote_description(offer).await
    }

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerState;

    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Builds a fresh connection. `servers` is handed over as-is and not
    /// touched afterwards.
    async fn create(
        &self,
        servers: &IceServerSet,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}
