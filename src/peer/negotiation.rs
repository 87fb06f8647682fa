//! Perfect negotiation.
//!
//! Both sides may offer at any time. When offers cross, the impolite side
//! (the initiator) drops the incoming one and the polite side rolls its own
//! offer back and answers instead. Flag updates go through [`reduce`] so every
//! transition is visible in one place.

use tracing::{debug, trace};

use crate::error::CallError;
use crate::peer::types::{IceCandidateInit, SessionDescription, SignalingState};
use crate::peer::PeerConnection;
use crate::session::NegotiationRole;
use crate::signaling::SignalingAdapter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    pub making_offer: bool,
    pub ignore_offer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    OfferStarted,
    /// Runs whether or not the offer made it out.
    OfferFinished,
    OfferReceived { signaling_state: SignalingState },
    Reset,
}

pub fn is_collision(flags: NegotiationFlags, signaling_state: SignalingState) -> bool {
    flags.making_offer || signaling_state != SignalingState::Stable
}

pub fn reduce(
    flags: NegotiationFlags,
    role: NegotiationRole,
    event: NegotiationEvent,
) -> NegotiationFlags {
    match event {
        NegotiationEvent::OfferStarted => NegotiationFlags {
            making_offer: true,
            ..flags
        },
        NegotiationEvent::OfferFinished => NegotiationFlags {
            making_offer: false,
            ..flags
        },
        // recomputed on every offer, never carried over
        NegotiationEvent::OfferReceived { signaling_state } => NegotiationFlags {
            ignore_offer: role == NegotiationRole::Impolite
                && is_collision(flags, signaling_state),
            ..flags
        },
        NegotiationEvent::Reset => NegotiationFlags::default(),
    }
}

/// Drives offers and answers for whichever connection it is handed.
///
/// Owns only the flags; the connection itself belongs to the caller.
pub struct Negotiator {
    role: NegotiationRole,
    flags: NegotiationFlags,
    signaling: SignalingAdapter,
}

impl Negotiator {
    pub fn new(role: NegotiationRole, signaling: SignalingAdapter) -> Self {
        Self {
            role,
            flags: NegotiationFlags::default(),
            signaling,
        }
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn flags(&self) -> NegotiationFlags {
        self.flags
    }

    pub fn dispatch(&mut self, event: NegotiationEvent) {
        let next = reduce(self.flags, self.role, event);
        if next != self.flags {
            trace!(?event, ?next, "negotiation flags");
        }
        self.flags = next;
    }

    /// Must be called whenever the connection is replaced.
    pub fn reset(&mut self) {
        self.dispatch(NegotiationEvent::Reset);
    }

    /// Creates, applies and sends a local offer. Returns false when an
    /// exchange is already under way and no offer was made.
    pub async fn make_offer(
        &mut self,
        pc: &dyn PeerConnection,
        ice_restart: bool,
    ) -> Result<bool, CallError> {
        let state = pc.signaling_state();
        if !ice_restart && state != SignalingState::Stable {
            debug!(?state, "skipping offer, exchange in progress");
            return Ok(false);
        }

        self.dispatch(NegotiationEvent::OfferStarted);
        let result = self.send_offer(pc, ice_restart).await;
        self.dispatch(NegotiationEvent::OfferFinished);
        result.map(|()| true)
    }

    async fn send_offer(&self, pc: &dyn PeerConnection, ice_restart: bool) -> Result<(), CallError> {
        let offer = pc.create_offer(ice_restart).await?;
        pc.set_local_description(offer).await?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| CallError::Negotiation("local offer missing after apply".into()))?;
        debug!(ice_restart, "sending offer");
        self.signaling.send_offer(local).await
    }

    /// Applies a remote offer and answers the sender.
    ///
    /// Fails with [`CallError::NegotiationCollision`] when the offer was
    /// dropped under the glare rule; callers treat that as resolved.
    pub async fn handle_offer(
        &mut self,
        pc: &dyn PeerConnection,
        offer: SessionDescription,
        from: Option<String>,
    ) -> Result<(), CallError> {
        let signaling_state = pc.signaling_state();
        let collision = is_collision(self.flags, signaling_state);
        self.dispatch(NegotiationEvent::OfferReceived { signaling_state });
        if self.flags.ignore_offer {
            debug!(?signaling_state, "impolite side ignoring colliding offer");
            return Err(CallError::NegotiationCollision);
        }

        if collision {
            debug!(?signaling_state, "polite side rolling back for remote offer");
            pc.rollback_and_apply(offer).await?;
        } else {
            pc.set_remote_description(offer).await?;
        }

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer).await?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| CallError::Negotiation("local answer missing after apply".into()))?;
        self.signaling.send_answer(local, from).await
    }

    pub async fn handle_answer(
        &mut self,
        pc: &dyn PeerConnection,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        pc.set_remote_description(answer).await
    }

    /// Errors for candidates belonging to an ignored offer are swallowed.
    pub async fn handle_candidate(
        &self,
        pc: &dyn PeerConnection,
        candidate: IceCandidateInit,
    ) -> Result<(), CallError> {
        match pc.add_ice_candidate(candidate).await {
            Err(err) if self.flags.ignore_offer => {
                trace!(error = %err, "dropping candidate of ignored offer");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn send_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        self.signaling.send_candidate(candidate).await
    }
}
