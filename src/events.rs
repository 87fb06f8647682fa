use tokio::sync::broadcast;
use tracing::debug;

use crate::error::CallError;
use crate::peer::state::CallPhase;
use crate::peer::types::TrackKind;

/// How a call ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Local user pressed leave.
    Left,
    PartnerLeft,
    /// Native connection reported `closed`.
    Closed,
    TimeLimitReached,
    /// Every `CallHandle` was dropped.
    Unmounted,
}

/// Notifications for the hosting UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Phase(CallPhase),
    /// Transient indicator while a retry is pending.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// ICE lost connectivity; may self-recover.
    ConnectionProblem,
    Connected,
    RemoteTrack(TrackKind),
    /// Local and remote streams both carry enabled audio and video.
    MediaEstablished,
    PartnerLeft,
    TimeLimitReached,
    /// Fatal error with its user-facing message.
    Failed { error: CallError, message: String },
    Ended(CallOutcome),
}

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        debug!(?event, "emit");
        // nobody listening is fine
        let _ = self.tx.send(event);
    }

    pub fn emit_phase(&self, phase: CallPhase) {
        self.emit(CallEvent::Phase(phase));
    }

    pub fn emit_reconnecting(&self, attempt: u32, max_attempts: u32) {
        self.emit(CallEvent::Reconnecting {
            attempt,
            max_attempts,
        });
    }

    pub fn emit_connection_problem(&self) {
        self.emit(CallEvent::ConnectionProblem);
    }

    pub fn emit_connected(&self) {
        self.emit(CallEvent::Connected);
    }

    pub fn emit_remote_track(&self, kind: TrackKind) {
        self.emit(CallEvent::RemoteTrack(kind));
    }

    pub fn emit_media_established(&self) {
        self.emit(CallEvent::MediaEstablished);
    }

    pub fn emit_partner_left(&self) {
        self.emit(CallEvent::PartnerLeft);
    }

    pub fn emit_time_limit(&self) {
        self.emit(CallEvent::TimeLimitReached);
    }

    pub fn emit_failed(&self, error: &CallError) {
        self.emit(CallEvent::Failed {
            message: error.user_message(),
            error: error.clone(),
        });
    }

    pub fn emit_ended(&self, outcome: CallOutcome) {
        self.emit(CallEvent::Ended(outcome));
    }
}
