use thiserror::Error;

use crate::peer::types::TrackKind;

/// Failures of local capture. All of them are fatal for the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera or microphone access was denied")]
    PermissionDenied,
    #[error("no {0} input device found")]
    DeviceMissing(TrackKind),
    #[error("media capture is not supported on this platform")]
    PlatformUnsupported,
    #[error("media acquisition timed out")]
    Timeout,
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),
    /// Resolved internally by the negotiation rules; never surfaced to the host.
    #[error("negotiation collision")]
    NegotiationCollision,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },
    #[error("track transform failed: {0}")]
    TransformFailed(String),
    #[error("ice configuration unavailable: {0}")]
    IceConfig(String),
    #[error("peer connection error: {0}")]
    Native(String),
}

impl CallError {
    /// Fatal errors end the call and are shown to the user.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::Media(_) | CallError::ConnectionFailed { .. })
    }

    /// Retryable errors feed the backoff loop while the call is not established.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::SignalingUnavailable(_) | CallError::Negotiation(_) | CallError::Native(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            CallError::Media(MediaError::PermissionDenied) => {
                "Failed to access camera or microphone. Please check your permissions.".into()
            }
            CallError::Media(MediaError::DeviceMissing(kind)) => {
                format!("No {kind} device was found. Connect one and try again.")
            }
            CallError::Media(MediaError::PlatformUnsupported) => {
                "This device does not support video calls.".into()
            }
            CallError::Media(_) => "Could not start your camera or microphone.".into(),
            CallError::ConnectionFailed { .. } => {
                "Failed to establish connection after multiple attempts.".into()
            }
            CallError::SignalingUnavailable(_) | CallError::Native(_) | CallError::Negotiation(_) => {
                "Reconnecting...".into()
            }
            other => other.to_string(),
        }
    }
}
