pub mod cleanup;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::EngineConfig;
pub use controller::{start_call, CallDeps, CallHandle};
pub use error::{CallError, MediaError};
pub use events::{CallEvent, CallOutcome};
pub use peer::connection::RtcPeerFactory;
pub use peer::CallPhase;
pub use session::{NegotiationRole, Session};
pub use signaling::{LoopbackRelay, SignalMessage, SignalingChannel};
