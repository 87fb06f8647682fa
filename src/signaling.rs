//! Relay-facing side of the call.
//!
//! The relay itself lives elsewhere; this module fixes the wire messages,
//! the [`SignalingChannel`] seam a relay client implements, and the
//! session-scoped [`SignalingAdapter`] the engine talks through. There is no
//! process-wide connection: every session gets its own adapter and its
//! subscriptions end with it.
//!
//! [`LoopbackRelay`] is an in-process relay with the same contract, used for
//! local two-party runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::CallError;
use crate::peer::types::{IceCandidateInit, IceServerSet, SessionDescription};
use crate::session::Session;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event")]
pub enum SignalMessage {
    #[serde(rename = "offer")]
    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    #[serde(rename = "answer")]
    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        candidate: IceCandidateInit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    #[serde(rename = "joinRoom")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leaveRoom")]
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "requestTurnCredentials")]
    RequestTurnCredentials,
    #[serde(rename = "turnCredentials")]
    TurnCredentials { servers: IceServerSet },
    #[serde(rename = "partnerLeft")]
    PartnerLeft,
}

impl SignalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::JoinRoom { .. } => "joinRoom",
            SignalMessage::LeaveRoom { .. } => "leaveRoom",
            SignalMessage::RequestTurnCredentials => "requestTurnCredentials",
            SignalMessage::TurnCredentials { .. } => "turnCredentials",
            SignalMessage::PartnerLeft => "partnerLeft",
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => to.as_deref(),
            _ => None,
        }
    }

    /// Stamps the sender on peer-to-peer messages.
    pub fn with_sender(mut self, id: &str) -> Self {
        match &mut self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => *from = Some(id.to_string()),
            _ => {}
        }
        self
    }
}

/// Connection to a signaling relay.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), CallError>;

    /// Inbound messages from the moment of subscription on.
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;
}

/// Session-scoped handle over a [`SignalingChannel`].
#[derive(Clone)]
pub struct SignalingAdapter {
    channel: Arc<dyn SignalingChannel>,
    room_id: String,
    local_id: String,
}

impl SignalingAdapter {
    pub fn new(channel: Arc<dyn SignalingChannel>, session: &Session) -> Self {
        Self {
            channel,
            room_id: session.room_id().to_string(),
            local_id: session.local_id().to_string(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Some(self.channel.subscribe()),
            local_id: self.local_id.clone(),
        }
    }

    async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        let message = message.with_sender(&self.local_id);
        trace!(event = message.name(), room = %self.room_id, "signal out");
        self.channel.send(message).await
    }

    pub async fn join_room(&self) -> Result<(), CallError> {
        self.send(SignalMessage::JoinRoom {
            room_id: self.room_id.clone(),
        })
        .await
    }

    pub async fn leave_room(&self) -> Result<(), CallError> {
        self.send(SignalMessage::LeaveRoom {
            room_id: self.room_id.clone(),
        })
        .await
    }

    pub async fn send_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        self.send(SignalMessage::Offer {
            offer,
            to: Some(self.room_id.clone()),
            from: None,
        })
        .await
    }

    /// Answers go back to whoever sent the offer, or to the room.
    pub async fn send_answer(
        &self,
        answer: SessionDescription,
        to: Option<String>,
    ) -> Result<(), CallError> {
        self.send(SignalMessage::Answer {
            answer,
            to: Some(to.unwrap_or_else(|| self.room_id.clone())),
            from: None,
        })
        .await
    }

    pub async fn send_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        self.send(SignalMessage::IceCandidate {
            candidate,
            to: Some(self.room_id.clone()),
            from: None,
        })
        .await
    }

    pub async fn request_turn_credentials(&self) -> Result<(), CallError> {
        self.send(SignalMessage::RequestTurnCredentials).await
    }
}

/// Inbound message stream; dropping or unsubscribing detaches it.
pub struct Subscription {
    rx: Option<broadcast::Receiver<SignalMessage>>,
    local_id: String,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Next message not sent by this side. `None` once the channel closed
    /// or the subscription was released. Lagging is logged and skipped.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            match self.next().await {
                Ok(message) => return message,
                Err(err) => warn!(error = %err, "signaling subscriber lagged"),
            }
        }
    }

    /// Like [`recv`](Self::recv), but reports messages lost to lagging as
    /// [`CallError::SignalingUnavailable`]. The subscription stays usable.
    pub async fn next(&mut self) -> Result<Option<SignalMessage>, CallError> {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return Ok(None);
            };
            match rx.recv().await {
                Ok(message) => {
                    if message.sender() == Some(self.local_id.as_str()) {
                        continue;
                    }
                    return Ok(Some(message));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(CallError::SignalingUnavailable(format!(
                        "missed {skipped} signaling messages"
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Returns true if this call released the subscription.
    pub fn unsubscribe(&mut self) -> bool {
        self.rx.take().is_some()
    }
}

const RELAY_CAPACITY: usize = 256;

#[derive(Default)]
struct RelayState {
    peers: HashMap<String, broadcast::Sender<SignalMessage>>,
    rooms: HashMap<String, Vec<String>>,
    // messages for rooms nobody else has joined yet
    backlog: HashMap<String, Vec<(String, SignalMessage)>>,
}

/// In-process relay for any number of two-party rooms.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
    turn_servers: Option<IceServerSet>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `requestTurnCredentials` with `servers`.
    pub fn with_turn_servers(mut self, servers: IceServerSet) -> Self {
        self.turn_servers = Some(servers);
        self
    }

    pub fn endpoint(&self, peer_id: impl Into<String>) -> RelayEndpoint {
        let peer_id = peer_id.into();
        let tx = self
            .state
            .lock()
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| broadcast::channel(RELAY_CAPACITY).0)
            .clone();
        RelayEndpoint {
            relay: self.clone(),
            peer_id,
            tx,
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    fn deliver(state: &RelayState, peer_id: &str, message: SignalMessage) {
        if let Some(tx) = state.peers.get(peer_id) {
            let _ = tx.send(message);
        }
    }

    fn handle(&self, sender: &str, message: SignalMessage) {
        let mut state = self.state.lock();
        match message {
            SignalMessage::JoinRoom { room_id } => {
                let members = state.rooms.entry(room_id.clone()).or_default();
                if !members.iter().any(|m| m == sender) {
                    members.push(sender.to_string());
                }
                let pending = state.backlog.remove(&room_id).unwrap_or_default();
                let mut kept = Vec::new();
                for (from, message) in pending {
                    if from == sender {
                        kept.push((from, message));
                    } else {
                        Self::deliver(&state, sender, message);
                    }
                }
                if !kept.is_empty() {
                    state.backlog.insert(room_id.clone(), kept);
                }
                debug!(room = %room_id, peer = sender, "joined room");
            }
            SignalMessage::LeaveRoom { room_id } => {
                let remaining = match state.rooms.get_mut(&room_id) {
                    Some(members) => {
                        members.retain(|m| m != sender);
                        members.clone()
                    }
                    None => Vec::new(),
                };
                state.backlog.remove(&room_id);
                for peer in remaining {
                    Self::deliver(&state, &peer, SignalMessage::PartnerLeft);
                }
                debug!(room = %room_id, peer = sender, "left room");
            }
            SignalMessage::RequestTurnCredentials => {
                if let Some(servers) = self.turn_servers.clone() {
                    Self::deliver(&state, sender, SignalMessage::TurnCredentials { servers });
                }
            }
            SignalMessage::TurnCredentials { .. } | SignalMessage::PartnerLeft => {
                trace!(peer = sender, "relay ignores server-only event from client");
            }
            message => {
                let target = message.recipient().unwrap_or_default().to_string();
                if target != sender && state.peers.contains_key(&target) {
                    Self::deliver(&state, &target, message);
                    return;
                }
                let others: Vec<String> = state
                    .rooms
                    .get(&target)
                    .map(|members| members.iter().filter(|m| *m != sender).cloned().collect())
                    .unwrap_or_default();
                if others.is_empty() {
                    state
                        .backlog
                        .entry(target)
                        .or_default()
                        .push((sender.to_string(), message));
                } else {
                    for peer in others {
                        Self::deliver(&state, &peer, message.clone());
                    }
                }
            }
        }
    }
}

/// One participant's connection to a [`LoopbackRelay`].
#[derive(Clone)]
pub struct RelayEndpoint {
    relay: LoopbackRelay,
    peer_id: String,
    tx: broadcast::Sender<SignalMessage>,
}

impl RelayEndpoint {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        self.relay.handle(&self.peer_id, message.with_sender(&self.peer_id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_to(room: &str) -> SignalMessage {
        SignalMessage::Offer {
            offer: SessionDescription::offer("v=0"),
            to: Some(room.into()),
            from: None,
        }
    }

    #[test]
    fn wire_names_match_relay_events() {
        let value = serde_json::to_value(SignalMessage::IceCandidate {
            candidate: IceCandidateInit::new("candidate:1"),
            to: Some("room".into()),
            from: None,
        })
        .unwrap();
        assert_eq!(value["event"], "ice-candidate");
        assert_eq!(value["to"], "room");
        assert!(value.get("from").is_none());

        let join = serde_json::to_value(SignalMessage::JoinRoom {
            room_id: "r1".into(),
        })
        .unwrap();
        assert_eq!(join, serde_json::json!({"event": "joinRoom", "roomId": "r1"}));

        let parsed: SignalMessage = serde_json::from_str(r#"{"event":"partnerLeft"}"#).unwrap();
        assert_eq!(parsed, SignalMessage::PartnerLeft);
    }

    #[tokio::test]
    async fn relay_buffers_until_partner_joins() {
        let relay = LoopbackRelay::new();
        let a = relay.endpoint("a");
        let b = relay.endpoint("b");
        let mut b_rx = b.subscribe();

        a.send(SignalMessage::JoinRoom { room_id: "r".into() }).await.unwrap();
        a.send(offer_to("r")).await.unwrap();
        assert!(b_rx.try_recv().is_err());

        b.send(SignalMessage::JoinRoom { room_id: "r".into() }).await.unwrap();
        let delivered = b_rx.recv().await.unwrap();
        assert_eq!(delivered.sender(), Some("a"));
        assert_eq!(relay.members("r"), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn leaving_notifies_the_partner() {
        let relay = LoopbackRelay::new();
        let a = relay.endpoint("a");
        let b = relay.endpoint("b");
        let mut a_rx = a.subscribe();
        for endpoint in [&a, &b] {
            endpoint
                .send(SignalMessage::JoinRoom { room_id: "r".into() })
                .await
                .unwrap();
        }
        b.send(SignalMessage::LeaveRoom { room_id: "r".into() }).await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), SignalMessage::PartnerLeft);
    }

    #[tokio::test]
    async fn subscription_skips_own_messages_and_unsubscribes_once() {
        let relay = LoopbackRelay::new();
        let endpoint = relay.endpoint("me");
        let session = Session::new("r", true).with_local_id("me");
        let adapter = SignalingAdapter::new(Arc::new(endpoint.clone()), &session);
        let mut sub = adapter.subscribe();

        let tx = endpoint.tx.clone();
        tx.send(offer_to("r").with_sender("me")).unwrap();
        tx.send(offer_to("r").with_sender("other")).unwrap();
        assert_eq!(sub.recv().await.unwrap().sender(), Some("other"));

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagging_behind_is_reported_then_recovers() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription {
            rx: Some(rx),
            local_id: "me".into(),
        };
        for _ in 0..4 {
            tx.send(offer_to("r").with_sender("other")).unwrap();
        }
        assert!(matches!(
            sub.next().await,
            Err(CallError::SignalingUnavailable(_))
        ));
        assert!(sub.next().await.unwrap().is_some());

        for _ in 0..4 {
            tx.send(offer_to("r").with_sender("other")).unwrap();
        }
        // the lenient reader skips the gap
        assert!(sub.recv().await.is_some());
    }
}
