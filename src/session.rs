use chrono::{DateTime, Utc};

use crate::utils::random_id;

/// Perfect-negotiation role, derived from `is_initiator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Backs off during glare by rolling back its own offer.
    Polite,
    /// Wins every glare; incoming colliding offers are dropped.
    Impolite,
}

/// One logical two-party call.
///
/// `is_initiator` is agreed out-of-band (normally by the lobby that paired the
/// two participants) and never changes, so the negotiation role is stable for
/// the whole session.
#[derive(Debug, Clone)]
pub struct Session {
    room_id: String,
    is_initiator: bool,
    peer_alias: String,
    local_id: String,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(room_id: impl Into<String>, is_initiator: bool) -> Self {
        Self {
            room_id: room_id.into(),
            is_initiator,
            peer_alias: "Anonymous".into(),
            local_id: random_id(),
            created_at: Utc::now(),
        }
    }

    pub fn with_peer_alias(mut self, alias: impl Into<String>) -> Self {
        self.peer_alias = alias.into();
        self
    }

    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = id.into();
        self
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn peer_alias(&self) -> &str {
        &self.peer_alias
    }

    /// Identifier this side uses as `from` on the relay.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn role(&self) -> NegotiationRole {
        if self.is_initiator {
            NegotiationRole::Impolite
        } else {
            NegotiationRole::Polite
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_is_impolite() {
        let a = Session::new("room", true);
        let b = Session::new("room", false);
        assert_eq!(a.role(), NegotiationRole::Impolite);
        assert_eq!(b.role(), NegotiationRole::Polite);
        assert_ne!(a.local_id(), b.local_id());
        assert_eq!(b.peer_alias(), "Anonymous");
    }
}
