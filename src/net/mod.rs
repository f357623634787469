//! Moving protocol messages between the members of a keep.
//!
//! A [`Transport`] only knows about sessions and opaque payloads; the
//! [`bridge`] module puts protocol messages into envelopes and drives a
//! protocol over a transport.
use std::fmt;

use async_trait::async_trait;
use smol::channel::Receiver;

use crate::{chain::Address, protocol::Participant};

pub mod bridge;
pub mod local;

/// Identifies one run of a protocol among the members of a keep.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn announcement(keep: Address) -> Self {
        Self(format!("{keep}/announce"))
    }

    pub fn key_generation(keep: Address) -> Self {
        Self(format!("{keep}/keygen"))
    }

    pub fn signing(keep: Address, digest: &[u8; 32]) -> Self {
        Self(format!("{keep}/sign/{}", hex::encode(digest)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents an error raised by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to subscribe to session {0}: {1}")]
    Subscribe(SessionId, String),
    #[error("failed to deliver message in session {0}: {1}")]
    Delivery(SessionId, String),
    #[error("subscription to session {0} ended")]
    SubscriptionClosed(SessionId),
}

/// Delivery of opaque payloads to the members of a session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a payload to every subscriber of a session.
    async fn broadcast(&self, session: &SessionId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Deliver a payload to one participant of a session.
    async fn unicast(
        &self,
        session: &SessionId,
        to: Participant,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Receive the payloads of a session meant for a participant.
    ///
    /// Dropping the receiver releases the subscription.
    async fn subscribe(
        &self,
        session: &SessionId,
        me: Participant,
    ) -> Result<Receiver<Vec<u8>>, TransportError>;
}
