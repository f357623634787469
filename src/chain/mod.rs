//! The interface this client needs from the host chain.
//!
//! Everything the client observes (keeps being created, signatures being
//! requested, keeps being closed, new blocks) arrives through a
//! [`Subscription`] or a block feed, and everything it does on-chain goes
//! through a [`ChainHandle`]. An in-memory implementation lives in [`local`].
use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use smol::channel::Receiver;

use crate::ecdsa::{PublicKey, Signature};

pub mod local;

/// An account or contract address on the host chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Represents an error when parsing an [Address].
#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 20 bytes, found {0}")]
    Length(usize),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits)?;
        let bytes: [u8; 20] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressParseError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Emitted when a new keep is opened, and its members selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepCreatedEvent {
    pub keep_address: Address,
    /// Operators of the keep, in on-chain order.
    pub members: Vec<Address>,
}

impl KeepCreatedEvent {
    pub fn is_member(&self, operator: Address) -> bool {
        self.members.contains(&operator)
    }
}

/// Emitted by a keep when the owner asks for a digest to be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureRequestedEvent {
    pub digest: [u8; 32],
}

/// Emitted by a keep once it has been closed, and its key is no longer needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepClosedEvent {
    pub keep_address: Address,
}

/// Represents an error returned by the chain.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("unknown keep {0}")]
    UnknownKeep(Address),
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// A stream of chain events, which can be cancelled.
///
/// Dropping a subscription also cancels it.
pub struct Subscription<T> {
    events: Receiver<T>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(events: Receiver<T>, unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription has been cancelled.
    pub async fn next(&mut self) -> Option<T> {
        self.events.recv().await.ok()
    }

    /// Stop receiving events. Calling this more than once does nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            self.events.close();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Tracks the height of the chain.
#[async_trait]
pub trait BlockCounter: Send + Sync {
    /// Get a feed of new block heights.
    ///
    /// The feed stops once the receiver is dropped.
    fn watch_blocks(&self) -> Receiver<u64>;

    async fn current_block(&self) -> Result<u64, ChainError>;

    /// Wait until the chain reaches at least a given height.
    async fn wait_for_block_height(&self, height: u64) -> Result<(), ChainError>;
}

/// A connection to the chain, acting on behalf of one operator.
#[async_trait]
pub trait ChainHandle: Send + Sync {
    /// The address of the operator this handle acts for.
    fn address(&self) -> Address;

    fn block_counter(&self) -> Arc<dyn BlockCounter>;

    async fn on_keep_created(&self) -> Result<Subscription<KeepCreatedEvent>, ChainError>;

    async fn on_signature_requested(
        &self,
        keep: Address,
    ) -> Result<Subscription<SignatureRequestedEvent>, ChainError>;

    async fn on_keep_closed(&self, keep: Address)
        -> Result<Subscription<KeepClosedEvent>, ChainError>;

    async fn is_active(&self, keep: Address) -> Result<bool, ChainError>;

    async fn is_member(&self, keep: Address, operator: Address) -> Result<bool, ChainError>;

    async fn submit_keep_public_key(
        &self,
        keep: Address,
        public_key: &PublicKey,
    ) -> Result<(), ChainError>;

    async fn submit_signature(&self, keep: Address, signature: &Signature)
        -> Result<(), ChainError>;

    async fn is_registered_for_application(&self, application: Address)
        -> Result<bool, ChainError>;

    async fn is_eligible_for_application(&self, application: Address) -> Result<bool, ChainError>;

    async fn register_as_member_candidate(&self, application: Address) -> Result<(), ChainError>;

    async fn is_status_up_to_date_for_application(
        &self,
        application: Address,
    ) -> Result<bool, ChainError>;

    async fn update_status_for_application(&self, application: Address)
        -> Result<(), ChainError>;
}
