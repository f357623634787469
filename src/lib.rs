//! A client for threshold ECDSA keeps.
//!
//! A keep is a group of operators, selected on-chain, sharing a single
//! secp256k1 key. No member ever holds the whole key: the members generate
//! it together, and every signature the keep is asked for is produced
//! together, by a threshold of them.
//!
//! The crate is organized in layers:
//!
//! - A threshold engine, in the [protocol] module, along with [keygen] and
//! [sign] built on top of it. Each protocol is a state machine, driven by
//! poking it for actions, and feeding it the messages of the other parties.
//! - A network bridge, in [net], running an engine instance over a
//! [net::Transport], for one session.
//! - The services of a member: announcing itself, generating the signer
//! of a keep, and signing with it, in [node] and [session].
//! - A [registry] of the signers held by this operator, persisted
//! through a [storage::KeyStore].
//! - The [client], reacting to chain events, and keeping this operator
//! registered with the applications it serves.
//!
//! The engine itself is a small interface:
//! ```ignore
//! pub trait Protocol {
//!    type Output;
//!
//!    fn poke(&mut self) -> Result<Action<Self::Output>, ProtocolError>;
//!    fn message(&mut self, from: Participant, data: MessageData);
//! }
//! ```
//! An action either asks for a message to be sent to everyone, or privately
//! to one party, tells us to wait for more messages, or returns the output.
//! Rounds and serialization are handled inside the protocols.
//!
//! # Signing
//!
//! Signing needs at least `2t - 1` participants for a threshold of `t`,
//! and the group policy picks `t = (n + 1) / 2` for `n` members, so every
//! member takes part. Each signature uses a fresh jointly generated nonce,
//! and no preprocessing is kept between signatures.
mod announce;
pub mod cancel;
pub mod chain;
pub mod client;
mod compat;
pub mod config;
pub mod ecdsa;
mod keygen;
mod math;
pub mod net;
pub mod node;
mod participants;
pub mod protocol;
pub mod registry;
mod serde;
pub mod session;
mod sign;
pub mod signer;
pub mod storage;
#[cfg(test)]
mod test;

pub use crate::announce::announce;
pub use crate::ecdsa::{LocalSigner, PublicKey, Signature};
pub use crate::keygen::{keygen, KeygenOutput};
pub use crate::sign::{sign, FullSignature};
