//! This module provides abstractions for working with protocols.
//!
//! Every multi-party computation in this crate (presence announcement, key
//! generation, signing) is exposed as a [`Protocol`]: a value representing one
//! party, advanced by handing it messages from the other parties and by poking
//! it for the next thing it wants done. Rounds and message serialization stay
//! internal to each protocol, so the code moving bytes around (see
//! [`crate::net::bridge`]) never needs to know which protocol it is driving.
use core::fmt;
use std::{collections::HashMap, error};

use k256::Scalar;
use serde::{Deserialize, Serialize};

pub(crate) mod internal;

/// Represents an error which can happen when running a protocol.
#[derive(Debug)]
pub enum ProtocolError {
    /// Some assertion in the protocol failed.
    AssertionFailed(String),
    /// The protocol cannot make progress with the messages it was given.
    Stalled,
    /// Some generic error happened.
    Other(Box<dyn error::Error + Send + Sync>),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Other(e) => write!(f, "{}", e),
            ProtocolError::Stalled => write!(f, "protocol stalled waiting for messages"),
            ProtocolError::AssertionFailed(e) => write!(f, "assertion failed {}", e),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<Box<dyn error::Error + Send + Sync>> for ProtocolError {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Other(e)
    }
}

/// Represents an error which can happen when *initializing* a protocol.
///
/// These are related to bad parameters for the protocol, and things like that.
#[derive(Debug)]
pub enum InitializationError {
    BadParameters(String),
}

impl fmt::Display for InitializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitializationError::BadParameters(s) => write!(f, "bad parameters: {}", s),
        }
    }
}

impl error::Error for InitializationError {}

/// Represents a participant in the protocol.
///
/// Inside a keep, a participant is identified by the position of its operator
/// in the keep's on-chain member list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Participant(u32);

impl Participant {
    pub const fn new(x: u32) -> Self {
        Self(x)
    }

    /// Return this participant as little endian bytes.
    pub fn bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Return the scalar associated with this participant.
    ///
    /// This is never zero, so it can be used as an evaluation point for shares.
    pub fn scalar(&self) -> Scalar {
        Scalar::from(self.0 as u64 + 1)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Participant> for u32 {
    fn from(p: Participant) -> Self {
        p.0
    }
}

impl From<u32> for Participant {
    fn from(x: u32) -> Self {
        Participant(x)
    }
}

/// Represents the data making up a message.
///
/// Messages are opaque vectors of bytes, with all the serialization logic
/// handled internally.
pub type MessageData = Vec<u8>;

/// Represents an action by a participant in the protocol.
///
/// The basic flow is that each participant receives messages from other participants,
/// and then reacts with some kind of action.
///
/// Eventually, the participant returns a value, ending the protocol.
#[derive(Debug, Clone)]
pub enum Action<T> {
    /// Don't do anything.
    Wait,
    /// Send a message to all other participants.
    ///
    /// Participants *never* sends messages to themselves.
    SendMany(MessageData),
    /// Send a private message to another participant.
    SendPrivate(Participant, MessageData),
    /// End the protocol by returning a value.
    Return(T),
}

/// A trait for protocols.
///
/// This represents the behavior of a single participant in a protocol.
/// The computation of that participant is driven by receiving messages
/// from other participants.
pub trait Protocol {
    type Output;

    /// Poke the protocol, receiving a new action.
    ///
    /// The protocol should be poked until it returns an error, or it returns
    /// an action with a return value, or it returns a wait action.
    ///
    /// Upon returning a wait action, that protocol will not advance any further
    /// until a new message arrives.
    fn poke(&mut self) -> Result<Action<Self::Output>, ProtocolError>;

    /// Inform the protocol of a new message.
    fn message(&mut self, from: Participant, data: MessageData);
}

impl<P: Protocol + ?Sized> Protocol for Box<P> {
    type Output = P::Output;

    fn poke(&mut self) -> Result<Action<Self::Output>, ProtocolError> {
        (**self).poke()
    }

    fn message(&mut self, from: Participant, data: MessageData) {
        (**self).message(from, data)
    }
}

/// Run a protocol to completion, synchronously.
///
/// This works by executing each participant in order, all in this process.
/// It backs the single-party local signer and the tests; distributed
/// deployments drive each participant through a network bridge instead.
pub fn run_protocol<T>(
    mut ps: Vec<(Participant, Box<dyn Protocol<Output = T> + Send>)>,
) -> Result<Vec<(Participant, T)>, ProtocolError> {
    let indices: HashMap<Participant, usize> =
        ps.iter().enumerate().map(|(i, (p, _))| (*p, i)).collect();

    let size = ps.len();
    let mut done = vec![false; size];
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        let mut progressed = false;
        for i in 0..size {
            if done[i] {
                continue;
            }
            loop {
                let action = ps[i].1.poke()?;
                match action {
                    Action::Wait => break,
                    Action::SendMany(m) => {
                        let from = ps[i].0;
                        for (j, (_, other)) in ps.iter_mut().enumerate() {
                            if i != j {
                                other.message(from, m.clone());
                            }
                        }
                    }
                    Action::SendPrivate(to, m) => {
                        let from = ps[i].0;
                        if let Some(&j) = indices.get(&to) {
                            ps[j].1.message(from, m);
                        }
                    }
                    Action::Return(r) => {
                        out.push((ps[i].0, r));
                        done[i] = true;
                        progressed = true;
                        break;
                    }
                }
                progressed = true;
            }
        }
        if !progressed && out.len() < size {
            return Err(ProtocolError::Stalled);
        }
    }

    Ok(out)
}
