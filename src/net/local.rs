//! An in-memory transport.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};

use super::{SessionId, Transport, TransportError};
use crate::protocol::Participant;

#[derive(Default)]
struct Session {
    subscribers: Vec<(Participant, Sender<Vec<u8>>)>,
    /// Everything sent so far, replayed to late subscribers.
    backlog: Vec<(Option<Participant>, Vec<u8>)>,
    held: Option<Vec<(Option<Participant>, Vec<u8>)>>,
}

impl Session {
    fn deliver(&mut self, to: Option<Participant>, payload: Vec<u8>) {
        if let Some(held) = &mut self.held {
            held.push((to, payload));
            return;
        }
        self.subscribers.retain(|(p, sender)| {
            if to.map_or(false, |to| to != *p) {
                return true;
            }
            !sender.is_closed() && sender.try_send(payload.clone()).is_ok()
        });
        self.backlog.push((to, payload));
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    fail_delivery: bool,
}

/// A hub connecting every node of a local deployment.
///
/// Sessions are created on first use. Payloads sent before a participant
/// subscribes are kept, so that members starting a session at slightly
/// different times still see each other's messages.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<State>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail, or work again.
    pub fn fail_delivery(&self, fail: bool) {
        self.state.lock().fail_delivery = fail;
    }

    /// Keep the payloads sent on a session from anyone, until released.
    pub fn hold(&self, session: &SessionId) {
        let mut state = self.state.lock();
        let session = state.sessions.entry(session.clone()).or_default();
        session.held.get_or_insert_with(Vec::new);
    }

    /// Deliver every payload held back on a session, and stop holding.
    pub fn release(&self, session: &SessionId) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(session) else {
            return;
        };
        for (to, payload) in session.held.take().unwrap_or_default() {
            session.deliver(to, payload);
        }
    }

    /// The number of live subscriptions to a session.
    pub fn subscribers(&self, session: &SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(session)
            .map(|s| s.subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or_default()
    }

    fn send(
        &self,
        session: &SessionId,
        to: Option<Participant>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_delivery {
            return Err(TransportError::Delivery(
                session.clone(),
                "network unreachable".to_string(),
            ));
        }
        state
            .sessions
            .entry(session.clone())
            .or_default()
            .deliver(to, payload);
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn broadcast(&self, session: &SessionId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(session, None, payload)
    }

    async fn unicast(
        &self,
        session: &SessionId,
        to: Participant,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.send(session, Some(to), payload)
    }

    async fn subscribe(
        &self,
        session: &SessionId,
        me: Participant,
    ) -> Result<Receiver<Vec<u8>>, TransportError> {
        let (sender, receiver) = channel::unbounded();
        let mut state = self.state.lock();
        let session = state.sessions.entry(session.clone()).or_default();
        for (to, payload) in &session.backlog {
            if to.map_or(true, |to| to == me) {
                // The receiver is alive and unbounded, so this can't fail.
                let _ = sender.try_send(payload.clone());
            }
        }
        session.subscribers.push((me, sender));
        Ok(receiver)
    }
}
