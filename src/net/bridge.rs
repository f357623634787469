//! Driving a [`Protocol`] over a [`Transport`].
//!
//! Outbound actions of the protocol are wrapped in an [`Envelope`] and handed
//! to the transport by a forwarding task, while inbound envelopes are checked
//! and fed back into the protocol. One bridge serves exactly one protocol run.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use smol::{
    channel::{self, Receiver, Sender},
    future, Task, Timer,
};
use tracing::{debug, trace, warn};

use super::{SessionId, Transport, TransportError};
use crate::{
    protocol::{Action, MessageData, Participant, Protocol, ProtocolError},
    serde::{decode, encode},
};

/// A protocol message, along with its routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    from: Participant,
    /// `None` for a message meant for everyone.
    to: Option<Participant>,
    payload: MessageData,
}

/// Represents an error which can happen when executing a protocol over a bridge.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start protocol: {0}")]
    Start(#[source] ProtocolError),
    #[error("protocol failed: {0}")]
    Protocol(#[source] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("network bridge closed before the protocol completed")]
    BridgeClosed,
    #[error("protocol did not complete within {0:?}")]
    Timeout(Duration),
}

/// Connects one participant of one protocol run to the transport.
pub struct NetworkBridge {
    session: SessionId,
    outbound: Sender<(Option<Participant>, MessageData)>,
    inbound: Receiver<(Participant, MessageData)>,
    failures: Receiver<TransportError>,
    /// Closed to stop the forwarding task without flushing.
    abort: Sender<()>,
    forwarder: Task<()>,
}

struct Forwarder {
    transport: Arc<dyn Transport>,
    session: SessionId,
    me: Participant,
    participants: Vec<Participant>,
    subscription: Receiver<Vec<u8>>,
    outbound: Receiver<(Option<Participant>, MessageData)>,
    inbound: Sender<(Participant, MessageData)>,
    failures: Sender<TransportError>,
    abort: Receiver<()>,
}

enum Event {
    Abort,
    Outbound(Option<(Option<Participant>, MessageData)>),
    Inbound(Option<Vec<u8>>),
}

impl Forwarder {
    async fn run(self) {
        loop {
            let event = future::or(
                async {
                    let _ = self.abort.recv().await;
                    Event::Abort
                },
                future::or(
                    async { Event::Outbound(self.outbound.recv().await.ok()) },
                    async { Event::Inbound(self.subscription.recv().await.ok()) },
                ),
            )
            .await;

            match event {
                Event::Abort => return,
                // Everything queued has been sent, and the protocol is done.
                Event::Outbound(None) => return,
                Event::Outbound(Some((to, payload))) => {
                    if let Err(e) = self.send(to, payload).await {
                        let _ = self.failures.send(e).await;
                        return;
                    }
                }
                Event::Inbound(None) => {
                    let _ = self
                        .failures
                        .send(TransportError::SubscriptionClosed(self.session.clone()))
                        .await;
                    return;
                }
                Event::Inbound(Some(data)) => self.receive(&data).await,
            }
        }
    }

    async fn send(
        &self,
        to: Option<Participant>,
        payload: MessageData,
    ) -> Result<(), TransportError> {
        let envelope = Envelope {
            from: self.me,
            to,
            payload,
        };
        let data = encode(&envelope);
        match to {
            None => self.transport.broadcast(&self.session, data).await,
            Some(to) => self.transport.unicast(&self.session, to, data).await,
        }
    }

    async fn receive(&self, data: &[u8]) {
        let envelope: Envelope = match decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session = %self.session, error = %e, "dropping malformed message");
                return;
            }
        };
        if envelope.from == self.me {
            trace!(session = %self.session, "ignoring our own message");
            return;
        }
        if envelope.to.map_or(false, |to| to != self.me) {
            debug!(
                session = %self.session,
                from = %envelope.from,
                "dropping message addressed to another participant"
            );
            return;
        }
        if !self.participants.contains(&envelope.from) {
            warn!(
                session = %self.session,
                from = %envelope.from,
                "dropping message from unknown participant"
            );
            return;
        }
        // The protocol may already be done, in which case nobody listens.
        let _ = self.inbound.send((envelope.from, envelope.payload)).await;
    }
}

impl NetworkBridge {
    /// Subscribe to a session, and start forwarding messages for it.
    ///
    /// Messages for the session are buffered from this point on, even before
    /// a protocol is executed over the bridge.
    pub async fn attach(
        transport: Arc<dyn Transport>,
        session: SessionId,
        me: Participant,
        participants: &[Participant],
    ) -> Result<Self, TransportError> {
        let subscription = transport.subscribe(&session, me).await?;
        let (outbound_tx, outbound_rx) = channel::unbounded();
        let (inbound_tx, inbound_rx) = channel::unbounded();
        let (failures_tx, failures_rx) = channel::bounded(1);
        let (abort_tx, abort_rx) = channel::bounded(1);

        let forwarder = Forwarder {
            transport,
            session: session.clone(),
            me,
            participants: participants.to_vec(),
            subscription,
            outbound: outbound_rx,
            inbound: inbound_tx,
            failures: failures_tx,
            abort: abort_rx,
        };
        let forwarder = smol::spawn(forwarder.run());

        Ok(Self {
            session,
            outbound: outbound_tx,
            inbound: inbound_rx,
            failures: failures_rx,
            abort: abort_tx,
            forwarder,
        })
    }

    fn queue(&self, to: Option<Participant>, data: MessageData) -> Result<(), ExecutionError> {
        self.outbound
            .try_send((to, data))
            .map_err(|_| ExecutionError::BridgeClosed)
    }

    async fn next_message(&self) -> Result<(Participant, MessageData), ExecutionError> {
        future::or(
            async {
                match self.failures.recv().await {
                    Ok(e) => Err(ExecutionError::Transport(e)),
                    Err(_) => Err(ExecutionError::BridgeClosed),
                }
            },
            async {
                self.inbound
                    .recv()
                    .await
                    .map_err(|_| ExecutionError::BridgeClosed)
            },
        )
        .await
    }

    async fn drive<T>(&self, protocol: &mut impl Protocol<Output = T>) -> Result<T, ExecutionError> {
        let mut started = false;
        loop {
            loop {
                let action = protocol.poke().map_err(|e| {
                    if started {
                        ExecutionError::Protocol(e)
                    } else {
                        ExecutionError::Start(e)
                    }
                })?;
                started = true;
                match action {
                    Action::Wait => break,
                    Action::SendMany(data) => self.queue(None, data)?,
                    Action::SendPrivate(to, data) => self.queue(Some(to), data)?,
                    Action::Return(out) => return Ok(out),
                }
            }
            let (from, data) = self.next_message().await?;
            protocol.message(from, data);
        }
    }

    /// Run a protocol to completion over this bridge.
    ///
    /// On success, the messages still queued are delivered before returning.
    /// On failure, including running out of time, forwarding stops at once.
    /// Either way the transport subscription is released.
    pub async fn execute<T>(
        self,
        mut protocol: impl Protocol<Output = T>,
        timeout: Duration,
    ) -> Result<T, ExecutionError> {
        let result = future::or(self.drive(&mut protocol), async {
            Timer::after(timeout).await;
            Err(ExecutionError::Timeout(timeout))
        })
        .await;

        match &result {
            Ok(_) => self.outbound.close(),
            Err(e) => {
                debug!(session = %self.session, error = %e, "aborting message forwarding");
                self.abort.close()
            }
        };
        self.forwarder.await;
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        net::local::LocalNetwork,
        protocol::{
            internal::{Communication, Executor},
            InitializationError,
        },
    };

    /// Everyone sends their number to everyone, and sums what they get.
    fn sum_protocol(
        participants: Vec<Participant>,
        me: Participant,
    ) -> Result<impl Protocol<Output = u32> + Send, InitializationError> {
        let comms = Communication::new(1, participants.len());
        let inner = comms.clone();
        let fut = async move {
            inner.send_many(0, &u32::from(me)).await;
            let mut total = u32::from(me);
            for _ in 1..participants.len() {
                let (_, x): (_, u32) = inner.recv(0).await?;
                total += x;
            }
            Ok::<_, ProtocolError>(total)
        };
        Ok(Executor::new(comms, fut))
    }

    #[test]
    fn test_execute_over_local_network() {
        let network = Arc::new(LocalNetwork::new());
        let session = SessionId::new("sum");
        let participants: Vec<Participant> = (0u32..3).map(Participant::from).collect();

        let results = smol::block_on(async {
            let mut tasks = Vec::new();
            for p in participants.clone() {
                let transport: Arc<dyn Transport> = network.clone();
                let bridge = NetworkBridge::attach(transport, session.clone(), p, &participants)
                    .await
                    .unwrap();
                let protocol = sum_protocol(participants.clone(), p).unwrap();
                tasks.push(smol::spawn(
                    bridge.execute(protocol, Duration::from_secs(10)),
                ));
            }
            let mut results = Vec::new();
            for task in tasks {
                results.push(task.await.unwrap());
            }
            results
        });

        assert_eq!(results, vec![3, 3, 3]);
        assert_eq!(network.subscribers(&session), 0);
    }

    #[test]
    fn test_execute_times_out_without_peers() {
        let network = Arc::new(LocalNetwork::new());
        let participants: Vec<Participant> = (0u32..2).map(Participant::from).collect();
        let me = participants[0];

        let result = smol::block_on(async {
            let bridge =
                NetworkBridge::attach(network.clone(), SessionId::new("lonely"), me, &participants)
                    .await
                    .unwrap();
            let protocol = sum_protocol(participants.clone(), me).unwrap();
            bridge.execute(protocol, Duration::from_millis(50)).await
        });
        assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    }

    #[test]
    fn test_delivery_failure_ends_execution() {
        let network = Arc::new(LocalNetwork::new());
        let participants: Vec<Participant> = (0u32..2).map(Participant::from).collect();
        let me = participants[0];
        network.fail_delivery(true);

        let result = smol::block_on(async {
            let bridge =
                NetworkBridge::attach(network.clone(), SessionId::new("broken"), me, &participants)
                    .await
                    .unwrap();
            let protocol = sum_protocol(participants.clone(), me).unwrap();
            bridge.execute(protocol, Duration::from_secs(10)).await
        });
        assert!(matches!(result, Err(ExecutionError::Transport(_))));
    }

    #[test]
    fn test_bad_messages_are_dropped() {
        let network = Arc::new(LocalNetwork::new());
        let session = SessionId::new("noisy");
        let participants: Vec<Participant> = (0u32..2).map(Participant::from).collect();

        let result = smol::block_on(async {
            let bridge =
                NetworkBridge::attach(network.clone(), session.clone(), participants[0], &participants)
                    .await
                    .unwrap();

            // Garbage, a stranger, and a message for someone else, before the real one.
            network.broadcast(&session, vec![0xc1, 0xff]).await.unwrap();
            let stranger = Envelope {
                from: Participant::from(7u32),
                to: None,
                payload: crate::serde::encode_with_tag(0, &100u32),
            };
            network.broadcast(&session, encode(&stranger)).await.unwrap();
            let misrouted = Envelope {
                from: participants[1],
                to: Some(Participant::from(5u32)),
                payload: crate::serde::encode_with_tag(0, &100u32),
            };
            network.broadcast(&session, encode(&misrouted)).await.unwrap();
            let real = Envelope {
                from: participants[1],
                to: None,
                payload: crate::serde::encode_with_tag(0, &1u32),
            };
            network.broadcast(&session, encode(&real)).await.unwrap();

            let protocol = sum_protocol(participants.clone(), participants[0]).unwrap();
            bridge.execute(protocol, Duration::from_secs(10)).await
        });
        assert_eq!(result.unwrap(), 1);
    }
}
