use std::{
    error,
    future::Future,
    pin::Pin,
    ptr,
    sync::Arc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::serde::{decode, encode_with_tag};

use super::{Action, MessageData, Participant, Protocol, ProtocolError};

/// Identifies the round a message belongs to.
///
/// This is written as the first byte of every message.
pub type Round = u8;

/// Represents a queue of messages.
///
/// Incoming messages are sorted into one bin per round as they arrive,
/// so that a protocol can read the round it is waiting on even if messages
/// for later rounds show up first.
#[derive(Debug)]
struct MessageQueue {
    stacks: Vec<Vec<(Participant, MessageData)>>,
}

impl MessageQueue {
    /// Create a new message queue, given a number of rounds.
    ///
    /// The number of parties is only a hint used to pre-allocate buffers.
    fn new(rounds: usize, parties_hint: usize) -> Self {
        Self {
            stacks: vec![Vec::with_capacity(parties_hint.saturating_sub(1)); rounds],
        }
    }

    /// Push a new message into the queue.
    ///
    /// Empty messages, and messages tagged with a round this protocol doesn't
    /// have, are dropped.
    fn push(&mut self, from: Participant, message: MessageData) {
        let Some(&round) = message.first() else {
            return;
        };
        if let Some(stack) = self.stacks.get_mut(usize::from(round)) {
            stack.push((from, message));
        }
    }

    fn pop(&mut self, round: usize) -> Option<(Participant, MessageData)> {
        self.stacks.get_mut(round).and_then(|stack| stack.pop())
    }
}

/// A future which tries to read a message from a specific round.
struct MessageQueueWait {
    queue: Arc<Mutex<MessageQueue>>,
    round: usize,
}

impl Future for MessageQueueWait {
    type Output = (Participant, MessageData);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.queue.lock().pop(self.round) {
            Some(out) => Poll::Ready(out),
            None => Poll::Pending,
        }
    }
}

/// The kinds of messages a participant can send.
#[derive(Debug, Clone)]
enum Message {
    Many(MessageData),
    Private(Participant, MessageData),
}

/// A single item queue, used to hand outgoing messages to the executor.
type Mailbox = Arc<Mutex<Option<Message>>>;

/// A future used to wait until the mailbox is empty, and then fill it.
struct MailboxWait {
    mailbox: Mailbox,
    /// This will always be some, but we need to be able to take it.
    message: Option<Message>,
}

impl Future for MailboxWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut slot = this.mailbox.lock();
        if slot.is_some() {
            return Poll::Pending;
        }
        *slot = this.message.take();
        Poll::Ready(())
    }
}

/// Represents the communications between the executor and the participant.
///
/// The participant reads messages from the queue, possibly waiting until a
/// message for the round it is interested in arrives, and pushes outgoing
/// messages into a mailbox for the executor to pick up.
#[derive(Debug, Clone)]
pub struct Communication {
    queue: Arc<Mutex<MessageQueue>>,
    mailbox: Mailbox,
}

impl Communication {
    /// Create new communications, given a number of rounds, and parties.
    ///
    /// Messages tagged with a round beyond the number of rounds are dropped,
    /// so the count has to match what the protocol uses.
    pub fn new(rounds: usize, parties_hint: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(MessageQueue::new(rounds, parties_hint))),
            mailbox: Arc::new(Mutex::new(None)),
        }
    }

    fn push_message(&self, from: Participant, message: MessageData) {
        self.queue.lock().push(from, message);
    }

    fn outgoing(&self) -> Option<Message> {
        self.mailbox.lock().take()
    }

    async fn send_raw(&self, message: Message) {
        MailboxWait {
            mailbox: self.mailbox.clone(),
            message: Some(message),
        }
        .await;
    }

    /// (Indicate that you want to) send a message to everybody else.
    pub async fn send_many<T: Serialize>(&self, round: Round, data: &T) {
        self.send_raw(Message::Many(encode_with_tag(round, data)))
            .await;
    }

    /// (Indicate that you want to) send a message privately to one participant.
    pub async fn send_private<T: Serialize>(&self, round: Round, to: Participant, data: &T) {
        self.send_raw(Message::Private(to, encode_with_tag(round, data)))
            .await;
    }

    /// Receive a message for a specific round.
    pub async fn recv<T: DeserializeOwned>(
        &self,
        round: Round,
    ) -> Result<(Participant, T), ProtocolError> {
        let (from, data) = MessageQueueWait {
            queue: self.queue.clone(),
            round: usize::from(round),
        }
        .await;
        // The queue only accepts messages with at least the tag byte.
        let decoded: Result<T, Box<dyn error::Error + Send + Sync>> =
            decode(&data[1..]).map_err(|e| e.into());
        Ok((from, decoded?))
    }
}

fn dummy_raw_waker() -> RawWaker {
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        dummy_raw_waker()
    }

    let vtable = &RawWakerVTable::new(clone, no_op, no_op, no_op);
    RawWaker::new(ptr::null(), vtable)
}

/// A waker which does nothing.
///
/// Our futures never register wakers, progress only happens on poke.
fn dummy_waker() -> Waker {
    unsafe { Waker::from_raw(dummy_raw_waker()) }
}

/// An executor which implements our protocol trait.
///
/// It is given a copy of the communications infrastructure, and a future
/// using that same infrastructure. Poking the executor polls the future once
/// and reports whatever it left in the mailbox.
pub struct Executor<F, O> {
    comms: Communication,
    fut: Pin<Box<F>>,
    output: Option<O>,
    done: bool,
}

impl<O, F: Future<Output = Result<O, ProtocolError>>> Executor<F, O> {
    pub fn new(comms: Communication, fut: F) -> Self {
        Self {
            comms,
            fut: Box::pin(fut),
            output: None,
            done: false,
        }
    }

    fn take_output(&mut self) -> Option<O> {
        let out = self.output.take();
        if out.is_some() {
            self.done = true;
        }
        out
    }

    fn run(&mut self) -> Result<Action<O>, ProtocolError> {
        if self.done {
            return Ok(Action::Wait);
        }
        if let Some(out) = self.take_output() {
            return Ok(Action::Return(out));
        }

        let waker = dummy_waker();
        let mut ctx = Context::from_waker(&waker);
        if let Poll::Ready(out) = self.fut.as_mut().poll(&mut ctx) {
            match out {
                Ok(out) => self.output = Some(out),
                Err(e) => {
                    // A finished future must never be polled again.
                    self.done = true;
                    return Err(e);
                }
            }
        }

        match self.comms.outgoing() {
            Some(Message::Many(m)) => Ok(Action::SendMany(m)),
            Some(Message::Private(to, m)) => Ok(Action::SendPrivate(to, m)),
            None => match self.take_output() {
                Some(out) => Ok(Action::Return(out)),
                None => Ok(Action::Wait),
            },
        }
    }
}

impl<O, F: Future<Output = Result<O, ProtocolError>>> Protocol for Executor<F, O> {
    type Output = O;

    fn poke(&mut self) -> Result<Action<Self::Output>, ProtocolError> {
        self.run()
    }

    fn message(&mut self, from: Participant, data: MessageData) {
        self.comms.push_message(from, data);
    }
}
