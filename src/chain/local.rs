//! An in-memory chain.
//!
//! Blocks are only produced when asked for, which lets tests (and local
//! deployments) control exactly when block driven loops advance.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use event_listener::Event;
use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};

use super::{
    Address, BlockCounter, ChainError, ChainHandle, KeepClosedEvent, KeepCreatedEvent,
    SignatureRequestedEvent, Subscription,
};
use crate::ecdsa::{PublicKey, Signature};

/// How many blocks a registration takes before the chain reports it.
const DEFAULT_CONFIRMATION_BLOCKS: u64 = 2;

type SubscriberId = u64;

/// Senders for one kind of event, with pruning of dropped receivers.
struct Subscribers<T> {
    senders: Vec<(SubscriberId, Sender<T>)>,
}

impl<T: Clone> Subscribers<T> {
    fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    fn add(&mut self, id: SubscriberId, sender: Sender<T>) {
        self.senders.push((id, sender));
    }

    fn remove(&mut self, id: SubscriberId) {
        self.senders.retain(|(x, _)| *x != id);
    }

    fn len(&self) -> usize {
        self.senders.len()
    }

    fn publish(&mut self, event: &T) {
        self.senders
            .retain(|(_, sender)| sender.try_send(event.clone()).is_ok());
    }
}

struct KeepState {
    members: Vec<Address>,
    active: bool,
    fail_activity_checks: bool,
    signature_requested: Subscribers<SignatureRequestedEvent>,
    keep_closed: Subscribers<KeepClosedEvent>,
    public_keys: Vec<(Address, PublicKey)>,
    signatures: Vec<(Address, Signature)>,
}

#[derive(Default)]
struct ApplicationState {
    /// Operator to the block at which its registration becomes visible.
    registered: HashMap<Address, u64>,
    eligible: HashSet<Address>,
    stale: HashSet<Address>,
    failing_registration: HashSet<Address>,
    register_calls: HashMap<Address, usize>,
    update_calls: HashMap<Address, usize>,
}

struct State {
    block: u64,
    confirmation_blocks: u64,
    next_subscriber: SubscriberId,
    keeps: HashMap<Address, KeepState>,
    keep_count: u64,
    keep_created: Subscribers<KeepCreatedEvent>,
    block_watchers: Vec<Sender<u64>>,
    applications: HashMap<Address, ApplicationState>,
}

impl State {
    fn subscriber_id(&mut self) -> SubscriberId {
        self.next_subscriber += 1;
        self.next_subscriber
    }

    fn keep(&mut self, keep: Address) -> Result<&mut KeepState, ChainError> {
        self.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))
    }

    fn application(&mut self, application: Address) -> &mut ApplicationState {
        self.applications.entry(application).or_default()
    }
}

/// A chain living in memory, shared by every handle connected to it.
#[derive(Clone)]
pub struct LocalChain {
    state: Arc<Mutex<State>>,
    blocks: Arc<Event>,
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChain {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                block: 0,
                confirmation_blocks: DEFAULT_CONFIRMATION_BLOCKS,
                next_subscriber: 0,
                keeps: HashMap::new(),
                keep_count: 0,
                keep_created: Subscribers::new(),
                block_watchers: Vec::new(),
                applications: HashMap::new(),
            })),
            blocks: Arc::new(Event::new()),
        }
    }

    /// Get a handle acting on behalf of an operator.
    pub fn connect(&self, operator: Address) -> LocalChainHandle {
        LocalChainHandle {
            chain: self.clone(),
            operator,
        }
    }

    /// Set how many blocks pass between a registration and its confirmation.
    pub fn set_confirmation_blocks(&self, blocks: u64) {
        self.state.lock().confirmation_blocks = blocks;
    }

    pub fn block_height(&self) -> u64 {
        self.state.lock().block
    }

    /// Produce a new block, notifying every block watcher.
    pub fn mine_block(&self) -> u64 {
        let height = {
            let mut state = self.state.lock();
            state.block += 1;
            let height = state.block;
            state
                .block_watchers
                .retain(|watcher| watcher.try_send(height).is_ok());
            height
        };
        self.blocks.notify(usize::MAX);
        height
    }

    pub fn mine_blocks(&self, count: u64) -> u64 {
        let mut height = self.block_height();
        for _ in 0..count {
            height = self.mine_block();
        }
        height
    }

    /// Open a keep with some members, without announcing it.
    pub fn open_keep(&self, members: Vec<Address>) -> Address {
        let mut state = self.state.lock();
        state.keep_count += 1;
        let mut bytes = [0u8; 20];
        bytes[0] = 0x4b;
        bytes[12..].copy_from_slice(&state.keep_count.to_be_bytes());
        let address = Address::from(bytes);
        state.keeps.insert(
            address,
            KeepState {
                members,
                active: true,
                fail_activity_checks: false,
                signature_requested: Subscribers::new(),
                keep_closed: Subscribers::new(),
                public_keys: Vec::new(),
                signatures: Vec::new(),
            },
        );
        address
    }

    /// Open a keep, and announce it to everyone watching for new keeps.
    pub fn create_keep(&self, members: Vec<Address>) -> Address {
        let keep_address = self.open_keep(members.clone());
        let event = KeepCreatedEvent {
            keep_address,
            members,
        };
        self.state.lock().keep_created.publish(&event);
        keep_address
    }

    pub fn request_signature(&self, keep: Address, digest: [u8; 32]) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let keep_state = state.keep(keep)?;
        if !keep_state.active {
            return Err(ChainError::Rejected(format!("keep {keep} is closed")));
        }
        keep_state
            .signature_requested
            .publish(&SignatureRequestedEvent { digest });
        Ok(())
    }

    pub fn close_keep(&self, keep: Address) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let keep_state = state.keep(keep)?;
        keep_state.active = false;
        keep_state.keep_closed.publish(&KeepClosedEvent { keep_address: keep });
        Ok(())
    }

    /// Make activity queries for a keep fail.
    pub fn fail_activity_checks(&self, keep: Address) -> Result<(), ChainError> {
        self.state.lock().keep(keep)?.fail_activity_checks = true;
        Ok(())
    }

    pub fn signature_subscriptions(&self, keep: Address) -> usize {
        let mut state = self.state.lock();
        state
            .keep(keep)
            .map(|k| k.signature_requested.len())
            .unwrap_or_default()
    }

    pub fn keep_closed_subscriptions(&self, keep: Address) -> usize {
        let mut state = self.state.lock();
        state
            .keep(keep)
            .map(|k| k.keep_closed.len())
            .unwrap_or_default()
    }

    pub fn submitted_public_keys(&self, keep: Address) -> Vec<(Address, PublicKey)> {
        let mut state = self.state.lock();
        state
            .keep(keep)
            .map(|k| k.public_keys.clone())
            .unwrap_or_default()
    }

    pub fn submitted_signatures(&self, keep: Address) -> Vec<(Address, Signature)> {
        let mut state = self.state.lock();
        state
            .keep(keep)
            .map(|k| k.signatures.clone())
            .unwrap_or_default()
    }

    pub fn set_eligible(&self, application: Address, operator: Address, eligible: bool) {
        let mut state = self.state.lock();
        let app = state.application(application);
        if eligible {
            app.eligible.insert(operator);
        } else {
            app.eligible.remove(&operator);
        }
    }

    /// Register an operator directly, as if it had registered in an earlier run.
    pub fn set_registered(&self, application: Address, operator: Address) {
        let mut state = self.state.lock();
        let block = state.block;
        state.application(application).registered.insert(operator, block);
    }

    pub fn set_status_up_to_date(&self, application: Address, operator: Address, up_to_date: bool) {
        let mut state = self.state.lock();
        let app = state.application(application);
        if up_to_date {
            app.stale.remove(&operator);
        } else {
            app.stale.insert(operator);
        }
    }

    /// Make registration calls from an operator fail.
    pub fn fail_registration(&self, application: Address, operator: Address) {
        let mut state = self.state.lock();
        state
            .application(application)
            .failing_registration
            .insert(operator);
    }

    pub fn register_calls(&self, application: Address, operator: Address) -> usize {
        let mut state = self.state.lock();
        let app = state.application(application);
        app.register_calls.get(&operator).copied().unwrap_or_default()
    }

    pub fn update_calls(&self, application: Address, operator: Address) -> usize {
        let mut state = self.state.lock();
        let app = state.application(application);
        app.update_calls.get(&operator).copied().unwrap_or_default()
    }

    pub fn is_registered(&self, application: Address, operator: Address) -> bool {
        let mut state = self.state.lock();
        let block = state.block;
        state
            .application(application)
            .registered
            .get(&operator)
            .map(|confirmed_at| block >= *confirmed_at)
            .unwrap_or(false)
    }

    fn subscribe<T, F>(&self, select: F) -> Result<Subscription<T>, ChainError>
    where
        T: Clone,
        F: Fn(&mut State) -> Result<&mut Subscribers<T>, ChainError> + Clone + Send + 'static,
    {
        let (sender, receiver) = channel::unbounded();
        let id = {
            let mut state = self.state.lock();
            let id = state.subscriber_id();
            select(&mut state)?.add(id, sender);
            id
        };
        let shared = self.state.clone();
        Ok(Subscription::new(receiver, move || {
            if let Ok(subscribers) = select(&mut shared.lock()) {
                subscribers.remove(id);
            }
        }))
    }
}

#[async_trait]
impl BlockCounter for LocalChain {
    fn watch_blocks(&self) -> Receiver<u64> {
        let (sender, receiver) = channel::unbounded();
        self.state.lock().block_watchers.push(sender);
        receiver
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.block_height())
    }

    async fn wait_for_block_height(&self, height: u64) -> Result<(), ChainError> {
        loop {
            if self.block_height() >= height {
                return Ok(());
            }
            let listener = self.blocks.listen();
            if self.block_height() >= height {
                return Ok(());
            }
            listener.await;
        }
    }
}

/// A connection to a [LocalChain], for one operator.
#[derive(Clone)]
pub struct LocalChainHandle {
    chain: LocalChain,
    operator: Address,
}

impl LocalChainHandle {
    pub fn chain(&self) -> &LocalChain {
        &self.chain
    }
}

#[async_trait]
impl ChainHandle for LocalChainHandle {
    fn address(&self) -> Address {
        self.operator
    }

    fn block_counter(&self) -> Arc<dyn BlockCounter> {
        Arc::new(self.chain.clone())
    }

    async fn on_keep_created(&self) -> Result<Subscription<KeepCreatedEvent>, ChainError> {
        self.chain.subscribe(|state| Ok(&mut state.keep_created))
    }

    async fn on_signature_requested(
        &self,
        keep: Address,
    ) -> Result<Subscription<SignatureRequestedEvent>, ChainError> {
        self.chain
            .subscribe(move |state| state.keep(keep).map(|k| &mut k.signature_requested))
    }

    async fn on_keep_closed(
        &self,
        keep: Address,
    ) -> Result<Subscription<KeepClosedEvent>, ChainError> {
        self.chain
            .subscribe(move |state| state.keep(keep).map(|k| &mut k.keep_closed))
    }

    async fn is_active(&self, keep: Address) -> Result<bool, ChainError> {
        let mut state = self.chain.state.lock();
        let keep_state = state.keep(keep)?;
        if keep_state.fail_activity_checks {
            return Err(ChainError::Unavailable(format!(
                "cannot read state of keep {keep}"
            )));
        }
        Ok(keep_state.active)
    }

    async fn is_member(&self, keep: Address, operator: Address) -> Result<bool, ChainError> {
        let mut state = self.chain.state.lock();
        Ok(state.keep(keep)?.members.contains(&operator))
    }

    async fn submit_keep_public_key(
        &self,
        keep: Address,
        public_key: &PublicKey,
    ) -> Result<(), ChainError> {
        let mut state = self.chain.state.lock();
        let keep_state = state.keep(keep)?;
        if !keep_state.members.contains(&self.operator) {
            return Err(ChainError::Rejected(format!(
                "{} is not a member of keep {keep}",
                self.operator
            )));
        }
        if let Some((_, existing)) = keep_state.public_keys.first() {
            if existing != public_key {
                return Err(ChainError::Rejected(format!(
                    "public key for keep {keep} does not match other members"
                )));
            }
        }
        keep_state.public_keys.push((self.operator, *public_key));
        Ok(())
    }

    async fn submit_signature(
        &self,
        keep: Address,
        signature: &Signature,
    ) -> Result<(), ChainError> {
        let mut state = self.chain.state.lock();
        let keep_state = state.keep(keep)?;
        if !keep_state.members.contains(&self.operator) {
            return Err(ChainError::Rejected(format!(
                "{} is not a member of keep {keep}",
                self.operator
            )));
        }
        keep_state.signatures.push((self.operator, *signature));
        Ok(())
    }

    async fn is_registered_for_application(
        &self,
        application: Address,
    ) -> Result<bool, ChainError> {
        Ok(self.chain.is_registered(application, self.operator))
    }

    async fn is_eligible_for_application(&self, application: Address) -> Result<bool, ChainError> {
        let mut state = self.chain.state.lock();
        Ok(state.application(application).eligible.contains(&self.operator))
    }

    async fn register_as_member_candidate(&self, application: Address) -> Result<(), ChainError> {
        let mut state = self.chain.state.lock();
        let confirmed_at = state.block + state.confirmation_blocks;
        let app = state.application(application);
        *app.register_calls.entry(self.operator).or_default() += 1;
        if app.failing_registration.contains(&self.operator) {
            return Err(ChainError::Rejected(format!(
                "registration of {} refused",
                self.operator
            )));
        }
        app.registered.insert(self.operator, confirmed_at);
        Ok(())
    }

    async fn is_status_up_to_date_for_application(
        &self,
        application: Address,
    ) -> Result<bool, ChainError> {
        let mut state = self.chain.state.lock();
        Ok(!state.application(application).stale.contains(&self.operator))
    }

    async fn update_status_for_application(
        &self,
        application: Address,
    ) -> Result<(), ChainError> {
        let mut state = self.chain.state.lock();
        let app = state.application(application);
        *app.update_calls.entry(self.operator).or_default() += 1;
        if !app.registered.contains_key(&self.operator) {
            return Err(ChainError::Rejected(format!(
                "{} is not registered",
                self.operator
            )));
        }
        app.stale.remove(&self.operator);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn operator(x: u8) -> Address {
        Address::from([x; 20])
    }

    #[test]
    fn test_keep_events_reach_subscribers() {
        let chain = LocalChain::new();
        let handle = chain.connect(operator(1));
        smol::block_on(async {
            let mut created = handle.on_keep_created().await.unwrap();
            let keep = chain.create_keep(vec![operator(1), operator(2)]);
            let event = created.next().await.unwrap();
            assert_eq!(event.keep_address, keep);
            assert!(event.is_member(operator(2)));
            assert!(!event.is_member(operator(3)));

            let mut requested = handle.on_signature_requested(keep).await.unwrap();
            let mut closed = handle.on_keep_closed(keep).await.unwrap();
            chain.request_signature(keep, [7; 32]).unwrap();
            assert_eq!(requested.next().await.unwrap().digest, [7; 32]);

            chain.close_keep(keep).unwrap();
            assert_eq!(closed.next().await.unwrap().keep_address, keep);
            assert!(!handle.is_active(keep).await.unwrap());
            assert!(chain.request_signature(keep, [8; 32]).is_err());

            requested.unsubscribe();
            closed.unsubscribe();
            assert_eq!(chain.signature_subscriptions(keep), 0);
            assert_eq!(chain.keep_closed_subscriptions(keep), 0);
        });
    }

    #[test]
    fn test_registration_needs_confirmation() {
        let chain = LocalChain::new();
        let app = operator(0xaa);
        let handle = chain.connect(operator(1));
        smol::block_on(async {
            handle.register_as_member_candidate(app).await.unwrap();
            assert!(!handle.is_registered_for_application(app).await.unwrap());
            chain.mine_blocks(DEFAULT_CONFIRMATION_BLOCKS);
            assert!(handle.is_registered_for_application(app).await.unwrap());
            assert_eq!(chain.register_calls(app, operator(1)), 1);
        });
    }

    #[test]
    fn test_wait_for_block_height() {
        let chain = LocalChain::new();
        let waiter = chain.clone();
        let blocks = chain.watch_blocks();
        let task = smol::spawn(async move { waiter.wait_for_block_height(3).await });
        chain.mine_blocks(3);
        smol::block_on(async {
            task.await.unwrap();
            assert_eq!(blocks.recv().await.unwrap(), 1);
            assert_eq!(blocks.recv().await.unwrap(), 2);
            assert_eq!(chain.current_block().await.unwrap(), 3);
        });
    }
}
