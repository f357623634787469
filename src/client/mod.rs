//! The keep client: ties chain events to the protocols this operator runs.
//!
//! On start, the client loads the signers it already has, resumes watching
//! the keeps which are still active, and archives the others. It then reacts
//! to new keeps by generating a signer with the other members, and to
//! signature requests by running a signing session. Alongside, one
//! registration task per sanctioned application keeps the operator in the
//! selection pool.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use smol::{future, Task};
use tracing::{debug, error, info, warn};

use crate::{
    cancel::Cancellation,
    chain::{
        Address, ChainError, ChainHandle, KeepClosedEvent, KeepCreatedEvent,
        SignatureRequestedEvent, Subscription,
    },
    config::{ClientConfig, Config},
    net::Transport,
    node::Node,
    registry::{KeepsRegistry, RegistryError},
    signer::ThresholdSigner,
    storage::{FileKeyStore, KeyStore, StorageError},
};

mod registration;

pub use registration::RegistrationState;
use registration::RegistrationMonitor;

/// Represents an error which prevents the client from starting.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to load keeps: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to watch for new keeps: {0}")]
    Chain(#[from] ChainError),
    #[error("failed to open key store: {0}")]
    Storage(#[from] StorageError),
}

struct Inner {
    chain: Arc<dyn ChainHandle>,
    node: Node,
    registry: KeepsRegistry,
    /// Keeps whose events are being watched, with the token stopping the watch.
    monitored: Mutex<HashMap<Address, Cancellation>>,
    /// Keeps whose signer is being generated.
    in_setup: Mutex<HashSet<Address>>,
    cancel: Cancellation,
}

/// A running keep client.
///
/// The client runs until the token given to [Client::initialize] is
/// cancelled, or until [Client::shutdown].
pub struct Client {
    inner: Arc<Inner>,
    keep_created: Task<()>,
    registrations: Vec<RegistrationMonitor>,
}

impl Client {
    /// Start the client.
    ///
    /// Everything the client spawns stops once `cancel` is cancelled,
    /// except signing sessions which are already running.
    pub async fn initialize(
        cancel: &Cancellation,
        config: &ClientConfig,
        chain: Arc<dyn ChainHandle>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyStore>,
    ) -> Result<Self, ClientError> {
        let cancel = cancel.child();
        let registry = KeepsRegistry::new(store);
        registry.load_existing_keeps()?;

        let node = Node::new(
            chain.clone(),
            transport,
            config.announce_timeout(),
            config.protocol_timeout(),
        );
        let inner = Arc::new(Inner {
            chain: chain.clone(),
            node,
            registry,
            monitored: Mutex::new(HashMap::new()),
            in_setup: Mutex::new(HashSet::new()),
            cancel: cancel.clone(),
        });

        inner.resume_existing_keeps().await;

        let subscription = chain.on_keep_created().await?;
        let keep_created = smol::spawn(watch_new_keeps(inner.clone(), subscription));

        let registrations = config
            .sanctioned_applications
            .iter()
            .map(|application| {
                RegistrationMonitor::spawn(
                    cancel.child(),
                    chain.clone(),
                    *application,
                    config.registration_check_interval_blocks,
                )
            })
            .collect();

        info!(operator = %chain.address(), "client initialized");
        Ok(Self {
            inner,
            keep_created,
            registrations,
        })
    }

    /// Start the client, with signers stored in the configured data directory.
    pub async fn from_config(
        cancel: &Cancellation,
        config: &Config,
        chain: Arc<dyn ChainHandle>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let store = FileKeyStore::open(&config.storage.data_dir)?;
        info!(data_dir = %config.storage.data_dir.display(), "opened key store");
        Self::initialize(cancel, &config.client, chain, transport, Arc::new(store)).await
    }

    pub fn registry(&self) -> &KeepsRegistry {
        &self.inner.registry
    }

    pub fn registration_state(&self, application: Address) -> Option<RegistrationState> {
        self.registrations
            .iter()
            .find(|r| r.application == application)
            .map(|r| r.state.get())
    }

    /// Check whether the events of a keep are being watched.
    pub fn is_monitoring(&self, keep: Address) -> bool {
        self.inner.monitored.lock().contains_key(&keep)
    }

    /// Stop every task of the client, and wait for them.
    pub async fn shutdown(self) {
        self.inner.cancel.cancel();
        self.keep_created.await;
        for registration in self.registrations {
            registration.task.await;
        }
    }
}

impl Inner {
    /// Watch the keeps we have signers for, archiving the ones now closed.
    async fn resume_existing_keeps(self: &Arc<Self>) {
        let mut keeps = Vec::new();
        self.registry
            .for_each_keep(|keep, signers| keeps.push((keep, signers.to_vec())));

        for (keep, signers) in keeps {
            for signer in signers {
                match self.chain.is_active(keep).await {
                    Ok(true) => {
                        if self.is_member(keep).await {
                            self.start_monitoring(keep, signer).await;
                            debug!(keep = %keep, "signer registered for events from keep");
                        }
                    }
                    Ok(false) => {
                        info!(keep = %keep, "keep is no longer active; archiving");
                        if let Err(e) = self.registry.unregister_keep(keep) {
                            error!(keep = %keep, error = %e, "failed to archive keep");
                        }
                    }
                    Err(e) => {
                        error!(
                            keep = %keep,
                            error = %e,
                            "failed to verify if keep is still active; skipping its events"
                        );
                    }
                }
            }
        }
    }

    /// Check the chain still lists this operator as a member of a stored keep.
    async fn is_member(&self, keep: Address) -> bool {
        let operator = self.chain.address();
        match self.chain.is_member(keep, operator).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    keep = %keep,
                    operator = %operator,
                    "operator is not a member of stored keep; skipping its events"
                );
                false
            }
            Err(e) => {
                error!(
                    keep = %keep,
                    error = %e,
                    "failed to check keep membership; skipping its events"
                );
                false
            }
        }
    }

    /// Generate and register the signer of a keep we are a member of.
    async fn set_up_keep(self: Arc<Self>, event: KeepCreatedEvent) {
        let keep = event.keep_address;
        if self.registry.contains(keep) || !self.in_setup.lock().insert(keep) {
            debug!(keep = %keep, "ignoring repeated keep creation");
            return;
        }
        info!(
            keep = %keep,
            operator = %self.chain.address(),
            "member is starting signer generation for keep"
        );

        let result = self.generate_signer(&event).await;
        self.in_setup.lock().remove(&keep);
        let signer = match result {
            Ok(signer) => signer,
            Err(e) => {
                error!(keep = %keep, error = %e, "signer generation failed");
                return;
            }
        };
        info!(keep = %keep, "initialized signer for keep");

        if let Err(e) = self.registry.register_signer(keep, signer.clone()) {
            error!(keep = %keep, error = %e, "failed to register threshold signer");
            return;
        }
        self.start_monitoring(keep, signer).await;
    }

    async fn generate_signer(
        &self,
        event: &KeepCreatedEvent,
    ) -> Result<Arc<ThresholdSigner>, crate::node::NodeError> {
        let keep = event.keep_address;
        let (me, participants) = self
            .node
            .announce_signer_presence(keep, &event.members)
            .await?;
        let signer = self
            .node
            .generate_signer_for_keep(keep, me, participants)
            .await?;
        Ok(Arc::new(signer))
    }

    /// Subscribe to the events of a keep, and spawn the task handling them.
    ///
    /// A keep already being watched is left alone.
    async fn start_monitoring(self: &Arc<Self>, keep: Address, signer: Arc<ThresholdSigner>) {
        let cancel = {
            let mut monitored = self.monitored.lock();
            if monitored.contains_key(&keep) {
                debug!(keep = %keep, "keep is already monitored");
                return;
            }
            let cancel = self.cancel.child();
            monitored.insert(keep, cancel.clone());
            cancel
        };

        let subscriptions = async {
            let signatures = self.chain.on_signature_requested(keep).await?;
            let closed = self.chain.on_keep_closed(keep).await?;
            Ok::<_, ChainError>((signatures, closed))
        };
        match subscriptions.await {
            Ok((signatures, closed)) => {
                smol::spawn(self.clone().monitor_keep(keep, signer, signatures, closed, cancel))
                    .detach();
            }
            Err(e) => {
                error!(keep = %keep, error = %e, "failed to subscribe to keep events");
                self.monitored.lock().remove(&keep);
            }
        }
    }

    /// Handle the events of one keep, until it is closed.
    async fn monitor_keep(
        self: Arc<Self>,
        keep: Address,
        signer: Arc<ThresholdSigner>,
        mut signatures: Subscription<SignatureRequestedEvent>,
        mut closed: Subscription<KeepClosedEvent>,
        cancel: Cancellation,
    ) {
        enum KeepEvent {
            Closed(Option<KeepClosedEvent>),
            SignatureRequested(Option<SignatureRequestedEvent>),
        }

        loop {
            // Closing is checked first, so a closed keep starts no new sessions.
            let event = cancel
                .run_until_cancelled(future::or(
                    async { KeepEvent::Closed(closed.next().await) },
                    async { KeepEvent::SignatureRequested(signatures.next().await) },
                ))
                .await;

            match event {
                None => break,
                Some(KeepEvent::Closed(Some(_))) => {
                    info!(keep = %keep, "keep is being closed");
                    if let Err(e) = self.registry.unregister_keep(keep) {
                        error!(keep = %keep, error = %e, "failed to unregister keep");
                    }
                    break;
                }
                Some(KeepEvent::SignatureRequested(Some(request))) => {
                    info!(
                        keep = %keep,
                        digest = %hex::encode(request.digest),
                        "new signature requested from keep"
                    );
                    let node = self.node.clone();
                    let signer = signer.clone();
                    smol::spawn(async move {
                        if let Err(e) = node.calculate_signature(signer, request.digest).await {
                            error!(keep = %keep, error = %e, "signature calculation failed");
                        }
                    })
                    .detach();
                }
                Some(KeepEvent::Closed(None)) | Some(KeepEvent::SignatureRequested(None)) => {
                    warn!(keep = %keep, "keep event subscription ended");
                    break;
                }
            }
        }

        signatures.unsubscribe();
        closed.unsubscribe();
        self.monitored.lock().remove(&keep);
        info!(keep = %keep, "unsubscribed from keep events");
    }
}

async fn watch_new_keeps(inner: Arc<Inner>, mut subscription: Subscription<KeepCreatedEvent>) {
    let operator = inner.chain.address();
    while let Some(Some(event)) = inner
        .cancel
        .run_until_cancelled(subscription.next())
        .await
    {
        info!(
            keep = %event.keep_address,
            members = event.members.len(),
            "new keep created"
        );
        if event.is_member(operator) {
            smol::spawn(inner.clone().set_up_keep(event)).detach();
        }
    }
    subscription.unsubscribe();
}
