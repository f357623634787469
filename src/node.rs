//! The protocols a member runs for its keeps, over the network.
use std::{sync::Arc, time::Duration};

use rand_core::OsRng;
use tracing::{debug, info};

use crate::{
    announce::announce,
    chain::{Address, ChainError, ChainHandle},
    ecdsa::Signature,
    keygen::keygen,
    net::{
        bridge::{ExecutionError, NetworkBridge},
        SessionId, Transport, TransportError,
    },
    protocol::{InitializationError, Participant},
    session::{SessionError, SigningSession},
    signer::{GroupParameters, SignerError, ThresholdSigner},
};

/// Represents an error which can happen when running a keep protocol.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to initialize protocol: {0}")]
    Initialization(#[from] InitializationError),
    #[error("failed to attach to session: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("chain request failed: {0}")]
    Chain(#[from] ChainError),
}

/// Runs the multi-party protocols of this operator.
#[derive(Clone)]
pub struct Node {
    chain: Arc<dyn ChainHandle>,
    transport: Arc<dyn Transport>,
    announce_timeout: Duration,
    protocol_timeout: Duration,
}

impl Node {
    pub fn new(
        chain: Arc<dyn ChainHandle>,
        transport: Arc<dyn Transport>,
        announce_timeout: Duration,
        protocol_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            transport,
            announce_timeout,
            protocol_timeout,
        }
    }

    /// Announce this operator to the other members of a keep.
    ///
    /// Returns our participant, along with every participant of the keep,
    /// once all the members have been heard from.
    pub async fn announce_signer_presence(
        &self,
        keep: Address,
        members: &[Address],
    ) -> Result<(Participant, Vec<Participant>), NodeError> {
        let (me, protocol) = announce(members, self.chain.address())?;
        let all: Vec<Participant> = (0..members.len() as u32).map(Participant::from).collect();
        let bridge = NetworkBridge::attach(
            self.transport.clone(),
            SessionId::announcement(keep),
            me,
            &all,
        )
        .await?;
        debug!(keep = %keep, me = %me, "announcing presence");
        let participants = bridge.execute(protocol, self.announce_timeout).await?;
        Ok((me, participants))
    }

    /// Generate a key for a keep together with its other members, and
    /// publish the resulting public key.
    pub async fn generate_signer_for_keep(
        &self,
        keep: Address,
        me: Participant,
        participants: Vec<Participant>,
    ) -> Result<ThresholdSigner, NodeError> {
        let group = GroupParameters::for_members(participants, me);
        group.validate()?;
        let protocol = keygen(&group.participants, me, group.threshold, OsRng)?;
        let bridge = NetworkBridge::attach(
            self.transport.clone(),
            SessionId::key_generation(keep),
            me,
            &group.participants,
        )
        .await?;
        let key_share = bridge.execute(protocol, self.protocol_timeout).await?;
        let signer = ThresholdSigner::new(keep, group, key_share)?;

        self.chain
            .submit_keep_public_key(keep, &signer.public_key())
            .await?;
        info!(keep = %keep, "submitted keep public key");
        Ok(signer)
    }

    /// Sign a digest for a keep, and publish the signature.
    pub async fn calculate_signature(
        &self,
        signer: Arc<ThresholdSigner>,
        digest: [u8; 32],
    ) -> Result<Signature, NodeError> {
        let keep = signer.keep_address();
        let session = SigningSession::initialize(
            signer,
            digest,
            self.transport.clone(),
            self.protocol_timeout,
            OsRng,
        )
        .await?;
        let signature = session.sign().await?;

        self.chain.submit_signature(keep, &signature).await?;
        info!(keep = %keep, digest = %hex::encode(digest), "submitted signature");
        Ok(signature)
    }
}
