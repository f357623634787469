use std::{sync::Arc, time::Duration};

use rand_core::CryptoRngCore;
use tracing::{debug, info};

use crate::{
    ecdsa::Signature,
    net::{
        bridge::{ExecutionError, NetworkBridge},
        SessionId, Transport, TransportError,
    },
    protocol::Protocol,
    sign::FullSignature,
    signer::{SignerError, ThresholdSigner},
};

/// Represents an error which can happen during a signing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to initialize signing: {0}")]
    Initialize(#[from] SignerError),
    #[error("failed to attach network bridge: {0}")]
    Attach(#[from] TransportError),
    #[error("failed to sign: {0}")]
    Sign(#[from] ExecutionError),
}

/// One run of the signing protocol, for one digest.
///
/// A session can only be run once, since [SigningSession::sign] consumes it.
pub struct SigningSession {
    digest: [u8; 32],
    signer: Arc<ThresholdSigner>,
    protocol: Box<dyn Protocol<Output = FullSignature> + Send>,
    bridge: NetworkBridge,
    timeout: Duration,
}

impl SigningSession {
    /// Prepare a session signing `digest` with `signer`.
    ///
    /// This fails if the signer's key material can't be used, or if the
    /// transport refuses the session.
    pub async fn initialize(
        signer: Arc<ThresholdSigner>,
        digest: [u8; 32],
        transport: Arc<dyn Transport>,
        timeout: Duration,
        rng: impl CryptoRngCore + Send + 'static,
    ) -> Result<Self, SessionError> {
        let protocol = Box::new(signer.initialize_signing(&digest, rng)?);
        let session = SessionId::signing(signer.keep_address(), &digest);
        let group = signer.group();
        let bridge = NetworkBridge::attach(transport, session, group.me, &group.participants).await?;

        Ok(Self {
            digest,
            signer,
            protocol,
            bridge,
            timeout,
        })
    }

    /// Run the protocol until we either have a signature, or an error.
    pub async fn sign(self) -> Result<Signature, SessionError> {
        let keep = self.signer.keep_address();
        let digest = hex::encode(self.digest);
        debug!(keep = %keep, digest = %digest, "starting signing session");

        let full = self.bridge.execute(self.protocol, self.timeout).await?;
        let signature = Signature::from_full(&full);
        info!(
            keep = %keep,
            digest = %digest,
            recovery_id = signature.recovery_id,
            "signature calculated"
        );
        Ok(signature)
    }
}
