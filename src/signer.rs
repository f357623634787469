//! One operator's durable share of a keep's key.
use std::fmt;

use k256::{AffinePoint, ProjectivePoint};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::{
    chain::Address,
    compat,
    ecdsa::PublicKey,
    keygen::KeygenOutput,
    protocol::{InitializationError, Participant, Protocol},
    serde::{decode, encode},
    sign::{sign, FullSignature},
};

/// Represents an error with the key material of a signer.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("malformed signer data: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid group parameters: {0}")]
    InvalidParameters(String),
    #[error("failed to initialize signing: {0}")]
    Initialization(#[from] InitializationError),
}

/// How the members of a keep take part in its protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParameters {
    /// Every participant of the keep, in member order.
    pub participants: Vec<Participant>,
    /// How many shares it takes to reconstruct the key.
    pub threshold: usize,
    /// This operator's participant.
    pub me: Participant,
}

impl GroupParameters {
    /// The parameters used for a keep of `participants`.
    ///
    /// The threshold is the smallest one letting every member sign together
    /// under an honest majority.
    pub fn for_members(participants: Vec<Participant>, me: Participant) -> Self {
        let threshold = (participants.len() + 1) / 2;
        Self {
            participants,
            threshold,
            me,
        }
    }

    pub fn validate(&self) -> Result<(), SignerError> {
        let n = self.participants.len();
        if n == 0 {
            return Err(SignerError::InvalidParameters(
                "no participants".to_string(),
            ));
        }
        if self.threshold == 0 || self.threshold > (n + 1) / 2 {
            return Err(SignerError::InvalidParameters(format!(
                "threshold {} does not fit {} participants",
                self.threshold, n
            )));
        }
        if !self.participants.contains(&self.me) {
            return Err(SignerError::InvalidParameters(format!(
                "{} is not a participant",
                self.me
            )));
        }
        Ok(())
    }
}

/// A signer for one keep, holding this operator's key share.
///
/// Signers are immutable once key generation has produced them.
#[derive(Clone, Serialize, Deserialize)]
pub struct ThresholdSigner {
    keep_address: Address,
    group: GroupParameters,
    key_share: KeygenOutput,
}

impl ThresholdSigner {
    pub fn new(
        keep_address: Address,
        group: GroupParameters,
        key_share: KeygenOutput,
    ) -> Result<Self, SignerError> {
        let signer = Self {
            keep_address,
            group,
            key_share,
        };
        signer.validate()?;
        Ok(signer)
    }

    fn validate(&self) -> Result<(), SignerError> {
        self.group.validate()?;
        if ProjectivePoint::from(self.key_share.public_key) == ProjectivePoint::IDENTITY {
            return Err(SignerError::InvalidParameters(
                "public key is the identity".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a signer from bytes produced by [ThresholdSigner::to_bytes].
    pub fn from_bytes(data: &[u8]) -> Result<Self, SignerError> {
        let signer: Self = decode(data)?;
        signer.validate()?;
        Ok(signer)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn keep_address(&self) -> Address {
        self.keep_address
    }

    pub fn group(&self) -> &GroupParameters {
        &self.group
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.key_share.public_key)
    }

    pub fn public_key_point(&self) -> AffinePoint {
        self.key_share.public_key
    }

    /// Create the protocol computing this signer's part of a signature.
    pub fn initialize_signing(
        &self,
        digest: &[u8; 32],
        rng: impl CryptoRngCore + Send + 'static,
    ) -> Result<impl Protocol<Output = FullSignature> + Send, SignerError> {
        let protocol = sign(
            &self.group.participants,
            self.group.me,
            self.key_share.clone(),
            self.group.threshold,
            compat::scalar_from_digest(digest),
            rng,
        )?;
        Ok(protocol)
    }
}

impl fmt::Debug for ThresholdSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdSigner")
            .field("keep_address", &self.keep_address)
            .field("group", &self.group)
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use rand_core::OsRng;

    use super::*;
    use crate::keygen::keygen;
    use crate::protocol::run_protocol;

    fn single_signer() -> ThresholdSigner {
        let me = Participant::from(0u32);
        let protocol = keygen(&[me], me, 1, OsRng).unwrap();
        let protocol: Box<dyn Protocol<Output = KeygenOutput> + Send> = Box::new(protocol);
        let (_, key_share) = run_protocol(vec![(me, protocol)]).unwrap().remove(0);
        ThresholdSigner::new(
            Address::from([1; 20]),
            GroupParameters::for_members(vec![me], me),
            key_share,
        )
        .unwrap()
    }

    #[test]
    fn test_group_parameters_policy() {
        let members: Vec<Participant> = (0u32..5).map(Participant::from).collect();
        let group = GroupParameters::for_members(members.clone(), members[2]);
        assert_eq!(group.threshold, 3);
        assert!(group.validate().is_ok());

        let stranger = GroupParameters::for_members(members.clone(), Participant::from(9u32));
        assert!(stranger.validate().is_err());

        for threshold in [0, 4, usize::MAX] {
            let group = GroupParameters {
                threshold,
                ..GroupParameters::for_members(members.clone(), members[0])
            };
            assert!(group.validate().is_err());
        }
    }

    #[test]
    fn test_signer_bytes() {
        let signer = single_signer();
        let loaded = ThresholdSigner::from_bytes(&signer.to_bytes()).unwrap();
        assert_eq!(loaded.keep_address(), signer.keep_address());
        assert_eq!(loaded.public_key(), signer.public_key());
        assert_eq!(loaded.group(), signer.group());

        assert!(ThresholdSigner::from_bytes(b"not a signer").is_err());
    }

    #[test]
    fn test_debug_hides_share() {
        let signer = single_signer();
        let shown = format!("{signer:?}");
        assert!(!shown.contains("private_share"));
        assert!(shown.contains("keep_address"));
    }
}
